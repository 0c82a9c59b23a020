//! A transport-agnostic on-target debug link: ADIv5/ADIv6 Debug
//! Port/Access Port and RISC-V External Debug 0.13 engines, unified
//! behind one target façade.
//!
//! Everything here is driven through [`link::RawSwdIo`]/[`link::RawJtagIo`];
//! bit-banging the physical wire, the host-side transport, and a
//! GDB-remote-protocol front-end are all external collaborators.

pub mod architecture;
pub mod core;
pub mod error;
pub mod flash;
pub mod link;

pub use crate::core::{CoreOps, CortexTarget, HaltReason, RiscvTarget};
pub use crate::error::Error;
pub use crate::link::{DebugLink, DebugProbeError, WireProtocol};
