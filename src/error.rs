//! The crate-wide error type (§7).
//!
//! Each architecture keeps its own error enum (`ArmError`, `RiscvError`);
//! this is only the boundary type a GDB-layer collaborator sees once an
//! operation gives up retrying within its configured budget.

use crate::architecture::arm::ArmError;
use crate::architecture::riscv::RiscvError;
use crate::link::DebugProbeError;

/// The overarching error type returned by target-facade operations (§7).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error in the link driver itself.
    #[error("link driver error")]
    Probe(#[from] DebugProbeError),

    /// An ADIv5/ADIv6 specific error occurred.
    #[error("ARM debug error")]
    Arm(#[from] ArmError),

    /// A RISC-V External Debug specific error occurred.
    #[error("RISC-V debug error")]
    Riscv(#[from] RiscvError),

    /// The core did not halt (or resume) within its configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The operation lacked the permissions required to perform it, e.g.
    /// attempting a mass erase without explicit confirmation.
    #[error("missing permission: {0}")]
    MissingPermissions(String),

    /// Any other, non-architecture-specific error.
    #[error("{0}")]
    Other(String),
}
