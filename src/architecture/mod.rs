//! The two concrete debug-link personalities (§1): ARM ADIv5/ADIv6 and
//! RISC-V External Debug 0.13. Both sit on top of [`crate::link`] and
//! beneath [`crate::core`].

pub mod arm;
pub mod riscv;
