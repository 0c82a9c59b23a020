//! The uniform target façade (component I, §4.I): one set of operations
//! covering Cortex-M, Cortex-R, and RISC-V harts, so a GDB-layer
//! collaborator never needs to know which architecture it's talking to.

use crate::error::Error;
use crate::link::DebugLink;

/// Why a core is currently halted (or not), unified across architectures
/// (§4.H, §4.I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Running,
    Request,
    Breakpoint,
    /// Carries the watchpoint's trigger address when the hardware reports one.
    Watchpoint(u64),
    Stepping,
    Fault,
    /// The halt cause could not be classified from the available status bits.
    Error,
}

/// Direction(s) a hardware watchpoint triggers on (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

/// A hardware breakpoint or watchpoint request (§4.I).
///
/// `reserved[0]` carries the architecture-specific hardware slot index once
/// installed; `reserved[1]` is unused (kept for wire-format parity with the
/// flash-driver side's fixed-shape request structs).
#[derive(Debug, Clone, Copy)]
pub struct BreakWatch {
    pub kind: BreakWatchKind,
    pub address: u64,
    pub size: u8,
    pub reserved: [u32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakWatchKind {
    Breakpoint,
    Watchpoint(WatchKind),
}

/// Kind of memory backing a [`MemRegion`] (§4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegionKind {
    Ram,
    Flash,
}

/// A named memory region and, for flash, the driver parameters needed to
/// program it (component J, §4.J).
#[derive(Debug, Clone)]
pub struct MemRegion {
    pub kind: MemRegionKind,
    pub start: u64,
    pub length: u64,
    pub blocksize: u32,
    pub writesize: u32,
    pub erased_byte: u8,
}

impl MemRegion {
    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.start && address.saturating_add(len) <= self.start + self.length
    }
}

/// Operations every attached core exposes uniformly (§4.I), implemented by
/// the Cortex-M/R and RISC-V hart wrappers.
pub trait CoreOps {
    fn attach(&mut self, link: &mut DebugLink) -> Result<(), Error>;
    fn detach(&mut self, link: &mut DebugLink) -> Result<(), Error>;

    fn halt_request(&mut self, link: &mut DebugLink) -> Result<(), Error>;
    fn halt_poll(&mut self, link: &mut DebugLink) -> Result<HaltReason, Error>;
    fn halt_resume(&mut self, link: &mut DebugLink, step: bool) -> Result<(), Error>;

    /// The general register file, in architecture-defined order.
    fn regs_read(&mut self, link: &mut DebugLink) -> Result<Vec<u32>, Error>;
    fn reg_read(&mut self, link: &mut DebugLink, index: u16) -> Result<u32, Error>;
    fn reg_write(&mut self, link: &mut DebugLink, index: u16, value: u32) -> Result<(), Error>;

    /// Writes the whole register file in the same order [`Self::regs_read`]
    /// returns it in (§4.I).
    fn regs_write(&mut self, link: &mut DebugLink, values: &[u32]) -> Result<(), Error> {
        for (index, &value) in values.iter().enumerate() {
            self.reg_write(link, index as u16, value)?;
        }
        Ok(())
    }

    fn mem_read(&mut self, link: &mut DebugLink, address: u64, buf: &mut [u8]) -> Result<(), Error>;
    fn mem_write(&mut self, link: &mut DebugLink, address: u64, buf: &[u8]) -> Result<(), Error>;

    /// Installs a breakpoint or watchpoint, returning it with
    /// `reserved[0]` set to the hardware slot used (§4.I invariant:
    /// addresses must be unique among currently-installed break/watchpoints).
    fn breakwatch_set(&mut self, link: &mut DebugLink, bw: BreakWatch) -> Result<BreakWatch, Error>;
    fn breakwatch_clear(&mut self, link: &mut DebugLink, bw: &BreakWatch) -> Result<(), Error>;

    /// Returns and clears any sticky architectural fault state (§4.I).
    fn check_error(&mut self, link: &mut DebugLink) -> Result<Option<String>, Error>;

    /// Erases the whole chip, gated on explicit caller confirmation (§7
    /// `MissingPermissions`). The actual erase sequence is chip-specific and
    /// lives in a [`crate::flash::FlashDriver`]; the default here only
    /// enforces the permission gate and reports that no generic sequence
    /// exists without one.
    fn mass_erase(&mut self, link: &mut DebugLink, confirmed: bool) -> Result<(), Error> {
        if !confirmed {
            return Err(Error::MissingPermissions("mass erase requires explicit confirmation".into()));
        }
        let _ = link;
        Err(Error::Other("no chip-specific mass-erase sequence is registered for this core".into()))
    }
}

pub mod cortex_target;
pub mod riscv_target;

pub use cortex_target::CortexTarget;
pub use riscv_target::RiscvTarget;
