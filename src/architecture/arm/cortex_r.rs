//! Cortex-R attach and register access (§4.D), at a representative level
//! of detail: halt/resume through the external debug registers, and
//! GPR access via the `MRC`/`MCR` instruction-execute dance (`ITR`).
//!
//! Memory-mapped external debug register offsets, relative to the
//! per-core debug component base address discovered via the ROM table
//! (`AccessPort::base_address`).

use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::HaltReason;
use crate::link::DebugLink;

use super::ap::{AccessPort, TransferWidth};
use super::ArmError;

const DBGDTRRX: u64 = 0x080; // host -> core
const DBGITR: u64 = 0x084;
const DBGDTRTX: u64 = 0x08C; // core -> host
const DBGDSCR: u64 = 0x088;
const DBGDRCR: u64 = 0x090;
const DBGPCSR: u64 = 0x0A0;

const DSCR_HALTED: u32 = 1 << 0;
const DSCR_RESTARTED: u32 = 1 << 1;
const DSCR_MOE_MASK: u32 = 0xF << 2;
const DSCR_MOE_BKPT: u32 = 0x1 << 2;
const DSCR_MOE_WATCH: u32 = 0x2 << 2;
const DSCR_ITR_ENABLE: u32 = 1 << 13;
const DSCR_EXT_DCC_MODE_STALL: u32 = 0b01 << 20;

const DRCR_HALT_REQ: u32 = 1 << 0;
const DRCR_RESTART_REQ: u32 = 1 << 1;
const DRCR_CLR_STICKY_EXC: u32 = 1 << 2;

const RESUME_POLL_BUDGET: Duration = Duration::from_millis(250);

/// `MRC p14, 0, rX, c0, c5, 0` reads `DBGDTRTXint` into `rX`; `MCR` is the
/// inverse. The opcode only varies in the destination/source register field.
fn mrc_opcode(rd: u8) -> u32 {
    0xEE10_0E15 | ((rd as u32) << 12)
}
fn mcr_opcode(rd: u8) -> u32 {
    0xEE00_0E15 | ((rd as u32) << 12)
}

/// A Cortex-R core reached through its external debug component.
pub struct CortexR {
    pub ap: AccessPort,
    debug_base: u64,
    has_fpu: bool,
}

impl CortexR {
    pub fn attach(mut ap: AccessPort, link: &mut DebugLink, debug_base: u64) -> Result<Self, ArmError> {
        let dscr = ap.read_transfer(link, debug_base + DBGDSCR, TransferWidth::Word)?;
        ap.write_transfer(
            link,
            debug_base + DBGDSCR,
            TransferWidth::Word,
            dscr | DSCR_ITR_ENABLE | DSCR_EXT_DCC_MODE_STALL,
        )?;
        ap.write_transfer(link, debug_base + DBGDRCR, TransferWidth::Word, DRCR_HALT_REQ)?;

        let has_fpu = Self::detect_fpu(&mut ap, link, debug_base)?;
        debug!(has_fpu, "Cortex-R attached");
        Ok(Self { ap, debug_base, has_fpu })
    }

    fn detect_fpu(ap: &mut AccessPort, link: &mut DebugLink, debug_base: u64) -> Result<bool, ArmError> {
        // CPACR: read via MRC p15,0,r0,c1,c0,2, then check CP10/CP11 fields are non-zero.
        Self::execute_mrc_coproc(ap, link, debug_base, 0xEE11_0F50)
            .map(|cpacr| (cpacr >> 20) & 0xF != 0)
    }

    fn execute_mrc_coproc(ap: &mut AccessPort, link: &mut DebugLink, debug_base: u64, instr: u32) -> Result<u32, ArmError> {
        ap.write_transfer(link, debug_base + DBGITR, TransferWidth::Word, instr)?;
        ap.write_transfer(link, debug_base + DBGITR, TransferWidth::Word, mrc_opcode(0))?;
        ap.read_transfer(link, debug_base + DBGDTRTX, TransferWidth::Word)
    }

    pub fn halt_poll(&mut self, link: &mut DebugLink) -> Result<HaltReason, ArmError> {
        let dscr = self.ap.read_transfer(link, self.debug_base + DBGDSCR, TransferWidth::Word)?;
        if dscr & DSCR_HALTED == 0 {
            return Ok(HaltReason::Running);
        }
        match dscr & DSCR_MOE_MASK {
            DSCR_MOE_BKPT => Ok(HaltReason::Breakpoint),
            DSCR_MOE_WATCH => Ok(HaltReason::Watchpoint(0)),
            0 => Ok(HaltReason::Request),
            _ => Ok(HaltReason::Error),
        }
    }

    pub fn halt_request(&mut self, link: &mut DebugLink) -> Result<(), ArmError> {
        self.ap.write_transfer(link, self.debug_base + DBGDRCR, TransferWidth::Word, DRCR_HALT_REQ)
    }

    /// Resumes, polling `DSCR.RESTARTED` within a 250ms budget (§4.D).
    pub fn halt_resume(&mut self, link: &mut DebugLink) -> Result<(), ArmError> {
        self.ap.write_transfer(
            link,
            self.debug_base + DBGDRCR,
            TransferWidth::Word,
            DRCR_CLR_STICKY_EXC | DRCR_RESTART_REQ,
        )?;
        let start = Instant::now();
        loop {
            let dscr = self.ap.read_transfer(link, self.debug_base + DBGDSCR, TransferWidth::Word)?;
            if dscr & DSCR_RESTARTED != 0 {
                return Ok(());
            }
            if start.elapsed() > RESUME_POLL_BUDGET {
                return Err(ArmError::Timeout);
            }
        }
    }

    /// Reads `rX` via the `MCR`-into-`DBGDTRTX` instruction-execute dance.
    pub fn reg_read(&mut self, link: &mut DebugLink, reg: u8) -> Result<u32, ArmError> {
        self.ap.write_transfer(link, self.debug_base + DBGITR, TransferWidth::Word, mcr_opcode(reg))?;
        self.ap.read_transfer(link, self.debug_base + DBGDTRTX, TransferWidth::Word)
    }

    /// Writes `rX` via `DBGDTRRX` then the `MRC`-from-`DBGDTRRX` dance.
    pub fn reg_write(&mut self, link: &mut DebugLink, reg: u8, value: u32) -> Result<(), ArmError> {
        self.ap.write_transfer(link, self.debug_base + DBGDTRRX, TransferWidth::Word, value)?;
        self.ap.write_transfer(link, self.debug_base + DBGITR, TransferWidth::Word, mrc_opcode(reg))
    }

    /// `PC` as reported by halt is the address of the *next* instruction to
    /// retire; adjust by `-4` (ARM) or `-8` (Thumb fetch stage) depending on
    /// `CPSR.T`, to recover the actual faulting/halted instruction address.
    pub fn adjusted_pc(&mut self, link: &mut DebugLink, raw_pc: u32, cpsr: u32) -> u32 {
        let thumb = cpsr & (1 << 5) != 0;
        let _ = (self, link);
        if thumb {
            raw_pc.wrapping_sub(4)
        } else {
            raw_pc.wrapping_sub(8)
        }
    }

    pub fn has_fpu(&self) -> bool {
        self.has_fpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mrc_mcr_opcodes_only_vary_by_register_field() {
        assert_eq!(mrc_opcode(0) & !0xF000, mrc_opcode(1) & !0xF000);
        assert_eq!(mcr_opcode(3) >> 12 & 0xF, 3);
    }
}
