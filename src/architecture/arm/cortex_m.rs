//! Cortex-M attach, halt/step/register access, and FPB/DWT
//! breakpoint/watchpoint programming (§4.D, §4.H).

use tracing::{debug, trace};

use crate::core::{HaltReason, WatchKind};
use crate::link::DebugLink;

use super::ap::{AccessPort, TransferWidth};
use super::sequences::{ArmDebugSequence, DefaultArmSequence};
use super::ArmError;

const DHCSR: u64 = 0xE000_EDF0;
const DCRSR: u64 = 0xE000_EDF4;
const DCRDR: u64 = 0xE000_EDF8;
const DFSR: u64 = 0xE000_ED30;
const DEMCR: u64 = 0xE000_EDFC;

const DHCSR_DBGKEY: u32 = 0xA05F_0000;
const DHCSR_C_DEBUGEN: u32 = 1 << 0;
const DHCSR_C_HALT: u32 = 1 << 1;
const DHCSR_C_STEP: u32 = 1 << 2;
const DHCSR_C_MASKINTS: u32 = 1 << 3;
const DHCSR_S_REGRDY: u32 = 1 << 16;
const DHCSR_S_HALT: u32 = 1 << 17;
const DHCSR_S_LOCKUP: u32 = 1 << 19;

const DFSR_HALTED: u32 = 1 << 0;
const DFSR_BKPT: u32 = 1 << 1;
const DFSR_DWTTRAP: u32 = 1 << 2;

const FP_CTRL: u64 = 0xE000_2000;
const FP_COMP0: u64 = 0xE000_2008;
const FP_CTRL_KEY: u32 = 1 << 1;
const FP_CTRL_ENABLE: u32 = 1 << 0;

const DWT_CTRL: u64 = 0xE000_1000;
const DWT_COMP0: u64 = 0xE000_1020;
const DWT_MASK0: u64 = 0xE000_1024;
const DWT_FUNCTION0: u64 = 0xE000_1028;
const DWT_STRIDE: u64 = 0x10;

const DWT_FUNCTION_DISABLED: u32 = 0;
const DWT_FUNCTION_READ: u32 = 5;
const DWT_FUNCTION_WRITE: u32 = 6;
const DWT_FUNCTION_READ_WRITE: u32 = 7;
const DWT_FUNCTION_MATCHED: u32 = 1 << 24;

const REG_SP: u16 = 13;
const REG_LR: u16 = 14;
const REG_PC: u16 = 15;
const REG_XPSR: u16 = 16;
const REG_MSP: u16 = 17;
const REG_PSP: u16 = 18;

const HALT_POLL_BUDGET_MS: u64 = 500;

/// A Cortex-M core: an [`AccessPort`] plus FPB/DWT slot bookkeeping.
pub struct CortexM {
    pub ap: AccessPort,
    /// `DEMCR` as read before `cortexm_initial_halt` armed the vector catch
    /// (§3 `ap_cortexm_demcr`), kept so a caller can restore it on detach.
    prev_demcr: u32,
    num_fpb: u8,
    num_dwt: u8,
    fpb_slots: Vec<Option<u64>>,
    dwt_slots: Vec<Option<(u64, u8, WatchKind)>>,
    was_stepping: bool,
}

impl CortexM {
    /// Attaches: runs `cortexm_initial_halt` (§4.C) to enable debug and
    /// confirm the halt, then discovers FPB/DWT comparator counts.
    pub fn attach(mut ap: AccessPort, link: &mut DebugLink) -> Result<Self, ArmError> {
        let seq = DefaultArmSequence;
        let prev_demcr = seq.cortexm_initial_halt(&mut ap, link)?;

        let fp_ctrl = ap.read_transfer(link, FP_CTRL, TransferWidth::Word)?;
        let num_fpb = (((fp_ctrl >> 4) & 0xF) + (((fp_ctrl >> 12) & 0x7) << 4)) as u8;
        ap.write_transfer(link, FP_CTRL, TransferWidth::Word, fp_ctrl | FP_CTRL_KEY | FP_CTRL_ENABLE)?;

        let dwt_ctrl = ap.read_transfer(link, DWT_CTRL, TransferWidth::Word)?;
        let num_dwt = ((dwt_ctrl >> 28) & 0xF) as u8;

        debug!(num_fpb, num_dwt, "Cortex-M attached");

        Ok(Self {
            ap,
            prev_demcr,
            num_fpb,
            num_dwt,
            fpb_slots: vec![None; num_fpb as usize],
            dwt_slots: vec![None; num_dwt as usize],
            was_stepping: false,
        })
    }

    /// Restores the pre-attach `DEMCR` and leaves the core running with
    /// halt-mode debug disabled (§4.D).
    pub fn detach(&mut self, link: &mut DebugLink) -> Result<(), ArmError> {
        self.ap.write_transfer(link, DEMCR, TransferWidth::Word, self.prev_demcr)?;
        self.ap.write_transfer(link, DHCSR, TransferWidth::Word, DHCSR_DBGKEY)
    }

    /// Requests a halt without waiting for it to take effect (§4.H).
    pub fn halt_request(&mut self, link: &mut DebugLink) -> Result<(), ArmError> {
        self.ap
            .write_transfer(link, DHCSR, TransferWidth::Word, DHCSR_DBGKEY | DHCSR_C_DEBUGEN | DHCSR_C_HALT)
    }

    /// Resumes, optionally single-stepping one instruction (§4.H).
    pub fn halt_resume(&mut self, link: &mut DebugLink, step: bool) -> Result<(), ArmError> {
        self.was_stepping = step;
        let mut value = DHCSR_DBGKEY | DHCSR_C_DEBUGEN;
        if step {
            value |= DHCSR_C_STEP | DHCSR_C_MASKINTS;
        }
        self.ap.write_transfer(link, DHCSR, TransferWidth::Word, value)
    }

    /// Polls the halt state machine and classifies the cause (§4.H).
    pub fn halt_poll(&mut self, link: &mut DebugLink) -> Result<HaltReason, ArmError> {
        let dhcsr = self.ap.read_transfer(link, DHCSR, TransferWidth::Word)?;
        if dhcsr & DHCSR_S_LOCKUP != 0 {
            return Ok(HaltReason::Fault);
        }
        if dhcsr & DHCSR_S_HALT == 0 {
            return Ok(HaltReason::Running);
        }

        let dfsr = self.ap.read_transfer(link, DFSR, TransferWidth::Word)?;
        self.ap.write_transfer(link, DFSR, TransferWidth::Word, dfsr)?; // write-1-to-clear

        if dfsr & DFSR_HALTED != 0 {
            if self.was_stepping {
                self.was_stepping = false;
                return Ok(HaltReason::Stepping);
            }
            return Ok(HaltReason::Request);
        }
        if dfsr & DFSR_BKPT != 0 {
            return Ok(HaltReason::Breakpoint);
        }
        if dfsr & DFSR_DWTTRAP != 0 {
            if let Some(addr) = self.find_matched_watchpoint(link)? {
                return Ok(HaltReason::Watchpoint(addr));
            }
            return Ok(HaltReason::Watchpoint(0));
        }
        Ok(HaltReason::Fault)
    }

    fn find_matched_watchpoint(&mut self, link: &mut DebugLink) -> Result<Option<u64>, ArmError> {
        for slot in 0..self.num_dwt {
            let func_addr = DWT_FUNCTION0 + (slot as u64) * DWT_STRIDE;
            let func = self.ap.read_transfer(link, func_addr, TransferWidth::Word)?;
            if func & DWT_FUNCTION_MATCHED != 0 {
                let comp_addr = DWT_COMP0 + (slot as u64) * DWT_STRIDE;
                let addr = self.ap.read_transfer(link, comp_addr, TransferWidth::Word)? as u64;
                return Ok(Some(addr));
            }
        }
        Ok(None)
    }

    /// Reads one core register by its DCRSR register-selector number.
    pub fn reg_read(&mut self, link: &mut DebugLink, regsel: u16) -> Result<u32, ArmError> {
        self.ap
            .write_transfer(link, DCRSR, TransferWidth::Word, regsel as u32)?;
        self.wait_regready(link)?;
        self.ap.read_transfer(link, DCRDR, TransferWidth::Word)
    }

    /// Writes one core register by its DCRSR register-selector number.
    pub fn reg_write(&mut self, link: &mut DebugLink, regsel: u16, value: u32) -> Result<(), ArmError> {
        self.ap.write_transfer(link, DCRDR, TransferWidth::Word, value)?;
        self.ap
            .write_transfer(link, DCRSR, TransferWidth::Word, regsel as u32 | (1 << 16))?;
        self.wait_regready(link)
    }

    fn wait_regready(&mut self, link: &mut DebugLink) -> Result<(), ArmError> {
        let start = std::time::Instant::now();
        loop {
            let dhcsr = self.ap.read_transfer(link, DHCSR, TransferWidth::Word)?;
            if dhcsr & DHCSR_S_REGRDY != 0 {
                return Ok(());
            }
            if start.elapsed() > std::time::Duration::from_millis(HALT_POLL_BUDGET_MS) {
                return Err(ArmError::Timeout);
            }
        }
    }

    /// Reads the general register file `R0..=R15, XPSR, MSP, PSP` (§4.D).
    pub fn regs_read(&mut self, link: &mut DebugLink) -> Result<Vec<u32>, ArmError> {
        let mut regs = Vec::with_capacity(19);
        for sel in 0u16..=18 {
            regs.push(self.reg_read(link, sel)?);
        }
        Ok(regs)
    }

    pub fn pc(&mut self, link: &mut DebugLink) -> Result<u32, ArmError> {
        self.reg_read(link, REG_PC)
    }

    pub fn set_pc(&mut self, link: &mut DebugLink, value: u32) -> Result<(), ArmError> {
        self.reg_write(link, REG_PC, value)
    }

    /// Programs an FPB hardware breakpoint (§4.D, §4.H). Returns the slot
    /// index used, to be stored in the facade's `BreakWatch.reserved[0]`.
    pub fn breakpoint_set(&mut self, link: &mut DebugLink, address: u64) -> Result<u8, ArmError> {
        let slot = self
            .fpb_slots
            .iter()
            .position(Option::is_none)
            .ok_or(ArmError::OutOfBounds)? as u8;

        let replace: u32 = if address & 0b10 == 0 { 0b01 } else { 0b10 };
        let comp = ((address as u32) & 0x1FFF_FFFC) | (replace << 30) | FP_CTRL_ENABLE;
        let comp_addr = FP_COMP0 + (slot as u64) * 4;
        self.ap.write_transfer(link, comp_addr, TransferWidth::Word, comp)?;
        self.fpb_slots[slot as usize] = Some(address);
        trace!(slot, address, "FPB breakpoint set");
        Ok(slot)
    }

    pub fn breakpoint_clear(&mut self, link: &mut DebugLink, slot: u8) -> Result<(), ArmError> {
        let comp_addr = FP_COMP0 + (slot as u64) * 4;
        self.ap.write_transfer(link, comp_addr, TransferWidth::Word, 0)?;
        self.fpb_slots[slot as usize] = None;
        Ok(())
    }

    /// Programs a DWT watchpoint over `[address, address+size)` (§4.D, §4.H).
    pub fn watchpoint_set(&mut self, link: &mut DebugLink, address: u64, size: u8, kind: WatchKind) -> Result<u8, ArmError> {
        let slot = self
            .dwt_slots
            .iter()
            .position(Option::is_none)
            .ok_or(ArmError::OutOfBounds)? as u8;

        let mask = (size.max(1) as f32).log2().ceil() as u32;
        let func = match kind {
            WatchKind::Read => DWT_FUNCTION_READ,
            WatchKind::Write => DWT_FUNCTION_WRITE,
            WatchKind::ReadWrite => DWT_FUNCTION_READ_WRITE,
        };

        let comp_addr = DWT_COMP0 + (slot as u64) * DWT_STRIDE;
        let mask_addr = DWT_MASK0 + (slot as u64) * DWT_STRIDE;
        let func_addr = DWT_FUNCTION0 + (slot as u64) * DWT_STRIDE;

        self.ap.write_transfer(link, comp_addr, TransferWidth::Word, address as u32)?;
        self.ap.write_transfer(link, mask_addr, TransferWidth::Word, mask)?;
        self.ap.write_transfer(link, func_addr, TransferWidth::Word, func)?;

        self.dwt_slots[slot as usize] = Some((address, size, kind));
        trace!(slot, address, size, "DWT watchpoint set");
        Ok(slot)
    }

    pub fn watchpoint_clear(&mut self, link: &mut DebugLink, slot: u8) -> Result<(), ArmError> {
        let func_addr = DWT_FUNCTION0 + (slot as u64) * DWT_STRIDE;
        self.ap
            .write_transfer(link, func_addr, TransferWidth::Word, DWT_FUNCTION_DISABLED)?;
        self.dwt_slots[slot as usize] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fpb_replace_field_follows_address_lsb() {
        let replace_low: u32 = if 0x0800_0100u64 & 0b10 == 0 { 0b01 } else { 0b10 };
        assert_eq!(replace_low, 0b01);
        let replace_high: u32 = if 0x0800_0102u64 & 0b10 == 0 { 0b01 } else { 0b10 };
        assert_eq!(replace_high, 0b10);
    }
}
