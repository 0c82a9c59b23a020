//! Chip-specific debug sequence hooks (§4.D), with an ARMv7-M-compliant
//! default.
//!
//! Real targets often need errata workarounds around reset and initial
//! halt; this trait is the seam a board-specific implementation overrides,
//! mirroring the teacher's per-target `ArmDebugSequence` hooks.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::link::DebugLink;

use super::ap::AccessPort;
use super::ArmError;

const RESET_POLL_BUDGET: Duration = Duration::from_millis(500);

const DHCSR: u64 = 0xE000_EDF0;
const DEMCR: u64 = 0xE000_EDFC;
const AIRCR: u64 = 0xE000_ED0C;

const DHCSR_DBGKEY: u32 = 0xA05F_0000;
const DHCSR_C_DEBUGEN: u32 = 1 << 0;
const DHCSR_C_HALT: u32 = 1 << 1;
const DHCSR_S_HALT: u32 = 1 << 17;
const DHCSR_S_RESET_ST: u32 = 1 << 25;

const CORTEXM_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

const DEMCR_VC_CORERESET: u32 = 1 << 0;
const DEMCR_VC_HARDERR: u32 = 1 << 10;
const DEMCR_TRCENA: u32 = 1 << 24;

const AIRCR_VECTKEY: u32 = 0x05FA_0000;
const AIRCR_SYSRESETREQ: u32 = 1 << 2;

/// Hooks a board integration overrides to customize reset/halt sequencing
/// (§4.D). Each method receives the MEM-AP already selected for debug
/// access; implementations issue plain word reads/writes through it.
pub trait ArmDebugSequence {
    /// Runs once after the DP/AP have been brought up, before any core
    /// register access (default: no-op).
    fn debug_port_setup(&self, _ap: &mut AccessPort, _link: &mut DebugLink) -> Result<(), ArmError> {
        Ok(())
    }

    /// Requests a halt-on-reset catch by setting `DEMCR.VC_CORERESET`.
    fn reset_catch_set(&self, ap: &mut AccessPort, link: &mut DebugLink) -> Result<(), ArmError> {
        let demcr = ap.read_transfer(link, DEMCR, super::ap::TransferWidth::Word)?;
        ap.write_transfer(link, DEMCR, super::ap::TransferWidth::Word, demcr | DEMCR_VC_CORERESET)
    }

    /// Clears the halt-on-reset catch bit.
    fn reset_catch_clear(&self, ap: &mut AccessPort, link: &mut DebugLink) -> Result<(), ArmError> {
        let demcr = ap.read_transfer(link, DEMCR, super::ap::TransferWidth::Word)?;
        ap.write_transfer(link, DEMCR, super::ap::TransferWidth::Word, demcr & !DEMCR_VC_CORERESET)
    }

    /// Issues a system reset via `AIRCR.SYSRESETREQ` and waits for
    /// `DHCSR.S_RESET_ST` to clear again, within a 500ms budget.
    fn reset_system(&self, ap: &mut AccessPort, link: &mut DebugLink) -> Result<(), ArmError> {
        ap.write_transfer(link, AIRCR, super::ap::TransferWidth::Word, AIRCR_VECTKEY | AIRCR_SYSRESETREQ)?;

        let start = Instant::now();
        loop {
            match ap.read_transfer(link, DHCSR, super::ap::TransferWidth::Word) {
                Ok(dhcsr) if dhcsr & DHCSR_S_RESET_ST == 0 => return Ok(()),
                Ok(_) => {}
                Err(_) => {} // the core may be unresponsive for a few cycles during reset
            }
            if start.elapsed() > RESET_POLL_BUDGET {
                return Err(ArmError::Timeout);
            }
        }
    }

    /// Enables debug and halts the core, with DWT/ITM enabled for later
    /// breakpoint/watchpoint programming (§4.D "initial halt").
    fn core_start(&self, ap: &mut AccessPort, link: &mut DebugLink) -> Result<(), ArmError> {
        ap.write_transfer(link, DHCSR, super::ap::TransferWidth::Word, DHCSR_DBGKEY | DHCSR_C_DEBUGEN)?;

        let demcr = ap.read_transfer(link, DEMCR, super::ap::TransferWidth::Word).unwrap_or(0);
        ap.write_transfer(
            link,
            DEMCR,
            super::ap::TransferWidth::Word,
            demcr | DEMCR_TRCENA | DEMCR_VC_HARDERR,
        )?;
        debug!("core debug enabled");
        Ok(())
    }

    /// Halts the core (`DHCSR.C_HALT`), tolerating transient
    /// `0xFFFF_FFFF`/`0xF000_FFF0`-masked bus-fault reads as errata noise.
    fn halt(&self, ap: &mut AccessPort, link: &mut DebugLink) -> Result<(), ArmError> {
        ap.write_transfer(
            link,
            DHCSR,
            super::ap::TransferWidth::Word,
            DHCSR_DBGKEY | DHCSR_C_DEBUGEN | DHCSR_C_HALT,
        )
    }

    /// `cortexm_initial_halt` (§4.C): enables debug, then forces `C_HALT`
    /// in a loop until `S_HALT && C_DEBUGEN` read back clean, filtering the
    /// `0xFFFF_FFFF`/`0xF000_FFF0`-masked errata reads and riding out one
    /// observed `S_RESET_ST` rather than treating it as halted. Once halted,
    /// saves `DEMCR` (the caller keeps it as `ap_cortexm_demcr`, §3), arms
    /// `TRCENA|VC_HARDERR|VC_CORERESET`, and waits for `S_RESET_ST` to clear
    /// (actual `nRST` deassertion is the probe's job, out of this crate's
    /// scope). Returns the DEMCR value seen before the catch was armed.
    fn cortexm_initial_halt(&self, ap: &mut AccessPort, link: &mut DebugLink) -> Result<u32, ArmError> {
        ap.write_transfer(link, DHCSR, super::ap::TransferWidth::Word, DHCSR_DBGKEY | DHCSR_C_DEBUGEN)?;
        ap.drain_pipeline(link)?;

        let start = Instant::now();
        loop {
            if start.elapsed() > CORTEXM_WAIT_TIMEOUT {
                return Err(ArmError::Timeout);
            }
            ap.write_transfer(
                link,
                DHCSR,
                super::ap::TransferWidth::Word,
                DHCSR_DBGKEY | DHCSR_C_DEBUGEN | DHCSR_C_HALT,
            )?;
            let dhcsr = match ap.read_transfer(link, DHCSR, super::ap::TransferWidth::Word) {
                Ok(v) if !is_errata_read(v) => v,
                _ => continue,
            };
            if dhcsr & DHCSR_S_RESET_ST != 0 {
                continue;
            }
            if dhcsr & DHCSR_S_HALT != 0 && dhcsr & DHCSR_C_DEBUGEN != 0 {
                break;
            }
        }

        let prev_demcr = ap.read_transfer(link, DEMCR, super::ap::TransferWidth::Word).unwrap_or(0);
        ap.write_transfer(
            link,
            DEMCR,
            super::ap::TransferWidth::Word,
            DEMCR_TRCENA | DEMCR_VC_HARDERR | DEMCR_VC_CORERESET,
        )?;

        let start = Instant::now();
        loop {
            let dhcsr = ap.read_transfer(link, DHCSR, super::ap::TransferWidth::Word)?;
            if dhcsr & DHCSR_S_RESET_ST == 0 {
                break;
            }
            if start.elapsed() > CORTEXM_WAIT_TIMEOUT {
                return Err(ArmError::Timeout);
            }
        }

        debug!(prev_demcr, "cortexm_initial_halt complete");
        Ok(prev_demcr)
    }
}

/// The default sequence: plain ARMv7-M reset/halt with no errata workarounds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultArmSequence;

impl ArmDebugSequence for DefaultArmSequence {}

fn is_errata_read(value: u32) -> bool {
    value == 0xFFFF_FFFF || (value & 0xF000_FFF0) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errata_read_filters_all_ones() {
        assert!(is_errata_read(0xFFFF_FFFF));
    }

    #[test]
    fn errata_read_filters_reserved_bit_noise() {
        assert!(is_errata_read(0xF000_0000));
        assert!(is_errata_read(0x0000_FFF0));
        assert!(!is_errata_read(DHCSR_S_HALT | DHCSR_C_DEBUGEN));
    }
}
