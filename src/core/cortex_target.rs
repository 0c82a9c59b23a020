//! [`CoreOps`] implementation wrapping Cortex-M and Cortex-R (§4.I).

use std::cell::RefCell;
use std::rc::Rc;

use crate::architecture::arm::ap::{self, AccessPort, ApClass, TransferWidth};
use crate::architecture::arm::cortex_m::CortexM;
use crate::architecture::arm::cortex_r::CortexR;
use crate::architecture::arm::dp::DebugPort;
use crate::architecture::arm::{ArmError, DpAddress};
use crate::core::{BreakWatch, BreakWatchKind, CoreOps, HaltReason};
use crate::error::Error;
use crate::link::DebugLink;

/// `IDR.TYPE` for an AHB3 MEM-AP (§4.C "MEM-APs of `IDR.TYPE==AHB3`"), the
/// bus architecture every ARMv6-M/v7-M/v8-M Cortex-M core is reached
/// through.
const AP_TYPE_AHB3: u8 = 0x1;

/// Either flavor of Cortex core, behind the uniform facade.
pub enum CortexTarget {
    M(CortexM),
    R(CortexR),
}

impl CortexTarget {
    /// Brings up a DP, enumerates its APs, and attaches to the first
    /// AHB3 MEM-AP found (§4.C "MEM-APs of `IDR.TYPE==AHB3` are sent to
    /// `cortexm_prepare` for halt before ROM-table walk"), following the
    /// `dp_init` -> `enumerate_aps` -> `cortexm_initial_halt` chain that
    /// component I's `attach` operation sits on top of.
    ///
    /// Cortex-R targets are reached through a debug component discovered
    /// by walking the ROM table at the AP's `BASE`/`BASE2` address, which
    /// is out of this core's scope (§1: individual component discovery is
    /// chip-specific); callers that know their target is Cortex-R should
    /// construct a [`CortexR`] directly via [`CortexR::attach`] once they
    /// have resolved the debug component's base address.
    pub fn attach_auto(link: &mut DebugLink, dp_address: DpAddress) -> Result<Self, Error> {
        let dp = Rc::new(RefCell::new(DebugPort::new(dp_address)));
        dp.borrow_mut().dp_init(link)?;

        let candidates = ap::enumerate_aps(&dp, link)?;
        let (address, idr) = candidates
            .into_iter()
            .find(|(_, idr)| idr.ap_type() == AP_TYPE_AHB3 && ApClass::from(*idr) == ApClass::MemAp)
            .ok_or(ArmError::NoApFound)?;

        let ap = AccessPort::new(dp, address, idr);
        let cortex_m = CortexM::attach(ap, link)?;
        Ok(CortexTarget::M(cortex_m))
    }
}

fn pick_width(address: u64, len: usize) -> TransferWidth {
    if address % 4 == 0 && len % 4 == 0 {
        TransferWidth::Word
    } else if address % 2 == 0 && len % 2 == 0 {
        TransferWidth::Halfword
    } else {
        TransferWidth::Byte
    }
}

impl CoreOps for CortexTarget {
    fn attach(&mut self, _link: &mut DebugLink) -> Result<(), Error> {
        // Construction happens via `CortexM::attach`/`CortexR::attach`
        // (they need the freshly-enumerated `AccessPort` by value); this
        // hook exists for re-attach after a `detach()`, a no-op for both
        // flavors since neither tears down FPB/DWT state on detach.
        Ok(())
    }

    fn detach(&mut self, link: &mut DebugLink) -> Result<(), Error> {
        match self {
            CortexTarget::M(m) => m.detach(link).map_err(Error::from),
            CortexTarget::R(_) => Ok(()),
        }
    }

    fn halt_request(&mut self, link: &mut DebugLink) -> Result<(), Error> {
        match self {
            CortexTarget::M(m) => m.halt_request(link).map_err(Error::from),
            CortexTarget::R(r) => r.halt_request(link).map_err(Error::from),
        }
    }

    fn halt_poll(&mut self, link: &mut DebugLink) -> Result<HaltReason, Error> {
        match self {
            CortexTarget::M(m) => m.halt_poll(link).map_err(Error::from),
            CortexTarget::R(r) => r.halt_poll(link).map_err(Error::from),
        }
    }

    fn halt_resume(&mut self, link: &mut DebugLink, step: bool) -> Result<(), Error> {
        match self {
            CortexTarget::M(m) => m.halt_resume(link, step).map_err(Error::from),
            CortexTarget::R(r) => {
                if step {
                    return Err(Error::Other("single-step is not implemented for Cortex-R".into()));
                }
                r.halt_resume(link).map_err(Error::from)
            }
        }
    }

    fn regs_read(&mut self, link: &mut DebugLink) -> Result<Vec<u32>, Error> {
        match self {
            CortexTarget::M(m) => m.regs_read(link).map_err(Error::from),
            CortexTarget::R(r) => (0u8..16).map(|reg| r.reg_read(link, reg).map_err(Error::from)).collect(),
        }
    }

    fn reg_read(&mut self, link: &mut DebugLink, index: u16) -> Result<u32, Error> {
        match self {
            CortexTarget::M(m) => m.reg_read(link, index).map_err(Error::from),
            CortexTarget::R(r) => r.reg_read(link, index as u8).map_err(Error::from),
        }
    }

    fn reg_write(&mut self, link: &mut DebugLink, index: u16, value: u32) -> Result<(), Error> {
        match self {
            CortexTarget::M(m) => m.reg_write(link, index, value).map_err(Error::from),
            CortexTarget::R(r) => r.reg_write(link, index as u8, value).map_err(Error::from),
        }
    }

    fn mem_read(&mut self, link: &mut DebugLink, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        let width = pick_width(address, buf.len());
        match self {
            CortexTarget::M(m) => m.ap.read_block(link, address, width, buf).map_err(Error::from),
            CortexTarget::R(r) => r.ap.read_block(link, address, width, buf).map_err(Error::from),
        }
    }

    fn mem_write(&mut self, link: &mut DebugLink, address: u64, buf: &[u8]) -> Result<(), Error> {
        let width = pick_width(address, buf.len());
        match self {
            CortexTarget::M(m) => m.ap.write_block(link, address, width, buf).map_err(Error::from),
            CortexTarget::R(r) => r.ap.write_block(link, address, width, buf).map_err(Error::from),
        }
    }

    fn breakwatch_set(&mut self, link: &mut DebugLink, mut bw: BreakWatch) -> Result<BreakWatch, Error> {
        match self {
            CortexTarget::M(m) => {
                let slot = match bw.kind {
                    BreakWatchKind::Breakpoint => m.breakpoint_set(link, bw.address)?,
                    BreakWatchKind::Watchpoint(kind) => m.watchpoint_set(link, bw.address, bw.size, kind)?,
                };
                bw.reserved[0] = slot as u32;
                Ok(bw)
            }
            CortexTarget::R(_) => Err(Error::Other("breakpoints are not implemented for Cortex-R".into())),
        }
    }

    fn breakwatch_clear(&mut self, link: &mut DebugLink, bw: &BreakWatch) -> Result<(), Error> {
        match self {
            CortexTarget::M(m) => {
                let slot = bw.reserved[0] as u8;
                match bw.kind {
                    BreakWatchKind::Breakpoint => m.breakpoint_clear(link, slot)?,
                    BreakWatchKind::Watchpoint(_) => m.watchpoint_clear(link, slot)?,
                }
                Ok(())
            }
            CortexTarget::R(_) => Err(Error::Other("breakpoints are not implemented for Cortex-R".into())),
        }
    }

    fn check_error(&mut self, _link: &mut DebugLink) -> Result<Option<String>, Error> {
        let fault = match self {
            CortexTarget::M(m) => m.ap.check_error(),
            CortexTarget::R(r) => r.ap.check_error(),
        };
        Ok(fault.map(|f| format!("{f:?}")))
    }
}
