//! RISC-V DMI engine and Debug Module lifecycle (component F, §4.F).
//!
//! Read/write/no-op through the DTM with busy retry (delegated to
//! [`super::dtm::Dtm`]), `DMACTIVE` lifecycle, hart discovery, and halt.

use std::time::{Duration, Instant};

use bitfield::bitfield;
use tracing::{debug, debug_span, warn};

use crate::link::DebugLink;

use super::dtm::{Dtm, DmiRequest};
use super::{dmi_regs, HartInfo, RiscvError, RVDBG_MAX_HARTS};

const HALT_BUDGET: Duration = Duration::from_millis(50);
const RESUME_BUDGET: Duration = Duration::from_millis(1050);

bitfield! {
    /// `dmcontrol` (DMI address `0x10`, §6.3).
    #[derive(Clone, Copy)]
    pub struct Dmcontrol(u32);
    impl Debug;
    pub _, set_haltreq: 31;
    pub _, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub _, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub u32, hartsello, set_hartsello: 25, 16;
    pub u32, hartselhi, set_hartselhi: 15, 6;
    pub _, set_resethaltreq: 3;
    pub _, set_clrresethaltreq: 2;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl Dmcontrol {
    /// `hartsello`/`hartselhi` combined into the full `HARTSEL` field (§4.F).
    pub fn hartsel(&self) -> u32 {
        (self.hartselhi() << 10) | self.hartsello()
    }

    pub fn set_hartsel(&mut self, value: u32) {
        self.set_hartsello(value & 0x3FF);
        self.set_hartselhi((value >> 10) & 0x3FF);
    }
}

bitfield! {
    /// `dmstatus` (DMI address `0x11`, read-only, §6.3).
    #[derive(Clone, Copy)]
    pub struct Dmstatus(u32);
    impl Debug;
    pub impebreak, _: 22;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allnonexistent, _: 15;
    pub anynonexistent, _: 14;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub authbusy, _: 6;
    pub hasresethaltreq, _: 5;
    pub confstrptrvalid, _: 4;
    pub u8, version, _: 3, 0;
}

bitfield! {
    /// `hartinfo` (DMI address `0x12`, §6.3).
    #[derive(Clone, Copy)]
    pub struct Hartinfo(u32);
    impl Debug;
    pub u8, nscratch, _: 23, 20;
    pub dataaccess, _: 16;
    pub u8, datasize, _: 15, 12;
    pub u16, dataaddr, _: 11, 0;
}

bitfield! {
    /// `abstractcs` (DMI address `0x16`, §6.3, §4.G).
    #[derive(Clone, Copy)]
    pub struct Abstractcs(u32);
    impl Debug;
    pub u8, progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub u8, cmderr, set_cmderr: 10, 8;
    pub u8, datacount, _: 3, 0;
}

bitfield! {
    /// `nextdm` (DMI address `0x1D`, §4.F step 4).
    #[derive(Clone, Copy)]
    pub struct NextDm(u32);
    impl Debug;
    pub u32, addr, _: 31, 0;
}

/// One Debug Transport Module's Debug Module (§3 `DMI` entity).
///
/// Holds the DTM it is reached through plus the Debug-Module-scoped state
/// the 0.13 spec exposes: capability bits read once during activation, and
/// the sticky request/error state used by the busy-retry loop (§4.F, §4.E).
#[derive(Debug)]
pub struct Dmi {
    dtm: Dtm,
    pub debug_version: u8,
    pub progbuf_size: u8,
    pub impebreak: bool,
    pub abstract_data_count: u8,
    pub support_autoexecdata: bool,
    pub support_resethaltreq: bool,
    pub hartsellen: u8,
    pub harts: Vec<HartInfo>,
    pub current_hart: u32,
    pub error: bool,
}

impl Dmi {
    /// `nop`: a DMI transaction with `op == NOP`, used by callers that only
    /// want the previous access's pipelined result (§3 `DMI`).
    pub fn nop(&mut self, link: &mut DebugLink) -> Result<u32, RiscvError> {
        self.transact(link, 0, 0, DmiRequest::NOP)
    }

    pub fn read(&mut self, link: &mut DebugLink, address: u8) -> Result<u32, RiscvError> {
        self.transact(link, address as u64, 0, DmiRequest::READ)
    }

    pub fn write(&mut self, link: &mut DebugLink, address: u8, value: u32) -> Result<(), RiscvError> {
        self.transact(link, address as u64, value, DmiRequest::WRITE).map(|_| ())
    }

    fn transact(&mut self, link: &mut DebugLink, address: u64, data: u32, op: u8) -> Result<u32, RiscvError> {
        match self.dtm.low_access(link, DmiRequest { address, data, op }) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.error = true;
                Err(e)
            }
        }
    }

    /// Reads and clears the sticky error flag (§7 `check_error` semantics
    /// at the DMI level).
    pub fn check_error(&mut self) -> bool {
        std::mem::replace(&mut self.error, false)
    }

    /// Brings up the Debug Module: reset/activate `DMACTIVE`, read
    /// `DMSTATUS`, verify a single DM, select the memory/abstract access
    /// strategy, and discover harts (§4.F steps 1-6).
    pub fn init(dtm: Dtm, link: &mut DebugLink) -> Result<Self, RiscvError> {
        let _span = debug_span!("dmi_init").entered();
        let mut dmi = Self {
            dtm,
            debug_version: 0,
            progbuf_size: 0,
            impebreak: false,
            abstract_data_count: 0,
            support_autoexecdata: false,
            support_resethaltreq: false,
            hartsellen: 0,
            harts: Vec::new(),
            current_hart: 0,
            error: false,
        };

        dmi.write(link, dmi_regs::DMCONTROL, 0)?;
        let start = Instant::now();
        loop {
            let dmcontrol = Dmcontrol(dmi.read(link, dmi_regs::DMCONTROL)?);
            if !dmcontrol.dmactive() {
                break;
            }
            if start.elapsed() > HALT_BUDGET {
                return Err(RiscvError::Timeout);
            }
        }

        let mut active = Dmcontrol(0);
        active.set_dmactive(true);
        dmi.write(link, dmi_regs::DMCONTROL, active.0)?;
        let start = Instant::now();
        loop {
            let dmcontrol = Dmcontrol(dmi.read(link, dmi_regs::DMCONTROL)?);
            if dmcontrol.dmactive() {
                break;
            }
            if start.elapsed() > HALT_BUDGET {
                return Err(RiscvError::Timeout);
            }
        }

        let status = Dmstatus(dmi.read(link, dmi_regs::DMSTATUS)?);
        if !status.authenticated() {
            return Err(RiscvError::NotAuthenticated);
        }
        if status.version() != 2 {
            return Err(RiscvError::UnsupportedDebugModuleVersion(status.version()));
        }
        dmi.debug_version = status.version();
        dmi.impebreak = status.impebreak();
        dmi.support_resethaltreq = status.hasresethaltreq();

        let nextdm = NextDm(dmi.read(link, dmi_regs::NEXTDM)?);
        if nextdm.addr() != 0 {
            return Err(RiscvError::MultipleDebugModulesUnsupported);
        }

        dmi.select_access_strategy(link)?;
        dmi.discover_harts(link)?;

        debug!(
            progbuf_size = dmi.progbuf_size,
            num_harts = dmi.harts.len(),
            hartsellen = dmi.hartsellen,
            "RISC-V Debug Module activated"
        );
        Ok(dmi)
    }

    /// Reads `ABSTRACTCS`/`ABSTRACTAUTO` capability bits (§4.F step 5,
    /// §4.G autoexec detection).
    fn select_access_strategy(&mut self, link: &mut DebugLink) -> Result<(), RiscvError> {
        let abstractcs = Abstractcs(self.read(link, dmi_regs::ABSTRACTCS)?);
        self.progbuf_size = abstractcs.progbufsize();
        self.abstract_data_count = abstractcs.datacount();

        let probe_mask = (1u32 << self.abstract_data_count) - 1;
        self.write(link, dmi_regs::ABSTRACTAUTO, probe_mask)?;
        let readback = self.read(link, dmi_regs::ABSTRACTAUTO)?;
        self.support_autoexecdata = readback == probe_mask;
        self.write(link, dmi_regs::ABSTRACTAUTO, 0)?;
        Ok(())
    }

    /// Selects `hart` via `DMCONTROL.HARTSEL` (§4.F).
    pub fn select_hart(&mut self, link: &mut DebugLink, hart: u32) -> Result<(), RiscvError> {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsel(hart);
        self.write(link, dmi_regs::DMCONTROL, dmcontrol.0)?;
        self.current_hart = hart;
        Ok(())
    }

    /// Hart discovery (§4.F): determine `hartsellen` from the width of the
    /// `HARTSEL` field that reads back, then walk harts until
    /// `ANYNONEXISTENT`, capped at [`RVDBG_MAX_HARTS`].
    fn discover_harts(&mut self, link: &mut DebugLink) -> Result<(), RiscvError> {
        let mut probe = Dmcontrol(0);
        probe.set_dmactive(true);
        probe.set_hartsel(0xF_FFFF);
        self.write(link, dmi_regs::DMCONTROL, probe.0)?;
        let readback = Dmcontrol(self.read(link, dmi_regs::DMCONTROL)?);
        self.hartsellen = readback.hartsel().count_ones() as u8;

        let max_hart = (1u32 << self.hartsellen).min(32);
        self.harts.clear();
        for idx in 0..max_hart.min(RVDBG_MAX_HARTS as u32) {
            self.select_hart(link, idx)?;
            let status = Dmstatus(self.read(link, dmi_regs::DMSTATUS)?);
            if status.anynonexistent() {
                break;
            }
            if status.anyhavereset() {
                let mut ack = Dmcontrol(0);
                ack.set_dmactive(true);
                ack.set_hartsel(idx);
                ack.set_ackhavereset(true);
                self.write(link, dmi_regs::DMCONTROL, ack.0)?;
            }
            let hartinfo = Hartinfo(self.read(link, dmi_regs::HARTINFO)?);
            self.harts.push(HartInfo {
                idx,
                mhartid: idx,
                nscratch: hartinfo.nscratch(),
                dataaccess: hartinfo.dataaccess(),
                datasize: hartinfo.datasize(),
                dataaddr: hartinfo.dataaddr(),
            });
        }
        if self.harts.is_empty() {
            self.harts.push(HartInfo { idx: 0, ..Default::default() });
        }
        self.select_hart(link, 0)
    }

    /// Halts the currently-selected hart (§4.F "Halt current hart"): assert
    /// `HALTREQ`, poll `ALLHALTED`, acking any `ANYHAVERESET` seen along the
    /// way; arm `SRESETHALTREQ` too when the DM supports it.
    pub fn halt_hart(&mut self, link: &mut DebugLink) -> Result<(), RiscvError> {
        let _span = debug_span!("halt_hart", hart = self.current_hart).entered();
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsel(self.current_hart);
        dmcontrol.set_haltreq(true);
        self.write(link, dmi_regs::DMCONTROL, dmcontrol.0)?;

        let start = Instant::now();
        loop {
            let status = Dmstatus(self.read(link, dmi_regs::DMSTATUS)?);
            if status.allhalted() {
                break;
            }
            if status.anyhavereset() {
                let mut ack = dmcontrol;
                ack.set_ackhavereset(true);
                self.write(link, dmi_regs::DMCONTROL, ack.0)?;
            }
            if start.elapsed() > HALT_BUDGET {
                warn!("halt request not acknowledged within budget");
                return Err(RiscvError::Timeout);
            }
        }

        dmcontrol.set_haltreq(false);
        self.write(link, dmi_regs::DMCONTROL, dmcontrol.0)?;

        if self.support_resethaltreq {
            let mut arm = dmcontrol;
            arm.set_resethaltreq(true);
            self.write(link, dmi_regs::DMCONTROL, arm.0)?;
        }
        Ok(())
    }

    /// Resumes the currently-selected hart, polling `ALLRESUMEACK` within
    /// the resume budget (§5).
    pub fn resume_hart(&mut self, link: &mut DebugLink) -> Result<(), RiscvError> {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_dmactive(true);
        dmcontrol.set_hartsel(self.current_hart);
        dmcontrol.set_resumereq(true);
        self.write(link, dmi_regs::DMCONTROL, dmcontrol.0)?;

        let start = Instant::now();
        loop {
            let status = Dmstatus(self.read(link, dmi_regs::DMSTATUS)?);
            if status.allresumeack() {
                dmcontrol.set_resumereq(false);
                self.write(link, dmi_regs::DMCONTROL, dmcontrol.0)?;
                return Ok(());
            }
            if start.elapsed() > RESUME_BUDGET {
                return Err(RiscvError::Timeout);
            }
        }
    }

    pub fn is_halted(&mut self, link: &mut DebugLink) -> Result<bool, RiscvError> {
        Ok(Dmstatus(self.read(link, dmi_regs::DMSTATUS)?).allhalted())
    }

    pub(crate) fn abstractcs(&mut self, link: &mut DebugLink) -> Result<Abstractcs, RiscvError> {
        Ok(Abstractcs(self.read(link, dmi_regs::ABSTRACTCS)?))
    }

    pub(crate) fn dtm_mut(&mut self) -> &mut Dtm {
        &mut self.dtm
    }
}

#[cfg(test)]
impl Dmi {
    /// Builds a `Dmi` directly from capability fields, skipping `init`'s
    /// activation handshake, for tests that exercise a single DMI-level
    /// operation against a scripted link.
    pub(crate) fn for_test(dtm: Dtm) -> Self {
        Self {
            dtm,
            debug_version: 2,
            progbuf_size: 0,
            impebreak: false,
            abstract_data_count: 1,
            support_autoexecdata: true,
            support_resethaltreq: false,
            hartsellen: 0,
            harts: Vec::new(),
            current_hart: 0,
            error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmcontrol_hartsel_round_trips() {
        let mut dmcontrol = Dmcontrol(0);
        dmcontrol.set_hartsel(0x3_FFFF);
        assert_eq!(dmcontrol.hartsel(), 0x3_FFFF);
    }

    #[test]
    fn abstractcs_decodes_progbuf_and_datacount() {
        // progbufsize=4 (bits 28:24), datacount=2 (bits 3:0).
        let raw = (4u32 << 24) | 2;
        let abstractcs = Abstractcs(raw);
        assert_eq!(abstractcs.progbufsize(), 4);
        assert_eq!(abstractcs.datacount(), 2);
    }
}
