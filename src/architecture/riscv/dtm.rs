//! RISC-V Debug Transport Module framing (component E, §4.E).
//!
//! Both JTAG and abstract transports are exposed through one interface:
//! `low_access(cmd) -> (ret, op)`, where `cmd` packs `(address<<34) |
//! (data<<2) | op` into the `dmi` register (§6.1 JTAG IRs, §4.E).

use bitfield::bitfield;
use tracing::{debug, warn};

use crate::link::DebugLink;

use super::RiscvError;

/// JTAG IR for the RISC-V `idcode` register (§6.1).
pub const IR_IDCODE: u64 = 0x01;
/// JTAG IR for `dtmcs` (§6.1).
pub const IR_DTMCS: u64 = 0x10;
/// JTAG IR for `dmi` (§6.1).
pub const IR_DMI: u64 = 0x11;
/// JTAG IR for `bypass` (§6.1).
pub const IR_BYPASS: u64 = 0x1F;

const DTMCS_WIDTH: usize = 32;
const DMI_ADDRESS_BIT_OFFSET: u64 = 34;
const DMI_OP_MASK: u64 = 0x3;

/// The cap `dmi.idle` may reach before a sustained `OP_BUSY` is fatal (§4.E, §5).
const IDLE_CAP: u8 = 9;

bitfield! {
    /// `dtmcs` (JTAG IR `0x10`).
    #[derive(Clone, Copy)]
    pub struct Dtmcs(u32);
    impl Debug;
    pub _, set_dmihardreset: 17;
    pub _, set_dmireset: 16;
    pub u8, idle, _: 14, 12;
    pub u8, dmistat, _: 11, 10;
    pub u8, abits, _: 9, 4;
    pub u8, version, _: 3, 0;
}

/// Result of decoding the `op` field of a `dmi` transaction (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiOpStatus {
    NoError,
    Reserved,
    OpFailed,
    OpBusy,
}

impl DmiOpStatus {
    fn decode(op: u8) -> Self {
        match op {
            0 => Self::NoError,
            1 => Self::Reserved,
            2 => Self::OpFailed,
            _ => Self::OpBusy,
        }
    }
}

/// A DMI request, saved so it can be re-shifted verbatim after a busy reset
/// (§4.E "re-apply the saved `last_dmi`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmiRequest {
    pub address: u64,
    pub data: u32,
    pub op: u8,
}

impl DmiRequest {
    pub const NOP: u8 = 0;
    pub const READ: u8 = 1;
    pub const WRITE: u8 = 2;

    fn pack(self, abits: u32) -> (u64, usize) {
        let value = ((self.address as u128) << DMI_ADDRESS_BIT_OFFSET)
            | ((self.data as u128) << 2)
            | self.op as u128;
        (value as u64, 34 + abits as usize)
    }
}

/// Debug Transport Module state: the number of DMI address bits and the
/// running idle-cycle count used to back off a busy target (§3, §4.E).
#[derive(Debug, Clone, Copy)]
pub struct Dtm {
    pub abits: u32,
    pub idle: u8,
    last_dmi: Option<DmiRequest>,
}

#[cfg(test)]
impl Dtm {
    /// Builds a `Dtm` directly, skipping `probe`'s JTAG round-trip, for
    /// tests that script DMI-level behavior instead of `dtmcs`.
    pub(crate) fn for_test(abits: u32, idle: u8) -> Self {
        Self { abits, idle, last_dmi: None }
    }
}

impl Dtm {
    /// Reads `dtmcs` through the JTAG IR and validates `version == 1`
    /// (§4.E, §6.1).
    pub fn probe(link: &mut DebugLink) -> Result<Self, RiscvError> {
        let jtag = link.as_jtag_mut().ok_or(RiscvError::NoRiscvTarget)?;
        jtag.shift_ir(0, IR_DTMCS, 5)?;
        let raw = jtag.shift_dr(0, 0, DTMCS_WIDTH)? as u32;
        let dtmcs = Dtmcs(raw);
        if raw == 0 {
            return Err(RiscvError::NoRiscvTarget);
        }
        if dtmcs.version() != 1 {
            return Err(RiscvError::UnsupportedDtmVersion(dtmcs.version()));
        }
        jtag.set_idle_cycles(dtmcs.idle());
        debug!(abits = dtmcs.abits(), idle = dtmcs.idle(), "DTM probed");
        Ok(Self { abits: dtmcs.abits() as u32, idle: dtmcs.idle(), last_dmi: None })
    }

    /// `DTMCS.DMIRESET`: clears the sticky busy/error state without
    /// disturbing `DMCONTROL` (§4.E busy handling).
    fn dmi_soft_reset(&mut self, link: &mut DebugLink) -> Result<(), RiscvError> {
        let jtag = link.as_jtag_mut().ok_or(RiscvError::NoRiscvTarget)?;
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmireset(true);
        jtag.shift_ir(0, IR_DTMCS, 5)?;
        jtag.shift_dr(0, dtmcs.0 as u64, DTMCS_WIDTH)?;
        Ok(())
    }

    /// `DTMCS.DMIHARDRESET`: used only ahead of a full rediscovery (§4.E).
    pub fn dmi_hard_reset(&mut self, link: &mut DebugLink) -> Result<(), RiscvError> {
        let jtag = link.as_jtag_mut().ok_or(RiscvError::NoRiscvTarget)?;
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmihardreset(true);
        jtag.shift_ir(0, IR_DTMCS, 5)?;
        jtag.shift_dr(0, dtmcs.0 as u64, DTMCS_WIDTH)?;
        self.idle = 0;
        self.last_dmi = None;
        Ok(())
    }

    /// One `dmi` transaction, with the busy-retry discipline of §4.E: on
    /// `OP_BUSY`, reset the DMI, bump `idle` (fatal past [`IDLE_CAP`]), and
    /// re-shift the very same request that just failed.
    pub fn low_access(&mut self, link: &mut DebugLink, req: DmiRequest) -> Result<u32, RiscvError> {
        self.last_dmi = Some(req);
        loop {
            let (value, bits) = req.pack(self.abits);
            let jtag = link.as_jtag_mut().ok_or(RiscvError::NoRiscvTarget)?;
            jtag.shift_ir(0, IR_DMI, 5)?;
            let shifted = jtag.shift_dr(0, value, bits)?;

            let op = (shifted & DMI_OP_MASK) as u8;
            match DmiOpStatus::decode(op) {
                DmiOpStatus::NoError => return Ok((shifted >> 2) as u32),
                DmiOpStatus::OpFailed => return Err(RiscvError::DmiFailed),
                DmiOpStatus::Reserved => return Err(RiscvError::DmiFailed),
                DmiOpStatus::OpBusy => {
                    if self.idle > IDLE_CAP {
                        return Err(RiscvError::DmiBusy);
                    }
                    warn!(idle = self.idle, "DMI busy, backing off");
                    self.dmi_soft_reset(link)?;
                    self.idle += 1;
                    if let DebugLink::Jtag(jtag) = link {
                        jtag.set_idle_cycles(self.idle);
                    }
                    // `req` (== last_dmi) is re-shifted verbatim on the next
                    // loop iteration, per §4.E.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmi_op_status_decodes_all_four_values() {
        assert_eq!(DmiOpStatus::decode(0), DmiOpStatus::NoError);
        assert_eq!(DmiOpStatus::decode(1), DmiOpStatus::Reserved);
        assert_eq!(DmiOpStatus::decode(2), DmiOpStatus::OpFailed);
        assert_eq!(DmiOpStatus::decode(3), DmiOpStatus::OpBusy);
    }

    #[test]
    fn dmi_request_packs_address_data_and_op() {
        let req = DmiRequest { address: 0x11, data: 0xDEAD_BEEF, op: DmiRequest::WRITE };
        let (value, bits) = req.pack(7);
        assert_eq!(bits, 41);
        assert_eq!(value & 0x3, DmiRequest::WRITE as u64);
        assert_eq!((value >> 2) as u32, 0xDEAD_BEEF);
        assert_eq!(value >> 34, 0x11);
    }

    /// Scripts a fixed sequence of `dmi` shift results, tracking which IR is
    /// currently latched so a `DTMCS.DMIRESET` shift (driven by
    /// `dmi_soft_reset`) doesn't consume a scripted `dmi` response.
    struct ScriptedJtagIo {
        last_ir: u64,
        dmi_responses: std::collections::VecDeque<u64>,
        idle: u8,
    }

    impl crate::link::RawJtagIo for ScriptedJtagIo {
        fn shift_ir(&mut self, _chain_index: u8, ir: u64, _bits: usize) -> Result<(), crate::link::DebugProbeError> {
            self.last_ir = ir;
            Ok(())
        }

        fn shift_dr(&mut self, _chain_index: u8, _input: u64, _bits: usize) -> Result<u64, crate::link::DebugProbeError> {
            if self.last_ir == IR_DTMCS {
                return Ok(0);
            }
            Ok(self.dmi_responses.pop_front().expect("scripted dmi response exhausted"))
        }

        fn tms_seq(&mut self, _bits: u64, _count: usize) -> Result<(), crate::link::DebugProbeError> {
            Ok(())
        }

        fn idle_cycles(&self) -> u8 {
            self.idle
        }

        fn set_idle_cycles(&mut self, idle: u8) {
            self.idle = idle;
        }
    }

    fn ok_response(data: u32) -> u64 {
        ((data as u64) << 2) | DmiOpStatus::NoError as u64
    }

    fn busy_response() -> u64 {
        DmiOpStatus::OpBusy as u64
    }

    #[test]
    fn s5_busy_once_then_ok_retries_and_bumps_idle() {
        use crate::link::DebugLink;

        let mut link = DebugLink::Jtag(Box::new(ScriptedJtagIo {
            last_ir: 0,
            dmi_responses: [busy_response(), ok_response(0x1234)].into_iter().collect(),
            idle: 5,
        }));
        let mut dtm = Dtm { abits: 7, idle: 5, last_dmi: None };

        let req = DmiRequest { address: 0x11, data: 0, op: DmiRequest::READ };
        let value = dtm.low_access(&mut link, req).unwrap();

        assert_eq!(value, 0x1234);
        assert_eq!(dtm.idle, 6);
    }

    #[test]
    fn s5_sustained_busy_past_idle_cap_is_fatal() {
        use crate::link::DebugLink;

        let mut link = DebugLink::Jtag(Box::new(ScriptedJtagIo {
            last_ir: 0,
            dmi_responses: std::iter::repeat_with(busy_response).take(16).collect(),
            idle: 9,
        }));
        let mut dtm = Dtm { abits: 7, idle: 9, last_dmi: None };

        let req = DmiRequest { address: 0x11, data: 0, op: DmiRequest::READ };
        let err = dtm.low_access(&mut link, req).unwrap_err();

        assert!(matches!(err, RiscvError::DmiBusy));
    }
}
