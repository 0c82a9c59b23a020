//! ADIv5/ADIv6 MEM-AP engine (component C, §4.C).
//!
//! Access-port enumeration, `IDR` classification, and the `CSW/TAR/DRW`
//! memory transfer sequencing (including the 10-bit TAR autoincrement
//! window and byte-lane packing/unpacking).

use bitfield::bitfield;
use tracing::{debug, trace};

use crate::link::DebugLink;

use super::dp::SharedDebugPort;
use super::{ApAddress, ArmError, DpAddress};

const CSW: u8 = 0x00;
const TAR: u8 = 0x04;
const DRW: u8 = 0x0C;
const BASE2: u8 = 0xF0;
const CFG: u8 = 0xF4;
const BASE: u8 = 0xF8;
const IDR: u8 = 0xFC;

/// The 10-bit TAR autoincrement window boundary (§4.C, §6.2): a burst must
/// not autoincrement across a `0x400`-aligned address.
const TAR_WRAP: u64 = 0x400;

const MAX_APSEL: u16 = 256;
const MAX_CONSECUTIVE_ABSENT: u8 = 8;

bitfield! {
    /// `CSW` (Control/Status Word), MEM-AP bank 0 offset `0x00`.
    #[derive(Clone, Copy)]
    pub struct Csw(u32);
    impl Debug;
    pub dbgswenable, set_dbgswenable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub spiden, set_spiden: 23;
    pub trinprog, _: 7;
    pub deviceen, _: 6;
    pub u8, addrinc, set_addrinc: 5, 4;
    pub u8, size, set_size: 2, 0;
}

/// `CSW.AddrInc` encodings (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrInc {
    Off,
    Single,
    Packed,
}

impl AddrInc {
    fn bits(self) -> u8 {
        match self {
            AddrInc::Off => 0,
            AddrInc::Single => 1,
            AddrInc::Packed => 2,
        }
    }
}

/// Width of a single MEM-AP transfer (§4.C, invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferWidth {
    Byte,
    Halfword,
    Word,
}

impl TransferWidth {
    pub fn bytes(self) -> u64 {
        match self {
            TransferWidth::Byte => 1,
            TransferWidth::Halfword => 2,
            TransferWidth::Word => 4,
        }
    }

    fn csw_size(self) -> u8 {
        match self {
            TransferWidth::Byte => 0,
            TransferWidth::Halfword => 1,
            TransferWidth::Word => 2,
        }
    }
}

bitfield! {
    /// `IDR`, MEM-AP bank 0xF offset `0xFC`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Idr(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, jep106_cc, _: 27, 24;
    pub u8, jep106_id, _: 23, 17;
    pub u8, class, _: 16, 13;
    pub u8, variant, _: 7, 4;
    pub u8, ap_type, _: 3, 0;
}

/// Classification of an AP from its `IDR.CLASS` field (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApClass {
    /// `CLASS == 0x8`: a memory access port we can drive.
    MemAp,
    /// `CLASS == 0x0`: a JTAG-COM-AP or similar, opaque to this core.
    ComAp,
    /// Any other, unrecognized class value.
    Other(u8),
}

impl From<Idr> for ApClass {
    fn from(idr: Idr) -> Self {
        match idr.class() {
            0x8 => ApClass::MemAp,
            0x0 => ApClass::ComAp,
            other => ApClass::Other(other),
        }
    }
}

/// Walks `apsel` 0..=255 looking for live access ports (§4.C "AP
/// enumeration"), honoring the `DUPED_AP` quirk (abandon once the same
/// non-zero `IDR` repeats) and giving up after 8 consecutive absent slots.
pub fn enumerate_aps(dp: &SharedDebugPort, link: &mut DebugLink) -> Result<Vec<(ApAddress, Idr)>, ArmError> {
    let mut found = Vec::new();
    let mut consecutive_absent = 0u8;
    let mut last_nonzero_idr: Option<u32> = None;
    let dp_address = dp.borrow().address;
    let duped_ap = dp.borrow().quirks.duped_ap;

    for apsel in 0..MAX_APSEL {
        let apsel = apsel as u8;
        let idr_raw = dp.borrow_mut().ap_read(link, apsel, IDR)?;
        if idr_raw == 0 {
            consecutive_absent += 1;
            if consecutive_absent >= MAX_CONSECUTIVE_ABSENT {
                break;
            }
            continue;
        }
        consecutive_absent = 0;

        if duped_ap && last_nonzero_idr == Some(idr_raw) {
            debug!("DUPED_AP quirk: identical IDR at apsel {apsel}, stopping enumeration");
            break;
        }
        last_nonzero_idr = Some(idr_raw);

        found.push((ApAddress::new(dp_address, apsel), Idr(idr_raw)));
    }

    Ok(found)
}

/// One MEM-AP, owning a reference to the [`SharedDebugPort`] it's banked
/// under (§3, §9: `AP -> DP`, never the reverse).
#[derive(Debug)]
pub struct AccessPort {
    pub address: ApAddress,
    pub idr: Idr,
    csw_cache: Option<Csw>,
    tar_cache: Option<u64>,
    dp: SharedDebugPort,
}

impl AccessPort {
    pub fn new(dp: SharedDebugPort, address: ApAddress, idr: Idr) -> Self {
        Self { address, idr, csw_cache: None, tar_cache: None, dp }
    }

    /// `BASE`/`BASE2` combined into a single 64-bit component base address
    /// (ADIv6 supplemental helper, §4.C, `SPEC_FULL.md` component E).
    pub fn base_address(&mut self, link: &mut DebugLink) -> Result<u64, ArmError> {
        let base = self.dp.borrow_mut().ap_read(link, self.address.apsel, BASE)?;
        let base2 = if self.idr.class() == 0x8 && (self.dp.borrow().quirks.mindp == false) {
            self.dp.borrow_mut().ap_read(link, self.address.apsel, BASE2).unwrap_or(0)
        } else {
            0
        };
        Ok(((base2 as u64) << 32) | (base & !0b11) as u64)
    }

    /// Reads and clears the owning DP's sticky fault flag, reporting
    /// whether a `MEM_FAULT` occurred since the last call (§4.I
    /// `check_error`, §7).
    pub fn check_error(&mut self) -> Option<super::dp::StickyFault> {
        match self.dp.borrow_mut().take_sticky_fault() {
            super::dp::StickyFault::None => None,
            other => Some(other),
        }
    }

    /// Drains a pending pipelined write by reading `RDBUFF` (§4.C step 4).
    pub fn drain_pipeline(&mut self, link: &mut DebugLink) -> Result<(), ArmError> {
        self.dp.borrow_mut().drain_pipeline(link)
    }

    fn set_csw(&mut self, link: &mut DebugLink, csw: Csw) -> Result<(), ArmError> {
        if self.csw_cache == Some(csw) {
            return Ok(());
        }
        self.dp.borrow_mut().ap_write(link, self.address.apsel, CSW, csw.0)?;
        self.csw_cache = Some(csw);
        Ok(())
    }

    fn set_tar(&mut self, link: &mut DebugLink, address: u64) -> Result<(), ArmError> {
        if self.tar_cache == Some(address) {
            return Ok(());
        }
        self.dp.borrow_mut().ap_write(link, self.address.apsel, TAR, address as u32)?;
        self.tar_cache = Some(address);
        Ok(())
    }

    /// Reads one transfer unit at `address` (invariant 1: width must divide
    /// `address`). Handles byte-lane unpacking for sub-word widths.
    pub fn read_transfer(&mut self, link: &mut DebugLink, address: u64, width: TransferWidth) -> Result<u32, ArmError> {
        if address % width.bytes() != 0 {
            return Err(ArmError::OutOfBounds);
        }
        let mut csw = Csw(0);
        csw.set_size(width.csw_size());
        csw.set_addrinc(AddrInc::Off.bits());
        self.set_csw(link, csw)?;
        self.set_tar(link, address)?;
        let raw = self.dp.borrow_mut().ap_read(link, self.address.apsel, DRW)?;
        self.tar_cache = None; // MEM-AP may autoincrement internally even with AddrInc off on some implementations
        Ok(lane_extract(raw, address, width))
    }

    /// Writes one transfer unit at `address`, shifting `value` into the
    /// correct byte lane (invariant 1).
    pub fn write_transfer(&mut self, link: &mut DebugLink, address: u64, width: TransferWidth, value: u32) -> Result<(), ArmError> {
        if address % width.bytes() != 0 {
            return Err(ArmError::OutOfBounds);
        }
        let mut csw = Csw(0);
        csw.set_size(width.csw_size());
        csw.set_addrinc(AddrInc::Off.bits());
        self.set_csw(link, csw)?;
        self.set_tar(link, address)?;
        let lane_value = lane_pack(value, address, width);
        self.dp.borrow_mut().ap_write(link, self.address.apsel, DRW, lane_value)?;
        self.tar_cache = None;
        Ok(())
    }

    /// Reads `buf.len()` bytes from `address` as a burst of `width`-sized
    /// transfers (invariant 2: TAR is rewritten at every `0x400` boundary,
    /// never silently autoincremented across it).
    pub fn read_block(&mut self, link: &mut DebugLink, address: u64, width: TransferWidth, buf: &mut [u8]) -> Result<(), ArmError> {
        let unit = width.bytes();
        if address % unit != 0 || buf.len() as u64 % unit != 0 {
            return Err(ArmError::OutOfBounds);
        }

        let mut csw = Csw(0);
        csw.set_size(width.csw_size());
        csw.set_addrinc(AddrInc::Single.bits());

        let mut cur = address;
        let mut offset = 0usize;
        while (offset as u64) < buf.len() as u64 {
            self.set_csw(link, csw)?;
            self.set_tar(link, cur)?;
            let words_left_in_window = ((TAR_WRAP - (cur % TAR_WRAP)) / unit) as usize;
            let words_remaining = (buf.len() - offset) / unit as usize;
            let burst = words_left_in_window.min(words_remaining).max(1);

            for _ in 0..burst {
                let raw = self.dp.borrow_mut().ap_read(link, self.address.apsel, DRW)?;
                let word = lane_extract(raw, cur, width);
                write_lane_to_buf(&mut buf[offset..offset + unit as usize], word, width);
                offset += unit as usize;
                cur += unit;
            }
            self.tar_cache = None; // hardware autoincremented; re-sync before next window
            trace!(address = cur, "crossed TAR autoincrement window");
        }
        Ok(())
    }

    /// Writes `buf` to `address` as a burst of `width`-sized transfers, with
    /// the same `0x400`-boundary TAR rewrite discipline as [`Self::read_block`].
    pub fn write_block(&mut self, link: &mut DebugLink, address: u64, width: TransferWidth, buf: &[u8]) -> Result<(), ArmError> {
        let unit = width.bytes();
        if address % unit != 0 || buf.len() as u64 % unit != 0 {
            return Err(ArmError::OutOfBounds);
        }

        let mut csw = Csw(0);
        csw.set_size(width.csw_size());
        csw.set_addrinc(AddrInc::Single.bits());

        let mut cur = address;
        let mut offset = 0usize;
        while (offset as u64) < buf.len() as u64 {
            self.set_csw(link, csw)?;
            self.set_tar(link, cur)?;
            let words_left_in_window = ((TAR_WRAP - (cur % TAR_WRAP)) / unit) as usize;
            let words_remaining = (buf.len() - offset) / unit as usize;
            let burst = words_left_in_window.min(words_remaining).max(1);

            for _ in 0..burst {
                let word = read_lane_from_buf(&buf[offset..offset + unit as usize], width);
                let lane_value = lane_pack(word, cur, width);
                self.dp.borrow_mut().ap_write(link, self.address.apsel, DRW, lane_value)?;
                offset += unit as usize;
                cur += unit;
            }
            self.tar_cache = None;
        }
        // Drain the pipeline so a subsequent DP-level read observes the write (§4.C step 4).
        self.dp.borrow_mut().drain_pipeline(link)?;
        Ok(())
    }
}

fn lane_pack(value: u32, address: u64, width: TransferWidth) -> u32 {
    match width {
        TransferWidth::Word => value,
        TransferWidth::Halfword => (value & 0xFFFF) << (((address % 4) as u32) * 8),
        TransferWidth::Byte => (value & 0xFF) << (((address % 4) as u32) * 8),
    }
}

fn lane_extract(raw: u32, address: u64, width: TransferWidth) -> u32 {
    match width {
        TransferWidth::Word => raw,
        TransferWidth::Halfword => (raw >> (((address % 4) as u32) * 8)) & 0xFFFF,
        TransferWidth::Byte => (raw >> (((address % 4) as u32) * 8)) & 0xFF,
    }
}

fn write_lane_to_buf(dest: &mut [u8], word: u32, width: TransferWidth) {
    match width {
        TransferWidth::Byte => dest[0] = word as u8,
        TransferWidth::Halfword => dest.copy_from_slice(&(word as u16).to_le_bytes()),
        TransferWidth::Word => dest.copy_from_slice(&word.to_le_bytes()),
    }
}

fn read_lane_from_buf(src: &[u8], width: TransferWidth) -> u32 {
    match width {
        TransferWidth::Byte => src[0] as u32,
        TransferWidth::Halfword => u16::from_le_bytes([src[0], src[1]]) as u32,
        TransferWidth::Word => u32::from_le_bytes([src[0], src[1], src[2], src[3]]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_lane_round_trips_every_offset() {
        for offset in 0u64..4 {
            let packed = lane_pack(0xAB, offset, TransferWidth::Byte);
            let extracted = lane_extract(packed, offset, TransferWidth::Byte);
            assert_eq!(extracted, 0xAB);
        }
    }

    #[test]
    fn halfword_lane_round_trips_aligned_offsets() {
        for offset in [0u64, 2] {
            let packed = lane_pack(0xBEEF, offset, TransferWidth::Halfword);
            let extracted = lane_extract(packed, offset, TransferWidth::Halfword);
            assert_eq!(extracted, 0xBEEF);
        }
    }

    #[test]
    fn ap_class_from_idr() {
        let mut idr = Idr(0);
        idr.0 |= 0x8 << 13;
        assert_eq!(ApClass::from(idr), ApClass::MemAp);
    }

    #[test]
    fn check_error_reads_and_clears_sticky_fault_without_touching_link() {
        use super::super::dp::{DebugPort, StickyFault};
        use super::super::DpAddress;
        use std::cell::RefCell;
        use std::rc::Rc;

        let dp = Rc::new(RefCell::new(DebugPort::new(DpAddress::Default)));
        dp.borrow_mut().fault = StickyFault::Fault;
        let mut ap = AccessPort::new(dp, ApAddress::new(DpAddress::Default, 0), Idr(0));

        assert_eq!(ap.check_error(), Some(StickyFault::Fault));
        assert_eq!(ap.check_error(), None); // cleared by the first call
    }

    /// A scripted SWD responder standing in for a target's DP/MEM-AP:
    /// decodes the request byte like real hardware, but answers from an
    /// in-memory register/byte model instead of a physical wire.
    #[derive(Default)]
    struct FakeSwdState {
        tar: u64,
        mem: std::collections::HashMap<u64, u8>,
        tar_write_count: u32,
        last_rdbuff: u32,
    }

    struct FakeSwdIo {
        pending: Option<(bool, bool, u8)>,
        state: std::sync::Arc<std::sync::Mutex<FakeSwdState>>,
    }

    impl FakeSwdIo {
        fn new(state: std::sync::Arc<std::sync::Mutex<FakeSwdState>>) -> Self {
            Self { pending: None, state }
        }
    }

    impl crate::link::RawSwdIo for FakeSwdIo {
        fn seq_in(&mut self, bits: usize) -> Result<u64, crate::link::DebugProbeError> {
            if bits == 3 {
                return Ok(0b001); // every access in this scenario ACKs OK
            }
            Ok(0) // turnaround
        }

        fn seq_in_parity(&mut self, bits: usize) -> Result<(u64, bool), crate::link::DebugProbeError> {
            debug_assert_eq!(bits, 32);
            let (apndp, rnw, addr) = self.pending.expect("data phase with no pending request");
            debug_assert!(rnw);
            let mut state = self.state.lock().unwrap();
            let value: u32 = match (apndp, addr) {
                (false, 0xC) => state.last_rdbuff, // RDBUFF
                (true, 0xC) => {
                    // Blind DRW read trigger: latch the byte at the current
                    // TAR (in its lane) for the RDBUFF read that follows,
                    // then autoincrement as CSW.AddrInc=Single would.
                    let byte = *state.mem.get(&state.tar).unwrap_or(&0);
                    let lane = (byte as u32) << (((state.tar % 4) as u32) * 8);
                    state.last_rdbuff = lane;
                    state.tar += 1;
                    0
                }
                _ => 0,
            };
            Ok((value as u64, value.count_ones() % 2 == 1))
        }

        fn seq_out(&mut self, data: u64, bits: usize) -> Result<(), crate::link::DebugProbeError> {
            if bits == 8 {
                let byte = data as u8;
                let apndp = (byte >> 1) & 1 == 1;
                let rnw = (byte >> 2) & 1 == 1;
                let a = ((byte >> 3) & 0b11) << 2;
                self.pending = Some((apndp, rnw, a));
            }
            Ok(())
        }

        fn seq_out_parity(&mut self, data: u64, bits: usize) -> Result<(), crate::link::DebugProbeError> {
            debug_assert_eq!(bits, 32);
            let (apndp, rnw, addr) = self.pending.expect("data phase with no pending request");
            debug_assert!(!rnw);
            let value = data as u32;
            let mut state = self.state.lock().unwrap();
            match (apndp, addr) {
                (true, 0x4) => {
                    // AP TAR write.
                    state.tar = value as u64;
                    state.tar_write_count += 1;
                }
                _ => {} // SELECT/CSW/ABORT writes don't matter to this scenario
            }
            Ok(())
        }
    }

    #[test]
    fn s1_byte_read_crosses_tar_window_with_exactly_two_tar_writes() {
        use super::super::dp::DebugPort;
        use super::super::DpAddress;
        use std::cell::RefCell;
        use std::rc::Rc;
        use std::sync::{Arc, Mutex};

        let state = Arc::new(Mutex::new(FakeSwdState::default()));
        {
            let mut s = state.lock().unwrap();
            for (i, byte) in [0xAAu8, 0xBB, 0xCC, 0xDD, 0xEE].into_iter().enumerate() {
                s.mem.insert(0x2000_03FE + i as u64, byte);
            }
        }

        let dp = Rc::new(RefCell::new(DebugPort::new(DpAddress::Default)));
        let mut ap = AccessPort::new(dp, ApAddress::new(DpAddress::Default, 0), Idr(0));
        let mut link = DebugLink::Swd(Box::new(FakeSwdIo::new(state.clone())));

        let mut buf = [0u8; 5];
        ap.read_block(&mut link, 0x2000_03FE, TransferWidth::Byte, &mut buf).unwrap();

        assert_eq!(buf, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
        assert_eq!(state.lock().unwrap().tar_write_count, 2);
    }
}
