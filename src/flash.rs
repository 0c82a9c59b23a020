//! The flash driver contract (component J, §4.J, §6.4).
//!
//! An individual target's flash algorithm is an external collaborator:
//! this module only fixes the callback shape a [`MemRegion`] of kind
//! [`MemRegionKind::Flash`](crate::core::MemRegionKind) is driven through.

use crate::core::{CoreOps, MemRegion, MemRegionKind};
use crate::error::Error;
use crate::link::DebugLink;

/// A target-specific flash algorithm, attached to a [`MemRegion`] by a
/// GDB-layer collaborator (§4.J). Implementations run on-target code (or
/// drive a peripheral directly); this crate only sequences the calls.
pub trait FlashDriver {
    /// Loads and starts the algorithm, readying it for `erase`/`write`.
    fn prepare(&mut self, core: &mut dyn CoreOps, link: &mut DebugLink) -> Result<bool, Error>;

    /// Erases `len` bytes starting at `addr`, which must fall on a
    /// `blocksize` boundary.
    fn erase(&mut self, core: &mut dyn CoreOps, link: &mut DebugLink, addr: u64, len: u64) -> Result<bool, Error>;

    /// Writes `len` bytes from `src` to `dest`, which must fall on a
    /// `writesize` boundary.
    fn write(&mut self, core: &mut dyn CoreOps, link: &mut DebugLink, dest: u64, src: &[u8], len: u64) -> Result<bool, Error>;

    /// Stops the algorithm and releases any state it holds on-target.
    fn done(&mut self, core: &mut dyn CoreOps, link: &mut DebugLink) -> Result<bool, Error>;
}

/// Drives a whole program operation over one [`MemRegion`]: `prepare`,
/// erase-then-write each `blocksize`/`writesize`-aligned chunk, `done`
/// (§4.J). Returns `Ok(false)` on the first callback that reports failure
/// without treating it as an `Err` -- the region may be left partially
/// programmed and it is the caller's responsibility to decide whether to
/// retry or abort.
pub fn program_region(
    driver: &mut dyn FlashDriver,
    region: &MemRegion,
    core: &mut dyn CoreOps,
    link: &mut DebugLink,
    data: &[u8],
) -> Result<bool, Error> {
    if region.kind != MemRegionKind::Flash {
        return Err(Error::Other("program_region called on a non-flash region".into()));
    }
    if !region.contains(region.start, data.len() as u64) {
        return Err(Error::Other("data does not fit in the target region".into()));
    }

    if !driver.prepare(core, link)? {
        return Ok(false);
    }

    let blocksize = region.blocksize.max(1) as u64;
    let mut addr = region.start;
    let end = region.start + data.len() as u64;
    while addr < end {
        if !driver.erase(core, link, addr, blocksize)? {
            return Ok(false);
        }
        addr += blocksize;
    }

    let writesize = region.writesize.max(1) as usize;
    for (offset, chunk) in data.chunks(writesize).enumerate() {
        let dest = region.start + (offset * writesize) as u64;
        if !driver.write(core, link, dest, chunk, chunk.len() as u64)? {
            return Ok(false);
        }
    }

    driver.done(core, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BreakWatch, HaltReason};

    struct RecordingDriver {
        prepared: bool,
        erased: Vec<(u64, u64)>,
        written: Vec<(u64, usize)>,
        done: bool,
    }

    impl FlashDriver for RecordingDriver {
        fn prepare(&mut self, _core: &mut dyn CoreOps, _link: &mut DebugLink) -> Result<bool, Error> {
            self.prepared = true;
            Ok(true)
        }
        fn erase(&mut self, _core: &mut dyn CoreOps, _link: &mut DebugLink, addr: u64, len: u64) -> Result<bool, Error> {
            self.erased.push((addr, len));
            Ok(true)
        }
        fn write(&mut self, _core: &mut dyn CoreOps, _link: &mut DebugLink, dest: u64, src: &[u8], _len: u64) -> Result<bool, Error> {
            self.written.push((dest, src.len()));
            Ok(true)
        }
        fn done(&mut self, _core: &mut dyn CoreOps, _link: &mut DebugLink) -> Result<bool, Error> {
            self.done = true;
            Ok(true)
        }
    }

    struct NullCore;
    impl CoreOps for NullCore {
        fn attach(&mut self, _link: &mut DebugLink) -> Result<(), Error> {
            Ok(())
        }
        fn detach(&mut self, _link: &mut DebugLink) -> Result<(), Error> {
            Ok(())
        }
        fn halt_request(&mut self, _link: &mut DebugLink) -> Result<(), Error> {
            Ok(())
        }
        fn halt_poll(&mut self, _link: &mut DebugLink) -> Result<HaltReason, Error> {
            Ok(HaltReason::Running)
        }
        fn halt_resume(&mut self, _link: &mut DebugLink, _step: bool) -> Result<(), Error> {
            Ok(())
        }
        fn regs_read(&mut self, _link: &mut DebugLink) -> Result<Vec<u32>, Error> {
            Ok(Vec::new())
        }
        fn reg_read(&mut self, _link: &mut DebugLink, _index: u16) -> Result<u32, Error> {
            Ok(0)
        }
        fn reg_write(&mut self, _link: &mut DebugLink, _index: u16, _value: u32) -> Result<(), Error> {
            Ok(())
        }
        fn mem_read(&mut self, _link: &mut DebugLink, _address: u64, _buf: &mut [u8]) -> Result<(), Error> {
            Ok(())
        }
        fn mem_write(&mut self, _link: &mut DebugLink, _address: u64, _buf: &[u8]) -> Result<(), Error> {
            Ok(())
        }
        fn breakwatch_set(&mut self, _link: &mut DebugLink, bw: BreakWatch) -> Result<BreakWatch, Error> {
            Ok(bw)
        }
        fn breakwatch_clear(&mut self, _link: &mut DebugLink, _bw: &BreakWatch) -> Result<(), Error> {
            Ok(())
        }
        fn check_error(&mut self, _link: &mut DebugLink) -> Result<Option<String>, Error> {
            Ok(None)
        }
    }

    fn fake_link() -> DebugLink {
        use crate::link::{DebugProbeError, RawJtagIo};

        struct FakeJtag {
            idle: u8,
        }
        impl RawJtagIo for FakeJtag {
            fn shift_ir(&mut self, _chain_index: u8, _ir: u64, _bits: usize) -> Result<(), DebugProbeError> {
                Ok(())
            }
            fn shift_dr(&mut self, _chain_index: u8, _input: u64, _bits: usize) -> Result<u64, DebugProbeError> {
                Ok(0)
            }
            fn tms_seq(&mut self, _bits: u64, _count: usize) -> Result<(), DebugProbeError> {
                Ok(())
            }
            fn idle_cycles(&self) -> u8 {
                self.idle
            }
            fn set_idle_cycles(&mut self, idle: u8) {
                self.idle = idle;
            }
        }
        DebugLink::Jtag(Box::new(FakeJtag { idle: 0 }))
    }

    #[test]
    fn program_region_sequences_prepare_erase_write_done() {
        let region = MemRegion {
            kind: MemRegionKind::Flash,
            start: 0x0800_0000,
            length: 0x1000,
            blocksize: 0x200,
            writesize: 0x100,
            erased_byte: 0xFF,
        };
        let data = vec![0xAAu8; 0x300];
        let mut driver = RecordingDriver { prepared: false, erased: Vec::new(), written: Vec::new(), done: false };
        let mut core = NullCore;
        let mut link = fake_link();

        let ok = program_region(&mut driver, &region, &mut core, &mut link, &data).unwrap();
        assert!(ok);
        assert!(driver.prepared);
        assert!(driver.done);
        assert_eq!(driver.erased, vec![(0x0800_0000, 0x200), (0x0800_0200, 0x200)]);
        assert_eq!(driver.written.len(), 3);
        assert_eq!(driver.written[2].1, 0x100);
    }

    #[test]
    fn program_region_rejects_data_past_region_end() {
        let region = MemRegion {
            kind: MemRegionKind::Flash,
            start: 0,
            length: 0x10,
            blocksize: 0x10,
            writesize: 0x10,
            erased_byte: 0xFF,
        };
        let data = vec![0u8; 0x20];
        let mut driver = RecordingDriver { prepared: false, erased: Vec::new(), written: Vec::new(), done: false };
        let mut core = NullCore;
        let mut link = fake_link();

        assert!(program_region(&mut driver, &region, &mut core, &mut link, &data).is_err());
    }
}
