//! RISC-V memory access strategies (component H, §4.H).
//!
//! Abstract-AAM (`ACCESS_MEMORY`) and system-bus transfer, plus a
//! program-buffer fallback, each handling unaligned head/tail bytes and
//! auto-increment on the fast path.

use bitfield::bitfield;
use tracing::trace;

use super::abstract_cmd::{self, AccessMemoryCommand, AccessState};
use super::dmi::Dmi;
use super::{dmi_regs, RiscvError};
use crate::link::DebugLink;

bitfield! {
    /// `sbcs` (DMI address `0x38`, §6.3, §4.H "Memory via system bus").
    #[derive(Clone, Copy)]
    pub struct Sbcs(u32);
    impl Debug;
    pub u8, sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub u8, sbaccess, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub u8, sberror, set_sberror: 14, 12;
    pub u8, sbasize, _: 11, 5;
    pub sbaccess128, _: 4;
    pub sbaccess64, _: 3;
    pub sbaccess32, _: 2;
    pub sbaccess16, _: 1;
    pub sbaccess8, _: 0;
}

/// Which transfer engine this core reaches memory through (§4.H, §9
/// "Device-id dispatch"). Chosen once at attach time from the Debug
/// Module's capability bits and, for designer `0x612` (ESP32-style
/// targets), a device-id override (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessMethod {
    AbstractAam,
    SystemBus,
    ProgramBuffer,
}

/// Picks the memory strategy for a target, following the designer-id
/// dispatch in §4.G: designer `0x612` prefers system-bus access over
/// abstract-memory, since its abstract-memory implementation is unreliable
/// for bulk transfers; everyone else prefers abstract-memory when present.
pub fn select_method(designer: u16, has_sysbus: bool, has_abstract_aam: bool, has_progbuf: bool) -> Result<MemoryAccessMethod, RiscvError> {
    if designer == 0x612 && has_sysbus {
        return Ok(MemoryAccessMethod::SystemBus);
    }
    if has_abstract_aam {
        return Ok(MemoryAccessMethod::AbstractAam);
    }
    if has_sysbus {
        return Ok(MemoryAccessMethod::SystemBus);
    }
    if has_progbuf {
        return Ok(MemoryAccessMethod::ProgramBuffer);
    }
    Err(RiscvError::NoMemoryAccessMethod)
}

fn aamsize_for(width: u8) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => unreachable!("only 1/2/4-byte AAM widths are used"),
    }
}

/// Reads `buf` from `address` using `ACCESS_MEMORY` (§4.H "Memory via
/// abstract AAM"): a scalar 8-bit access handles any unaligned head/tail,
/// the aligned run in the middle streams through autoexec on `DATA0`.
pub fn read_aam(dmi: &mut Dmi, link: &mut DebugLink, address: u64, buf: &mut [u8]) -> Result<(), RiscvError> {
    let mut addr = address;
    let mut offset = 0usize;

    // Unaligned head, scalar until word-aligned.
    while offset < buf.len() && addr % 4 != 0 {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        let value = read_aam_scalar(dmi, link, addr, width)?;
        buf[offset..offset + width as usize].copy_from_slice(&value.to_le_bytes()[..width as usize]);
        addr += width as u64;
        offset += width as usize;
    }

    // Aligned middle run of whole words through the autoexec fast path.
    let word_count = (buf.len() - offset) / 4;
    if word_count > 0 {
        let mut words = vec![0u32; word_count];
        read_aam_run(dmi, link, addr, &mut words)?;
        for (i, word) in words.iter().enumerate() {
            buf[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        addr += (word_count * 4) as u64;
        offset += word_count * 4;
    }

    // Unaligned tail.
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        let value = read_aam_scalar(dmi, link, addr, width)?;
        buf[offset..offset + width as usize].copy_from_slice(&value.to_le_bytes()[..width as usize]);
        addr += width as u64;
        offset += width as usize;
    }
    Ok(())
}

fn aligned_width(address: u64, remaining: usize) -> u8 {
    if remaining >= 4 && address % 4 == 0 {
        4
    } else if remaining >= 2 && address % 2 == 0 {
        2
    } else {
        1
    }
}

fn read_aam_scalar(dmi: &mut Dmi, link: &mut DebugLink, address: u64, width: u8) -> Result<u32, RiscvError> {
    dmi.write(link, dmi_regs::DATA0 + 1, address as u32)?; // DATA1
    let mut command = AccessMemoryCommand(0);
    command.set_cmdtype(2);
    command.set_aamsize(aamsize_for(width));
    super::abstract_cmd::run_command(dmi, link, command.0)?;
    dmi.read(link, dmi_regs::DATA0)
}

fn write_aam_scalar(dmi: &mut Dmi, link: &mut DebugLink, address: u64, width: u8, value: u32) -> Result<(), RiscvError> {
    dmi.write(link, dmi_regs::DATA0, value)?;
    dmi.write(link, dmi_regs::DATA0 + 1, address as u32)?; // DATA1
    let mut command = AccessMemoryCommand(0);
    command.set_cmdtype(2);
    command.set_aamsize(aamsize_for(width));
    command.set_write(true);
    super::abstract_cmd::run_command(dmi, link, command.0)
}

/// Reads a run of whole words with autoexec acceleration (§4.H): the
/// address is pre-loaded once, `AAMPOSTINCREMENT` advances it on every
/// command, and `ABSTRACTAUTO` is armed before the first `DATA0` read so
/// every read except the last re-issues the command and advances the
/// address for the next word -- disabled again before the final read so
/// it doesn't trigger a superfluous out-of-range access.
pub fn read_aam_run(dmi: &mut Dmi, link: &mut DebugLink, address: u64, words: &mut [u32]) -> Result<(), RiscvError> {
    if words.is_empty() {
        return Ok(());
    }
    dmi.write(link, dmi_regs::DATA0 + 1, address as u32)?; // DATA1
    let mut command = AccessMemoryCommand(0);
    command.set_cmdtype(2);
    command.set_aamsize(2);
    command.set_aampostincrement(words.len() > 1);
    super::abstract_cmd::run_command(dmi, link, command.0)?;

    if words.len() > 1 {
        dmi.write(link, dmi_regs::ABSTRACTAUTO, 1)?;
    }
    words[0] = dmi.read(link, dmi_regs::DATA0)?;

    if words.len() > 1 {
        for word in &mut words[1..words.len() - 1] {
            *word = dmi.read(link, dmi_regs::DATA0)?;
        }
        dmi.write(link, dmi_regs::ABSTRACTAUTO, 0)?;
        words[words.len() - 1] = dmi.read(link, dmi_regs::DATA0)?;
    }

    let abstractcs = dmi.abstractcs(link)?;
    if abstractcs.cmderr() != 0 {
        return Err(RiscvError::AbstractCommand(super::AbstractCommandErrorKind::parse(abstractcs.cmderr())));
    }
    trace!(count = words.len(), "AAM run read via autoexec");
    Ok(())
}

/// Writes `buf` to `address` via `ACCESS_MEMORY` (symmetric to
/// [`read_aam`]).
pub fn write_aam(dmi: &mut Dmi, link: &mut DebugLink, address: u64, buf: &[u8]) -> Result<(), RiscvError> {
    let mut addr = address;
    let mut offset = 0usize;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        let mut bytes = [0u8; 4];
        bytes[..width as usize].copy_from_slice(&buf[offset..offset + width as usize]);
        write_aam_scalar(dmi, link, addr, width, u32::from_le_bytes(bytes))?;
        addr += width as u64;
        offset += width as usize;
    }
    Ok(())
}

/// System-bus memory transfer (§4.H "Memory via system bus"): the first
/// read triggers via `SBREADONADDR` on `SBADDRESS0`; subsequent reads
/// trigger via `SBREADONDATA|SBAUTOINCREMENT` on `SBDATA0`. Unaligned
/// head/tail falls back to `SBACCESS_8BIT` when available.
pub fn read_sysbus(dmi: &mut Dmi, link: &mut DebugLink, address: u64, buf: &mut [u8]) -> Result<(), RiscvError> {
    let sbcs = Sbcs(dmi.read(link, dmi_regs::SBCS)?);
    let mut addr = address;
    let mut offset = 0usize;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        if width < 4 && !sbcs.sbaccess8() {
            return Err(RiscvError::UnalignedAccessUnsupported { address: addr });
        }
        let mut cfg = Sbcs(0);
        cfg.set_sbaccess(sb_access_code(width));
        cfg.set_sbreadonaddr(true);
        dmi.write(link, dmi_regs::SBCS, cfg.0)?;
        dmi.write(link, dmi_regs::SBADDRESS0, addr as u32)?;
        let value = dmi.read(link, dmi_regs::SBDATA0)?;
        buf[offset..offset + width as usize].copy_from_slice(&value.to_le_bytes()[..width as usize]);
        addr += width as u64;
        offset += width as usize;
    }
    Ok(())
}

/// Writes `buf` to `address` over the system bus, symmetric to [`read_sysbus`].
pub fn write_sysbus(dmi: &mut Dmi, link: &mut DebugLink, address: u64, buf: &[u8]) -> Result<(), RiscvError> {
    let sbcs = Sbcs(dmi.read(link, dmi_regs::SBCS)?);
    let mut addr = address;
    let mut offset = 0usize;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        if width < 4 && !sbcs.sbaccess8() {
            return Err(RiscvError::UnalignedAccessUnsupported { address: addr });
        }
        let mut bytes = [0u8; 4];
        bytes[..width as usize].copy_from_slice(&buf[offset..offset + width as usize]);

        let mut cfg = Sbcs(0);
        cfg.set_sbaccess(sb_access_code(width));
        dmi.write(link, dmi_regs::SBCS, cfg.0)?;
        dmi.write(link, dmi_regs::SBADDRESS0, addr as u32)?;
        dmi.write(link, dmi_regs::SBDATA0, u32::from_le_bytes(bytes))?;
        addr += width as u64;
        offset += width as usize;
    }
    Ok(())
}

fn sb_access_code(width: u8) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => unreachable!("only 1/2/4-byte system-bus widths are used"),
    }
}

/// Program-buffer memory fallback (§4.G "For memory progbuf read"): choose
/// the widest naturally-aligned load/store for the remaining length,
/// recursing with a narrower width on an unaligned tail.
pub fn read_progbuf(dmi: &mut Dmi, link: &mut DebugLink, address: u64, buf: &mut [u8]) -> Result<(), RiscvError> {
    const A0: u16 = abstract_cmd::GPR_BASE + 0xA; // x10
    const A1: u16 = abstract_cmd::GPR_BASE + 0xB; // x11

    let mut addr = address;
    let mut offset = 0usize;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        let funct3 = match width {
            4 => 2,
            2 => 1,
            _ => 0,
        };

        abstract_cmd::write_register(dmi, link, A0, addr as u32, AccessState::Init)?;
        abstract_cmd::upload_program(dmi, link, &[abstract_cmd::load(funct3, 0, 10, 11)])?;
        abstract_cmd::execute_program(dmi, link)?;
        let value = abstract_cmd::read_register(dmi, link, A1, AccessState::Init)?;

        buf[offset..offset + width as usize].copy_from_slice(&value.to_le_bytes()[..width as usize]);
        addr += width as u64;
        offset += width as usize;
    }
    Ok(())
}

/// Program-buffer memory write, symmetric to [`read_progbuf`].
pub fn write_progbuf(dmi: &mut Dmi, link: &mut DebugLink, address: u64, buf: &[u8]) -> Result<(), RiscvError> {
    const A0: u16 = abstract_cmd::GPR_BASE + 0xA;
    const A1: u16 = abstract_cmd::GPR_BASE + 0xB;

    let mut addr = address;
    let mut offset = 0usize;
    while offset < buf.len() {
        let remaining = buf.len() - offset;
        let width = aligned_width(addr, remaining);
        let funct3 = match width {
            4 => 2,
            2 => 1,
            _ => 0,
        };
        let mut bytes = [0u8; 4];
        bytes[..width as usize].copy_from_slice(&buf[offset..offset + width as usize]);

        abstract_cmd::write_register(dmi, link, A0, addr as u32, AccessState::Init)?;
        abstract_cmd::write_register(dmi, link, A1, u32::from_le_bytes(bytes), AccessState::Init)?;
        abstract_cmd::upload_program(dmi, link, &[abstract_cmd::store(funct3, 0, 10, 11)])?;
        abstract_cmd::execute_program(dmi, link)?;

        addr += width as u64;
        offset += width as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_method_prefers_sysbus_for_designer_0x612() {
        assert_eq!(select_method(0x612, true, true, true).unwrap(), MemoryAccessMethod::SystemBus);
    }

    #[test]
    fn select_method_prefers_abstract_aam_otherwise() {
        assert_eq!(select_method(0x000, true, true, true).unwrap(), MemoryAccessMethod::AbstractAam);
    }

    #[test]
    fn select_method_falls_back_to_progbuf() {
        assert_eq!(select_method(0x000, false, false, true).unwrap(), MemoryAccessMethod::ProgramBuffer);
    }

    #[test]
    fn select_method_errors_with_nothing_available() {
        assert!(select_method(0x000, false, false, false).is_err());
    }

    #[test]
    fn aligned_width_picks_widest_natural_fit() {
        assert_eq!(aligned_width(0x1000, 4), 4);
        assert_eq!(aligned_width(0x1002, 4), 2);
        assert_eq!(aligned_width(0x1001, 4), 1);
    }

    /// Simulates `ACCESS_MEMORY`/`ABSTRACTAUTO` at the DMI register level:
    /// a `COMMAND` write fetches the word at the current address into a
    /// staged `DATA0` value and advances the address (`AAMPOSTINCREMENT`);
    /// reading `DATA0` returns the staged value and, only while
    /// `ABSTRACTAUTO` is armed, re-runs the fetch for the next word.
    struct FakeAamJtagIo {
        base: u32,
        memory: Vec<u32>,
        addr: u32,
        staged: u32,
        autoexec: bool,
        abstractauto_reg: u32,
    }

    impl crate::link::RawJtagIo for FakeAamJtagIo {
        fn shift_ir(&mut self, _chain_index: u8, _ir: u64, _bits: usize) -> Result<(), crate::link::DebugProbeError> {
            Ok(())
        }

        fn shift_dr(&mut self, _chain_index: u8, input: u64, _bits: usize) -> Result<u64, crate::link::DebugProbeError> {
            let address = ((input >> 34) & 0x7F) as u8;
            let data = ((input >> 2) & 0xFFFF_FFFF) as u32;
            let op = (input & 0x3) as u8;
            if op == 0 {
                return Ok(0);
            }

            match address {
                dmi_regs::DATA0 => {
                    if op == super::super::dtm::DmiRequest::WRITE {
                        self.staged = data;
                    } else {
                        let value = self.staged;
                        if self.autoexec {
                            self.run_fetch();
                        }
                        return Ok((value as u64) << 2);
                    }
                }
                a if a == dmi_regs::DATA0 + 1 => {
                    if op == super::super::dtm::DmiRequest::WRITE {
                        self.addr = data;
                    }
                }
                dmi_regs::COMMAND => {
                    if op == super::super::dtm::DmiRequest::WRITE {
                        let postincrement = (data >> 19) & 1 != 0;
                        self.run_fetch();
                        if !postincrement {
                            self.addr -= 4;
                        }
                    }
                }
                dmi_regs::ABSTRACTCS => {
                    // Writes clear `cmderr`; this fake never sets one, so
                    // both the clear-write and the busy-poll read are no-ops.
                }
                dmi_regs::ABSTRACTAUTO => {
                    if op == super::super::dtm::DmiRequest::WRITE {
                        self.abstractauto_reg = data;
                        self.autoexec = data & 1 != 0;
                    } else {
                        return Ok((self.abstractauto_reg as u64) << 2);
                    }
                }
                _ => {}
            }
            Ok(0)
        }

        fn tms_seq(&mut self, _bits: u64, _count: usize) -> Result<(), crate::link::DebugProbeError> {
            Ok(())
        }

        fn idle_cycles(&self) -> u8 {
            0
        }

        fn set_idle_cycles(&mut self, _idle: u8) {}
    }

    impl FakeAamJtagIo {
        fn run_fetch(&mut self) {
            let index = ((self.addr - self.base) / 4) as usize;
            self.staged = self.memory[index];
            self.addr += 4;
        }
    }

    #[test]
    fn read_aam_run_advances_once_per_word_with_autoexec() {
        use super::super::dtm::Dtm;

        let base = 0x2000_0000u32;
        let fake = FakeAamJtagIo {
            base,
            memory: vec![0x1111_1111, 0x2222_2222, 0x3333_3333],
            addr: base,
            staged: 0,
            autoexec: false,
            abstractauto_reg: 0,
        };
        let mut link = DebugLink::Jtag(Box::new(fake));
        let mut dmi = Dmi::for_test(Dtm::for_test(7, 0));

        let mut words = [0u32; 3];
        read_aam_run(&mut dmi, &mut link, base as u64, &mut words).unwrap();

        assert_eq!(words, [0x1111_1111, 0x2222_2222, 0x3333_3333]);
    }
}
