//! Abstract command and program buffer execution (component G, §4.G).

use std::time::{Duration, Instant};

use bitfield::bitfield;
use tracing::{debug, trace};

use crate::link::DebugLink;

use super::dmi::Dmi;
use super::{dmi_regs, AbstractCommandErrorKind, RiscvError};

const COMMAND_BUDGET: Duration = Duration::from_secs(1);

/// GPR register numbers live in `0x1000..=0x101F` (§4.G).
pub const GPR_BASE: u16 = 0x1000;
/// CSR register numbers live in `0x0000..=0x0FFF` (§4.G); a CSR's DMI
/// `regno` is simply its CSR address.
pub const CSR_BASE: u16 = 0x0000;

bitfield! {
    /// `ACCESS_REGISTER` command word, `COMMAND` register (§4.G, §6.3).
    #[derive(Clone, Copy)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;
    pub u8, cmdtype, set_cmdtype: 31, 24;
    pub u8, aarsize, set_aarsize: 22, 20;
    pub aarpostincrement, set_aarpostincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub u16, regno, set_regno: 15, 0;
}

bitfield! {
    /// `ACCESS_MEMORY` command word (§4.G, §6.3).
    #[derive(Clone, Copy)]
    pub struct AccessMemoryCommand(u32);
    impl Debug;
    pub u8, cmdtype, set_cmdtype: 31, 24;
    pub u8, aamsize, set_aamsize: 22, 20;
    pub aampostincrement, set_aampostincrement: 19;
    pub write, set_write: 16;
    pub u32, target_specific, set_target_specific: 15, 0;
}

/// Whether an abstract-command register access is `INIT` (first of an
/// autoexec run, postincrement armed) or `CONT` (subsequent accesses
/// inside the same run, §4.G "bulk access with autoexec").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessState {
    Init,
    Cont,
}

/// Runs one abstract command: writes `COMMAND`, polls `ABSTRACTCS.BUSY`,
/// and translates a non-zero `CMDERR` (§4.G "abstract command run").
pub fn run_command(dmi: &mut Dmi, link: &mut DebugLink, command: u32) -> Result<(), RiscvError> {
    let mut clear = super::dmi::Abstractcs(0);
    clear.set_cmderr(0x7);
    dmi.write(link, dmi_regs::ABSTRACTCS, clear.0)?;
    dmi.write(link, dmi_regs::COMMAND, command)?;

    let start = Instant::now();
    let abstractcs = loop {
        let abstractcs = dmi.abstractcs(link)?;
        if !abstractcs.busy() {
            break abstractcs;
        }
        if start.elapsed() > COMMAND_BUDGET {
            return Err(RiscvError::Timeout);
        }
    };

    match AbstractCommandErrorKind::parse(abstractcs.cmderr()) {
        AbstractCommandErrorKind::None => Ok(()),
        AbstractCommandErrorKind::Busy => {
            // The busy flag having cleared with cmderr==Busy means a
            // previous command was still in flight; one retry of the
            // same command is safe since it was never actually issued.
            run_command(dmi, link, command)
        }
        other => Err(RiscvError::AbstractCommand(other)),
    }
}

fn access_register_command(regno: u16, write: bool, state: AccessState) -> AccessRegisterCommand {
    let mut command = AccessRegisterCommand(0);
    command.set_cmdtype(0);
    command.set_aarsize(2); // AARSIZE=32 (encoding 2, §4.G)
    command.set_transfer(true);
    command.set_write(write);
    command.set_aarpostincrement(state == AccessState::Init);
    command.set_regno(regno);
    command
}

/// Reads one register via `ACCESS_REGISTER` (§4.G "Register access
/// (single)"). For an autoexec continuation, only `DATA0` is touched; the
/// command word itself was already armed by the previous access.
pub fn read_register(dmi: &mut Dmi, link: &mut DebugLink, regno: u16, state: AccessState) -> Result<u32, RiscvError> {
    if state == AccessState::Cont {
        let value = dmi.read(link, dmi_regs::DATA0)?;
        // autoexec fires the command as a side effect of the DATA0 read;
        // the busy-poll still applies before the value is considered final.
        let start = Instant::now();
        loop {
            if !dmi.abstractcs(link)?.busy() {
                return Ok(value);
            }
            if start.elapsed() > COMMAND_BUDGET {
                return Err(RiscvError::Timeout);
            }
        }
    }
    let command = access_register_command(regno, false, state);
    run_command(dmi, link, command.0)?;
    dmi.read(link, dmi_regs::DATA0)
}

/// Writes one register via `ACCESS_REGISTER`.
pub fn write_register(dmi: &mut Dmi, link: &mut DebugLink, regno: u16, value: u32, state: AccessState) -> Result<(), RiscvError> {
    if state == AccessState::Cont {
        dmi.write(link, dmi_regs::DATA0, value)?;
        let start = Instant::now();
        loop {
            if !dmi.abstractcs(link)?.busy() {
                return Ok(());
            }
            if start.elapsed() > COMMAND_BUDGET {
                return Err(RiscvError::Timeout);
            }
        }
    }
    dmi.write(link, dmi_regs::DATA0, value)?;
    let command = access_register_command(regno, true, state);
    run_command(dmi, link, command.0)
}

/// Reads `count` consecutive GPRs starting at `GPR_BASE + first`, using
/// autoexec when available (§4.G "bulk access with autoexec", invariant 7):
/// exactly one `COMMAND` write, one `AUTOEXEC` setup, `count` `DATA0` reads,
/// and one `AUTOEXEC` teardown.
pub fn read_register_block(dmi: &mut Dmi, link: &mut DebugLink, base: u16, first: u16, count: u16) -> Result<Vec<u32>, RiscvError> {
    let mut out = Vec::with_capacity(count as usize);
    if count > 1 && dmi.support_autoexecdata {
        dmi.write(link, dmi_regs::ABSTRACTAUTO, 1)?; // autoexecdata bit 0 (DATA0)
        for i in 0..count {
            let state = if i == 0 { AccessState::Init } else { AccessState::Cont };
            out.push(read_register(dmi, link, base + first + i, state)?);
        }
        dmi.write(link, dmi_regs::ABSTRACTAUTO, 0)?;
        trace!(count, "autoexec register block read");
    } else {
        for i in 0..count {
            out.push(read_register(dmi, link, base + first + i, AccessState::Init)?);
        }
    }
    Ok(out)
}

/// Uploads `program` to `PROGBUF`, padding with `EBREAK` when the Debug
/// Module doesn't implicitly append one (§4.G "Program buffer").
pub fn upload_program(dmi: &mut Dmi, link: &mut DebugLink, program: &[u32]) -> Result<(), RiscvError> {
    let capacity = dmi.progbuf_size as usize;
    let needed = program.len() + if dmi.impebreak { 0 } else { 1 };
    if needed > capacity {
        return Err(RiscvError::ProgramBufferTooSmall);
    }
    for (i, &word) in program.iter().enumerate() {
        dmi.write(link, dmi_regs::PROGBUF0 + i as u8, word)?;
    }
    if !dmi.impebreak {
        dmi.write(link, dmi_regs::PROGBUF0 + program.len() as u8, EBREAK)?;
    }
    Ok(())
}

/// `EBREAK`, the padding instruction for a program buffer with no implicit
/// trailing breakpoint.
pub const EBREAK: u32 = 0b000000000001_00000_000_00000_1110011;

/// Executes the uploaded program buffer via `ACCESS_REGISTER.POSTEXEC`
/// (§4.G).
pub fn execute_program(dmi: &mut Dmi, link: &mut DebugLink) -> Result<(), RiscvError> {
    let mut command = AccessRegisterCommand(0);
    command.set_cmdtype(0);
    command.set_postexec(true);
    run_command(dmi, link, command.0)
}

/// Assembles `csrrs rd, csr, x0` (pseudo-op `csrr`), used by the progbuf CSR
/// read path (§4.G).
pub fn csrr(rd: u8, csr: u16) -> u32 {
    i_type(0b1110011, 0, 0b010, rd, csr)
}

/// Assembles `csrrw x0, csr, rs` (pseudo-op `csrw`).
pub fn csrw(csr: u16, rs: u8) -> u32 {
    i_type(0b1110011, rs, 0b001, 0, csr)
}

/// Assembles `lw rd, offset(rs1)` / `lh` / `lb` by `width` (2=word, 1=half, 0=byte).
pub fn load(width: u8, offset: u16, base: u8, rd: u8) -> u32 {
    i_type(0b0000011, base, width, rd, offset)
}

fn i_type(opcode: u8, rs1: u8, funct3: u8, rd: u8, imm: u16) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | ((rs1 as u32) << 15) | ((funct3 as u32) << 12) | ((rd as u32) << 7) | opcode as u32
}

/// Assembles `sw rs2, offset(rs1)` / `sh` / `sb` by `width` (S-type).
pub fn store(width: u8, offset: u16, base: u8, rs2: u8) -> u32 {
    let opcode = 0b0100011u32;
    let imm = offset as u32 & 0xFFF;
    let imm_lo = imm & 0x1F;
    let imm_hi = imm >> 5;
    (imm_hi << 25) | ((rs2 as u32) << 20) | ((base as u32) << 15) | ((width as u32) << 12) | (imm_lo << 7) | opcode
}

/// Assembles `addi rd, rs1, imm`.
pub fn addi(rs1: u8, rd: u8, imm: u16) -> u32 {
    i_type(0b0010011, rs1, 0b000, rd, imm)
}

/// Reads a CSR through the program buffer: `csrr s0, csr`, read back `s0`
/// via an abstract register access (§4.G "progbuf-based CSR read"). Caller
/// is responsible for saving/restoring `s0` (GPR `0x1008`) around this.
pub fn read_csr_progbuf(dmi: &mut Dmi, link: &mut DebugLink, csr: u16) -> Result<u32, RiscvError> {
    const S0: u16 = GPR_BASE + 0x8;
    upload_program(dmi, link, &[csrr(8, csr)])?;
    execute_program(dmi, link)?;
    read_register(dmi, link, S0, AccessState::Init)
}

/// Writes a CSR through the program buffer: value into `s0` via abstract
/// access, then `csrw csr, s0`.
pub fn write_csr_progbuf(dmi: &mut Dmi, link: &mut DebugLink, csr: u16, value: u32) -> Result<(), RiscvError> {
    const S0: u16 = GPR_BASE + 0x8;
    write_register(dmi, link, S0, value, AccessState::Init)?;
    upload_program(dmi, link, &[csrw(csr, 8)])?;
    execute_program(dmi, link)
}

/// Reads a CSR, preferring the abstract-command fast path and falling back
/// to the program buffer when the register isn't directly supported
/// (§4.G, S4: "If CMDERR==EXCEPTION, surface 'register does not exist'").
pub fn read_csr(dmi: &mut Dmi, link: &mut DebugLink, csr: u16) -> Result<u32, RiscvError> {
    debug!(csr = format!("{csr:#x}"), "reading CSR");
    match read_register(dmi, link, CSR_BASE + csr, AccessState::Init) {
        Ok(v) => Ok(v),
        Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) if dmi.progbuf_size > 0 => {
            read_csr_progbuf(dmi, link, csr)
        }
        Err(e) => Err(e),
    }
}

pub fn write_csr(dmi: &mut Dmi, link: &mut DebugLink, csr: u16, value: u32) -> Result<(), RiscvError> {
    match write_register(dmi, link, CSR_BASE + csr, value, AccessState::Init) {
        Ok(()) => Ok(()),
        Err(RiscvError::AbstractCommand(AbstractCommandErrorKind::NotSupported)) if dmi.progbuf_size > 0 => {
            write_csr_progbuf(dmi, link, csr, value)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrr_matches_known_encoding() {
        // `csrr s0, mie` (mie = 0x304, s0 = x8): 0x30402473.
        assert_eq!(csrr(8, 0x304), 0x3040_2473);
    }

    #[test]
    fn csrw_matches_known_encoding() {
        // `csrw mstatus, x9`: 0x30049073.
        assert_eq!(csrw(0x300, 9), 0x3004_9073);
    }

    #[test]
    fn store_matches_known_encoding() {
        // `sw x1, 4(x2)`: 0x00112223.
        assert_eq!(store(2, 4, 2, 1), 0x0011_2223);
    }

    #[test]
    fn access_register_command_sets_aarsize_transfer_regno() {
        let command = access_register_command(super::CSR_BASE + 0x301, false, AccessState::Init);
        assert_eq!(command.aarsize(), 2);
        assert!(command.transfer());
        assert!(!command.write());
        assert_eq!(command.regno(), 0x301);
        assert!(command.aarpostincrement());
    }
}
