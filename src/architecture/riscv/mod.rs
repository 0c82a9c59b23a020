//! RISC-V External Debug 0.13 engine (components E/F/G/H).
//!
//! Transport-specific DTM framing ([`dtm`]), the DMI engine and Debug
//! Module lifecycle ([`dmi`]), abstract-command/program-buffer execution
//! ([`abstract_cmd`]), and memory transfer strategies ([`mem`]).

pub mod abstract_cmd;
pub mod dmi;
pub mod dtm;
pub mod mem;

use std::fmt;

/// Errors which can occur while driving the RISC-V External Debug stack (§7).
#[derive(thiserror::Error, Debug)]
pub enum RiscvError {
    /// The link driver itself failed.
    #[error(transparent)]
    Probe(#[from] crate::link::DebugProbeError),

    /// A polling loop (halt, DMI busy, ...) exceeded its configured budget.
    #[error("operation timed out")]
    Timeout,

    /// `op` stayed `OP_BUSY` (DMI_BUSY) even after `dmi.idle` reached its cap.
    #[error("DMI stayed busy past the idle-cycle cap")]
    DmiBusy,

    /// A DMI transfer reported `OP_FAILED`.
    #[error("DMI operation failed")]
    DmiFailed,

    /// An abstract command reported a non-zero, non-retryable `cmderr`.
    #[error("abstract command failed: {0:?}")]
    AbstractCommand(AbstractCommandErrorKind),

    /// The debug transport module reported an unsupported version.
    #[error("unsupported debug transport module version: {0}")]
    UnsupportedDtmVersion(u8),

    /// The Debug Module reported it does not conform to version 0.13.
    #[error("unsupported debug module version: {0}")]
    UnsupportedDebugModuleVersion(u8),

    /// The Debug Module did not authenticate (`DMSTATUS.AUTHENTICATED == 0`).
    #[error("debug module requires authentication, which this core does not implement")]
    NotAuthenticated,

    /// `NEXTDM != 0`: this core supports only a single Debug Module.
    #[error("multiple debug modules are not supported")]
    MultipleDebugModulesUnsupported,

    /// No program buffer and no system bus access: this core cannot reach memory.
    #[error("no memory access strategy is available on this target")]
    NoMemoryAccessMethod,

    /// The program buffer is too small to hold the requested sequence.
    #[error("program buffer too small for the requested sequence")]
    ProgramBufferTooSmall,

    /// An unaligned access was requested and no narrower strategy is available.
    #[error("unaligned access at {address:#010x} and 8-bit system bus access is unavailable")]
    UnalignedAccessUnsupported {
        /// The address the unaligned access was attempted at.
        address: u64,
    },

    /// There is no RISC-V target on the other end of the link.
    #[error("no RISC-V target found")]
    NoRiscvTarget,

    /// A hart index outside the discovered range was requested.
    #[error("hart {0} is not present")]
    HartUnavailable(u32),
}

/// Errors which can occur while executing an abstract command (§4.G, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractCommandErrorKind {
    None,
    Busy,
    NotSupported,
    Exception,
    HaltResume,
    Bus,
    Other,
}

impl AbstractCommandErrorKind {
    pub fn parse(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Busy,
            2 => Self::NotSupported,
            3 => Self::Exception,
            4 => Self::HaltResume,
            5 => Self::Bus,
            _ => Self::Other,
        }
    }
}

/// Maximum number of harts this core will discover (§3, §4.F `RVDBG_MAX_HARTS`).
pub const RVDBG_MAX_HARTS: usize = 8;

/// Per-hart information read from `HARTINFO` during discovery (§3, §4.F).
#[derive(Debug, Clone, Copy, Default)]
pub struct HartInfo {
    pub idx: u32,
    pub mhartid: u32,
    pub nscratch: u8,
    pub dataaccess: bool,
    pub datasize: u8,
    pub dataaddr: u16,
}

/// Quirks attached to a particular debug-module/hart combination (§9).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiscvQuirks {
    /// Designer JEP106 ID, used to gate erratum workarounds.
    pub designer: u16,
    /// ESP32-C3 (designer `0x612`) remaps a single-step halt reported as
    /// `cause == 3` (breakpoint) to `cause == 4` (step) when `DCSR.STEP`
    /// is armed; the chip's trigger unit fires a breakpoint-shaped cause
    /// on single-step for reasons upstream never documented (§9 open
    /// question (b)).
    pub esp32c3_step_erratum: bool,
}

/// DMI register addresses, word-indexed (§6.3).
pub mod dmi_regs {
    pub const DATA0: u8 = 0x04;
    pub const DATA11: u8 = 0x0F;
    pub const DMCONTROL: u8 = 0x10;
    pub const DMSTATUS: u8 = 0x11;
    pub const HARTINFO: u8 = 0x12;
    pub const HALTSUM1: u8 = 0x13;
    pub const ABSTRACTCS: u8 = 0x16;
    pub const COMMAND: u8 = 0x17;
    pub const ABSTRACTAUTO: u8 = 0x18;
    pub const CONFSTRPTR0: u8 = 0x19;
    pub const NEXTDM: u8 = 0x1D;
    pub const PROGBUF0: u8 = 0x20;
    pub const PROGBUF15: u8 = 0x2F;
    pub const HALTSUM2: u8 = 0x34;
    pub const HALTSUM3: u8 = 0x35;
    pub const SBCS: u8 = 0x38;
    pub const SBADDRESS0: u8 = 0x39;
    pub const SBADDRESS1: u8 = 0x3A;
    pub const SBADDRESS2: u8 = 0x3B;
    pub const SBDATA0: u8 = 0x3C;
    pub const SBDATA1: u8 = 0x3D;
    pub const SBDATA2: u8 = 0x3E;
    pub const SBDATA3: u8 = 0x3F;
    pub const SBADDRESS3: u8 = 0x37;
    pub const HALTSUM0: u8 = 0x40;
}

/// CSR addresses this core cares about directly (§4.G).
pub mod csr {
    pub const MISA: u16 = 0x301;
    pub const DCSR: u16 = 0x7B0;
    pub const DPC: u16 = 0x7B1;
    pub const TSELECT: u16 = 0x7A0;
    pub const TDATA1: u16 = 0x7A1;
    pub const TDATA2: u16 = 0x7A2;
    pub const TINFO: u16 = 0x7A4;
    pub const MHARTID: u16 = 0xF14;
    pub const MVENDORID: u16 = 0xF11;
}

impl fmt::Display for AbstractCommandErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
