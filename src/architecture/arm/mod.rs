//! ARM ADIv5/ADIv6 Debug Port and Access Port engine (component B/C),
//! Cortex-M/R attach (component D).

pub mod ap;
pub mod cortex_m;
pub mod cortex_r;
pub mod dp;
pub mod sequences;

use std::fmt;

/// Address of a debug port. Most systems have exactly one DP, selected
/// implicitly; `Multidrop` carries the `TARGETSEL` value used to select
/// one DP among several sharing a single SWD bus (DPv2+, §3/§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DpAddress {
    /// The single DP on the wire; used for JTAG chains and non-multidrop SWD.
    Default,
    /// One DP among several on a SWDv2 multidrop bus, identified by the
    /// `TARGETSEL` value that selects it.
    Multidrop(u32),
}

/// Address of an access port, scoped to the DP that owns it.
///
/// MEM-AP registers (§6.2) all live within a single banked byte
/// (`0x00..=0xFC`), so an 8-bit APSEL plus an 8-bit register address is
/// sufficient for every operation this core performs; this is the
/// documented simplification of full ADIv6 wide-address `SELECT1`
/// addressing recorded in `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApAddress {
    pub dp: DpAddress,
    pub apsel: u8,
}

impl ApAddress {
    pub fn new(dp: DpAddress, apsel: u8) -> Self {
        Self { dp, apsel }
    }
}

/// An error in the communication with a debug port or access port (§7).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DapError {
    /// A desynchronized SWD link; triggers protocol recovery.
    #[error("SWD protocol error between probe and target")]
    SwdProtocol,
    /// `NO_RESPONSE` acknowledge.
    #[error("target did not respond to request")]
    NoAcknowledge,
    /// `FAULT` acknowledge.
    #[error("target responded with FAULT")]
    FaultResponse,
    /// `WAIT` acknowledge, surfaced only after the soft retry budget expired.
    #[error("target responded with WAIT past the retry budget")]
    WaitResponse,
    /// The parity bit on a read did not match the received data.
    #[error("incorrect parity on read")]
    IncorrectParity,
}

/// All errors that can occur while driving the ADIv5/ADIv6 stack (§7).
#[derive(thiserror::Error, Debug)]
pub enum ArmError {
    /// A low-level DAP protocol error (sticky on the owning [`dp::DebugPort`]).
    #[error(transparent)]
    Dap(#[from] DapError),

    /// The link driver itself failed.
    #[error(transparent)]
    Probe(#[from] crate::link::DebugProbeError),

    /// A polling loop (halt, power-up, ...) exceeded its configured budget.
    #[error("operation timed out")]
    Timeout,

    /// DPv2+ protocol recovery failed to bring the link back to a known state.
    #[error("protocol recovery failed")]
    ProtocolRecoveryFailed,

    /// A requested memory transfer fell outside of addressable/alignment bounds.
    #[error("memory access out of bounds")]
    OutOfBounds,

    /// The requested transfer width is not supported by this access port.
    #[error("unsupported transfer width: {0} bits")]
    UnsupportedTransferWidth(usize),

    /// A `MEM_FAULT` surfaced via `check_error`, without poisoning the DP.
    #[error("memory access fault at {address:#010x}")]
    MemoryFault {
        /// The address the fault occurred at.
        address: u64,
    },

    /// No access port responded during enumeration.
    #[error("no access ports found on DP")]
    NoApFound,

    /// A value read back from a register did not decode to a known encoding.
    #[error("failed to parse register {register} from value {value:#010x}")]
    RegisterParse {
        /// Name of the register that failed to parse.
        register: &'static str,
        /// The raw value that failed to parse.
        value: u32,
    },
}

impl fmt::Display for DpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpAddress::Default => write!(f, "DP(default)"),
            DpAddress::Multidrop(targetsel) => write!(f, "DP(targetsel={targetsel:#010x})"),
        }
    }
}
