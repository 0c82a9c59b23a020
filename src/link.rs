//! The link driver contract (component A of the design).
//!
//! A link driver exposes only blocking primitives; neither SWD nor JTAG
//! sequencing is permitted to suspend and hand the wire to another
//! operation mid-sequence (§5, "single-threaded, cooperative, blocking").
//!
//! Everything above this module -- the ADIv5 DP/AP engines and the
//! RISC-V DTM -- is written against [`RawSwdIo`] and [`RawJtagIo`] only.
//! Bit-banging the physical SWD/JTAG clocks is an external collaborator's
//! job (§1, "deliberately out of scope").

use std::fmt;

/// The wire protocol a link is currently configured for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WireProtocol {
    /// Serial Wire Debug.
    Swd,
    /// JTAG.
    Jtag,
}

impl fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireProtocol::Swd => write!(f, "SWD"),
            WireProtocol::Jtag => write!(f, "JTAG"),
        }
    }
}

/// An error in the link driver itself -- everything below the DP/DTM
/// engines, i.e. a failure to shift bits at all (as opposed to a
/// protocol-level NACK, which the DP/DTM engines turn into their own
/// sticky error states).
#[derive(thiserror::Error, Debug)]
pub enum DebugProbeError {
    /// The underlying transport (USB, a remote agent, ...) reported an error.
    #[error("the probe transport reported an error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The probe does not support the requested protocol.
    #[error("the probe does not support the {0} protocol")]
    UnsupportedProtocol(WireProtocol),

    /// A timeout occurred while waiting for the link to respond.
    #[error("the link timed out")]
    Timeout,

    /// The requested functionality is not implemented by this link driver.
    #[error("'{0}' is not implemented by this link driver")]
    NotImplemented(&'static str),
}

/// Low-level SWD sequencing, as described in §4.A.
///
/// Implementations perform no ACK interpretation and no retries; that is
/// entirely the DP engine's job (§4.B). A sequence is just bits on the wire.
pub trait RawSwdIo {
    /// Clocks `bits` (1..=32) input bits from the target, LSB first.
    fn seq_in(&mut self, bits: usize) -> Result<u64, DebugProbeError>;

    /// Clocks `bits` input bits from the target and returns the parity bit
    /// that followed them.
    fn seq_in_parity(&mut self, bits: usize) -> Result<(u64, bool), DebugProbeError>;

    /// Clocks `bits` (1..=32) output bits to the target, LSB first.
    fn seq_out(&mut self, data: u64, bits: usize) -> Result<(), DebugProbeError>;

    /// Clocks `bits` output bits to the target followed by their parity bit.
    fn seq_out_parity(&mut self, data: u64, bits: usize) -> Result<(), DebugProbeError>;

    /// Clocks `count` clock-only idle cycles (data line held low).
    fn idle_cycles(&mut self, count: usize) -> Result<(), DebugProbeError> {
        for _ in 0..count {
            self.seq_out(0, 1)?;
        }
        Ok(())
    }
}

/// Low-level JTAG sequencing, as described in §4.A.
pub trait RawJtagIo {
    /// Shifts `ir` (active low-to-high bit order) into the instruction register
    /// of TAP `chain_index`.
    fn shift_ir(&mut self, chain_index: u8, ir: u64, bits: usize) -> Result<(), DebugProbeError>;

    /// Shifts `input` into the data register of TAP `chain_index` while
    /// capturing the shifted-out bits into the return value (full duplex).
    fn shift_dr(&mut self, chain_index: u8, input: u64, bits: usize) -> Result<u64, DebugProbeError>;

    /// Clocks `count` TMS bits, value `bits` (LSB first), typically used to
    /// drive the TAP state machine through Reset/Idle transitions.
    fn tms_seq(&mut self, bits: u64, count: usize) -> Result<(), DebugProbeError>;

    /// The number of `Run-Test/Idle` cycles inserted after a DR shift.
    fn idle_cycles(&self) -> u8;

    /// Sets the number of `Run-Test/Idle` cycles inserted after a DR shift.
    ///
    /// The RISC-V DTM busy-recovery path (§4.E) adjusts this at runtime.
    fn set_idle_cycles(&mut self, idle: u8);
}

/// A link driver is exactly one of these two personalities (§9: "re-architect
/// as a tagged sum").
pub enum DebugLink {
    /// Serial Wire Debug transport.
    Swd(Box<dyn RawSwdIo + Send>),
    /// JTAG transport.
    Jtag(Box<dyn RawJtagIo + Send>),
}

impl fmt::Debug for DebugLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugLink::Swd(_) => f.write_str("DebugLink::Swd"),
            DebugLink::Jtag(_) => f.write_str("DebugLink::Jtag"),
        }
    }
}

impl DebugLink {
    /// The protocol this link is currently speaking.
    pub fn protocol(&self) -> WireProtocol {
        match self {
            DebugLink::Swd(_) => WireProtocol::Swd,
            DebugLink::Jtag(_) => WireProtocol::Jtag,
        }
    }

    pub fn as_swd_mut(&mut self) -> Option<&mut (dyn RawSwdIo + Send)> {
        match self {
            DebugLink::Swd(s) => Some(s.as_mut()),
            DebugLink::Jtag(_) => None,
        }
    }

    pub fn as_jtag_mut(&mut self) -> Option<&mut (dyn RawJtagIo + Send)> {
        match self {
            DebugLink::Jtag(j) => Some(j.as_mut()),
            DebugLink::Swd(_) => None,
        }
    }
}
