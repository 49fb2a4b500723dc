//! Fault flags and typed errors for the scanhead core.
//!
//! `ErrorFlags` is the sticky status word carried in every status reply.
//! Flags in `CRITICAL_MASK` force the global mode to `Error`; the FIFO flags
//! only report data-path trouble and leave the session running.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    /// Sticky fault flags. Cleared only by STOP.
    ///
    /// CRITICAL flags (→ `SystemMode::Error`): DIODE_TIMEOUT, MOTOR_FAULT.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u8 {
        /// Buffer exhausted inside an active exposure window.
        const FIFO_UNDERRUN = 0x01;
        /// Payload byte written against a full buffer (byte dropped).
        const FIFO_FULL     = 0x02;
        /// No stable photodiode lock within STABLE_TIME. **CRITICAL**.
        const DIODE_TIMEOUT = 0x04;
        /// No rotor motion within SPINUP_TIME, or rotor stalled. **CRITICAL**.
        const MOTOR_FAULT   = 0x08;
    }
}

impl ErrorFlags {
    /// Mask of all CRITICAL flags that force `SystemMode::Error`.
    pub const CRITICAL_MASK: Self =
        Self::from_bits_truncate(Self::DIODE_TIMEOUT.bits() | Self::MOTOR_FAULT.bits());

    /// Flags raised by the real-time tick (everything but `FIFO_FULL`).
    pub const RT_RAISED: Self = Self::from_bits_truncate(
        Self::FIFO_UNDERRUN.bits() | Self::DIODE_TIMEOUT.bits() | Self::MOTOR_FAULT.bits(),
    );

    /// Returns true if any CRITICAL flag is set.
    #[inline]
    pub const fn has_critical(&self) -> bool {
        self.intersects(Self::CRITICAL_MASK)
    }
}

impl Default for ErrorFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Scanline buffer operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// Byte or record capacity exhausted.
    #[error("scanline buffer full")]
    Full,
    /// No complete record available.
    #[error("scanline buffer empty")]
    Empty,
    /// Payload written while no record is open.
    #[error("no scanline open")]
    NoOpenLine,
    /// Open record already holds the maximum line length.
    #[error("scanline exceeds {max} bytes")]
    LineTooLong {
        /// Maximum bytes per record.
        max: usize,
    },
}

/// Wire protocol decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Opcode byte does not name a command.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    /// LINE data byte is not a framing marker.
    #[error("invalid line marker 0x{0:02x}")]
    InvalidMarker(u8),
    /// Reply shorter than the fixed reply size or with an invalid mode code.
    #[error("malformed status reply")]
    MalformedReply,
}
