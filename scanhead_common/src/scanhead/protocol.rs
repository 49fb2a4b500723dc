//! Byte-oriented host protocol.
//!
//! Every command is a fixed 2-byte frame `[opcode, data]` and every frame is
//! answered with a fixed 3-byte [`StatusReply`]. Line payload is streamed as
//! `LINE SCAN`, a run of `WRITE_L` frames, then `LINE STOP` (or the next
//! `LINE SCAN`).

use static_assertions::const_assert_eq;

use super::error::{ErrorFlags, ProtocolError};
use super::state::SystemMode;

/// Bytes in one command frame.
pub const FRAME_LEN: usize = 2;

/// Bytes in one status reply.
pub const REPLY_LEN: usize = 3;

const_assert_eq!(FRAME_LEN, 2);
const_assert_eq!(REPLY_LEN, 3);
const_assert_eq!(core::mem::size_of::<StatusReply>(), REPLY_LEN);

// ─── Opcodes ────────────────────────────────────────────────────────

/// Command opcode (first frame byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Status = 0x01,
    Start = 0x02,
    Stop = 0x03,
    ReadDiagnostic = 0x04,
    WriteLine = 0x05,
    MotorTest = 0x06,
    LaserTest = 0x07,
    LineTest = 0x08,
    PhotodiodeTest = 0x09,
    Line = 0x0A,
}

impl Opcode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Status),
            0x02 => Some(Self::Start),
            0x03 => Some(Self::Stop),
            0x04 => Some(Self::ReadDiagnostic),
            0x05 => Some(Self::WriteLine),
            0x06 => Some(Self::MotorTest),
            0x07 => Some(Self::LaserTest),
            0x08 => Some(Self::LineTest),
            0x09 => Some(Self::PhotodiodeTest),
            0x0A => Some(Self::Line),
            _ => None,
        }
    }
}

/// Line framing marker carried by `LINE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LineMarker {
    /// Close the open line.
    Stop = 0x00,
    /// Open a new line.
    Scan = 0x01,
}

impl LineMarker {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Stop),
            0x01 => Some(Self::Scan),
            _ => None,
        }
    }
}

// ─── Commands ───────────────────────────────────────────────────────

/// Decoded host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Start,
    Stop,
    /// Reserved diagnostic read.
    ReadDiagnostic,
    /// One payload byte for the open line.
    WriteLine(u8),
    MotorTest,
    LaserTest,
    LineTest,
    PhotodiodeTest,
    Line(LineMarker),
}

impl Command {
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Status => Opcode::Status,
            Self::Start => Opcode::Start,
            Self::Stop => Opcode::Stop,
            Self::ReadDiagnostic => Opcode::ReadDiagnostic,
            Self::WriteLine(_) => Opcode::WriteLine,
            Self::MotorTest => Opcode::MotorTest,
            Self::LaserTest => Opcode::LaserTest,
            Self::LineTest => Opcode::LineTest,
            Self::PhotodiodeTest => Opcode::PhotodiodeTest,
            Self::Line(_) => Opcode::Line,
        }
    }

    /// Encode into a wire frame. Commands without data carry `0x00`.
    pub const fn encode(&self) -> [u8; FRAME_LEN] {
        let data = match self {
            Self::WriteLine(byte) => *byte,
            Self::Line(marker) => *marker as u8,
            _ => 0x00,
        };
        [self.opcode() as u8, data]
    }

    /// Decode a wire frame.
    pub const fn decode(frame: [u8; FRAME_LEN]) -> Result<Self, ProtocolError> {
        let [op, data] = frame;
        let Some(opcode) = Opcode::from_u8(op) else {
            return Err(ProtocolError::UnknownOpcode(op));
        };
        Ok(match opcode {
            Opcode::Status => Self::Status,
            Opcode::Start => Self::Start,
            Opcode::Stop => Self::Stop,
            Opcode::ReadDiagnostic => Self::ReadDiagnostic,
            Opcode::WriteLine => Self::WriteLine(data),
            Opcode::MotorTest => Self::MotorTest,
            Opcode::LaserTest => Self::LaserTest,
            Opcode::LineTest => Self::LineTest,
            Opcode::PhotodiodeTest => Self::PhotodiodeTest,
            Opcode::Line => match LineMarker::from_u8(data) {
                Some(marker) => Self::Line(marker),
                None => return Err(ProtocolError::InvalidMarker(data)),
            },
        })
    }

    /// Test command target mode, if this is one.
    pub const fn test_mode(&self) -> Option<SystemMode> {
        match self {
            Self::MotorTest => Some(SystemMode::MotorTest),
            Self::LaserTest => Some(SystemMode::LaserTest),
            Self::LineTest => Some(SystemMode::LineTest),
            Self::PhotodiodeTest => Some(SystemMode::PhotodiodeTest),
            _ => None,
        }
    }
}

// ─── Status Reply ───────────────────────────────────────────────────

/// Reply sent for every command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct StatusReply {
    pub mode: SystemMode,
    pub errors: ErrorFlags,
    /// Full-length lines the buffer can still accept (saturated).
    pub free_lines: u8,
}

impl StatusReply {
    pub const fn encode(&self) -> [u8; REPLY_LEN] {
        [self.mode as u8, self.errors.bits(), self.free_lines]
    }

    /// Decode a reply. Unknown error bits are dropped.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let [mode, errors, free_lines] = bytes else {
            return Err(ProtocolError::MalformedReply);
        };
        let mode = SystemMode::from_u8(*mode).ok_or(ProtocolError::MalformedReply)?;
        Ok(Self {
            mode,
            errors: ErrorFlags::from_bits_truncate(*errors),
            free_lines: *free_lines,
        })
    }
}

// ─── Stream Framing ─────────────────────────────────────────────────

/// Reassembles fixed-size frames from a byte stream.
#[derive(Debug, Default, Clone)]
pub struct FrameDecoder {
    pending: Option<u8>,
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Feed one byte; returns a frame once both bytes have arrived.
    #[inline]
    pub fn push(&mut self, byte: u8) -> Option<[u8; FRAME_LEN]> {
        match self.pending.take() {
            Some(opcode) => Some([opcode, byte]),
            None => {
                self.pending = Some(byte);
                None
            }
        }
    }

    /// Drop a half-received frame.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}
