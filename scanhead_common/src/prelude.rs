//! Prelude module for common re-exports.
//!
//! ```rust
//! use scanhead_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};
pub use crate::scanhead::config::{
    ConfigStore, Direction, ExposureWindow, ScanTiming, ScanheadConfig, ScanheadFileConfig,
};

// ─── State & Faults ─────────────────────────────────────────────────
pub use crate::scanhead::error::{BufferError, ErrorFlags, ProtocolError};
pub use crate::scanhead::state::{LockStatus, MotorState, SystemMode};

// ─── Protocol ───────────────────────────────────────────────────────
pub use crate::scanhead::protocol::{
    Command, FrameDecoder, LineMarker, Opcode, StatusReply, FRAME_LEN, REPLY_LEN,
};

// ─── Hardware Seam ──────────────────────────────────────────────────
pub use crate::driver::{ScanheadDriver, TickInputs, TickOutputs};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{MAX_FACETS, MAX_LINE_BYTES, OVERSAMPLING};
