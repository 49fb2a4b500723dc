//! State enums for the scanhead core.
//!
//! All enums use `#[repr(u8)]` so they can be carried in single-byte atomics
//! and status replies. `SystemMode` is the global mode owned by the command
//! processor; `MotorState` and `LockStatus` are the per-component states read
//! by the mode sequencer.

use serde::{Deserialize, Serialize};

// ─── Global Mode ────────────────────────────────────────────────────

/// Global operating mode.
///
/// Exactly one mode is active at any time. Only the command processor
/// writes it; every other component reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemMode {
    /// Power-on state, nothing driven.
    Idle = 0,
    /// Motor ramping toward target speed.
    Spinup = 1,
    /// Motor at speed, photodiode seeking lock.
    Stabilizing = 2,
    /// Locked, exposure engine active.
    Scanning = 3,
    /// Motor only, laser held off.
    MotorTest = 4,
    /// Laser on continuously, motor untouched.
    LaserTest = 5,
    /// Motor and laser on, no photodiode gating.
    LineTest = 6,
    /// Motor and laser on until the photodiode fires.
    PhotodiodeTest = 7,
    /// Explicitly stopped by the host.
    Stopped = 8,
    /// Critical fault; requires STOP.
    Error = 9,
}

impl SystemMode {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Spinup),
            2 => Some(Self::Stabilizing),
            3 => Some(Self::Scanning),
            4 => Some(Self::MotorTest),
            5 => Some(Self::LaserTest),
            6 => Some(Self::LineTest),
            7 => Some(Self::PhotodiodeTest),
            8 => Some(Self::Stopped),
            9 => Some(Self::Error),
            _ => None,
        }
    }

    /// Whether the polygon motor is driven in this mode.
    #[inline]
    pub const fn drives_motor(&self) -> bool {
        matches!(
            self,
            Self::Spinup
                | Self::Stabilizing
                | Self::Scanning
                | Self::MotorTest
                | Self::LineTest
                | Self::PhotodiodeTest
        )
    }

    /// Whether the photodiode synchronizer tracks lock in this mode.
    #[inline]
    pub const fn tracks_lock(&self) -> bool {
        matches!(self, Self::Stabilizing | Self::Scanning)
    }

    /// Whether START or a test command may leave this mode.
    #[inline]
    pub const fn accepts_start(&self) -> bool {
        matches!(self, Self::Idle | Self::Stopped)
    }
}

impl Default for SystemMode {
    fn default() -> Self {
        Self::Idle
    }
}

// ─── Motor ──────────────────────────────────────────────────────────

/// Polygon motor controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MotorState {
    /// Drive disabled.
    Off = 0,
    /// Drive clock running, inside the spin-up window.
    Ramping = 1,
    /// Spin-up window passed with motion observed.
    AtSpeed = 2,
    /// Spin-up or stall supervision failed.
    Fault = 3,
}

impl MotorState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Ramping),
            2 => Some(Self::AtSpeed),
            3 => Some(Self::Fault),
            _ => None,
        }
    }
}

impl Default for MotorState {
    fn default() -> Self {
        Self::Off
    }
}

// ─── Photodiode Lock ────────────────────────────────────────────────

/// Rotor lock status as reported to the rest of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockStatus {
    /// Synchronizer inactive.
    Unlocked = 0,
    /// Waiting for a stable run of edges.
    Seeking = 1,
    /// Edge timing predicts facet passage within tolerance.
    Locked = 2,
}

impl LockStatus {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unlocked),
            1 => Some(Self::Seeking),
            2 => Some(Self::Locked),
            _ => None,
        }
    }
}

impl Default for LockStatus {
    fn default() -> Self {
        Self::Unlocked
    }
}
