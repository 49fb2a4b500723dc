//! Per-tick mode sequencing (real-time context).
//!
//! Advances the START sequence from component progress and forces `Error`
//! on critical faults:
//!
//! | Mode        | Condition               | Next        |
//! |-------------|-------------------------|-------------|
//! | any active  | critical fault flag     | Error       |
//! | Spinup      | motor `AtSpeed`         | Stabilizing |
//! | Stabilizing | lock `Locked`           | Scanning    |
//! | Scanning    | lock not `Locked`       | Stabilizing |
//!
//! `Idle`, `Stopped` and `Error` never move here. Every write is a
//! compare-and-swap against the mode read at the start of the pass, so a
//! STOP issued concurrently by the host is never overwritten.

use scanhead_common::scanhead::state::{LockStatus, MotorState, SystemMode};
use tracing::{error, info};

use super::SharedStatus;

/// A transition performed by [`sequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub from: SystemMode,
    pub to: SystemMode,
}

/// Evaluate one sequencing pass from the previous tick's component states.
pub fn sequence(status: &SharedStatus, motor: MotorState, lock: LockStatus) -> Option<ModeChange> {
    let from = status.mode();
    let to = next_mode(from, motor, lock, status.errors().has_critical())?;

    if !status.transition(from, to) {
        return None;
    }
    if to == SystemMode::Error {
        error!(?from, errors = ?status.errors().snapshot(), "critical fault, entering ERROR");
    } else {
        info!(?from, ?to, "mode advanced");
    }
    Some(ModeChange { from, to })
}

/// Pure transition rule.
pub const fn next_mode(
    mode: SystemMode,
    motor: MotorState,
    lock: LockStatus,
    critical: bool,
) -> Option<SystemMode> {
    use SystemMode::*;

    if matches!(mode, Idle | Stopped | Error) {
        return None;
    }
    if critical {
        return Some(Error);
    }
    match (mode, motor, lock) {
        (Spinup, MotorState::AtSpeed, _) => Some(Stabilizing),
        (Stabilizing, _, LockStatus::Locked) => Some(Scanning),
        (Scanning, _, LockStatus::Unlocked | LockStatus::Seeking) => Some(Stabilizing),
        _ => None,
    }
}
