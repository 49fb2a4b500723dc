//! Polygon motor controller.
//!
//! Generates the square drive clock for the motor driver and supervises
//! rotor motion through the tachometer input.
//!
//! ```text
//! Off ──start()──► Ramping ──SPINUP_TIME, motion seen──► AtSpeed
//!                     │                                    │
//!                     └── no motion ──► Fault ◄── stall ───┘
//! ```
//!
//! `AtSpeed` only means the spin-up window passed with the rotor turning;
//! facet synchronization is the photodiode synchronizer's job.

use scanhead_common::scanhead::config::ScanTiming;
use scanhead_common::scanhead::error::ErrorFlags;
use scanhead_common::scanhead::state::MotorState;
use tracing::{debug, error, info};

use crate::error::ErrorAggregator;

/// Motor driver outputs for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorDrive {
    pub enable: bool,
    pub clock: bool,
}

/// Drive clock generator plus spin-up and stall supervision.
#[derive(Debug, Clone)]
pub struct MotorController {
    state: MotorState,
    half_period: u64,
    spinup_ticks: u64,
    stall_ticks: u64,
    supervised: bool,

    clock: bool,
    clock_phase: u64,
    ramp_elapsed: u64,
    motion_seen: bool,
    last_feedback: bool,
    since_feedback_edge: u64,
    feedback_edges: u64,
}

impl MotorController {
    pub fn new(timing: &ScanTiming) -> Self {
        Self {
            state: MotorState::Off,
            half_period: timing.motor_half_period.max(1),
            spinup_ticks: timing.spinup_ticks,
            stall_ticks: timing.stall_ticks,
            supervised: timing.motor_feedback,
            clock: false,
            clock_phase: 0,
            ramp_elapsed: 0,
            motion_seen: false,
            last_feedback: false,
            since_feedback_edge: 0,
            feedback_edges: 0,
        }
    }

    #[inline]
    pub const fn state(&self) -> MotorState {
        self.state
    }

    /// Tachometer rising edges seen since the last `start()`.
    pub const fn feedback_edges(&self) -> u64 {
        self.feedback_edges
    }

    /// Begin spin-up. No effect while already ramping or at speed.
    pub fn start(&mut self) {
        if matches!(self.state, MotorState::Ramping | MotorState::AtSpeed) {
            return;
        }
        self.state = MotorState::Ramping;
        self.clock = false;
        self.clock_phase = 0;
        self.ramp_elapsed = 0;
        self.motion_seen = false;
        self.since_feedback_edge = 0;
        self.feedback_edges = 0;
        debug!(
            half_period = self.half_period,
            spinup_ticks = self.spinup_ticks,
            "motor ramping"
        );
    }

    /// Disable the drive.
    pub fn stop(&mut self) {
        if self.state != MotorState::Off {
            debug!(from = ?self.state, "motor off");
        }
        self.state = MotorState::Off;
        self.clock = false;
    }

    /// Advance one tick.
    ///
    /// `feedback` is the sampled tachometer level. Raises `MOTOR_FAULT` when
    /// the spin-up window ends without motion or the rotor stalls.
    pub fn tick(&mut self, feedback: bool, errors: &ErrorAggregator) -> MotorDrive {
        let rising = feedback && !self.last_feedback;
        self.last_feedback = feedback;

        match self.state {
            MotorState::Off | MotorState::Fault => return MotorDrive::default(),
            MotorState::Ramping | MotorState::AtSpeed => {}
        }

        self.clock_phase += 1;
        if self.clock_phase >= self.half_period {
            self.clock_phase = 0;
            self.clock = !self.clock;
        }

        if rising {
            self.motion_seen = true;
            self.since_feedback_edge = 0;
            self.feedback_edges += 1;
        } else {
            self.since_feedback_edge = self.since_feedback_edge.saturating_add(1);
        }

        match self.state {
            MotorState::Ramping => {
                self.ramp_elapsed += 1;
                if self.ramp_elapsed >= self.spinup_ticks {
                    if !self.supervised || self.motion_seen {
                        self.state = MotorState::AtSpeed;
                        info!(
                            tach_edges = self.feedback_edges,
                            "motor at speed"
                        );
                    } else {
                        self.fault(errors, "no rotor motion within spin-up time");
                    }
                }
            }
            MotorState::AtSpeed => {
                if self.supervised && self.since_feedback_edge >= self.stall_ticks {
                    self.fault(errors, "rotor stalled");
                }
            }
            MotorState::Off | MotorState::Fault => {}
        }

        MotorDrive {
            enable: self.state != MotorState::Fault,
            clock: self.clock && self.state != MotorState::Fault,
        }
    }

    fn fault(&mut self, errors: &ErrorAggregator, reason: &'static str) {
        error!(reason, "motor fault");
        self.state = MotorState::Fault;
        self.clock = false;
        errors.raise(ErrorFlags::MOTOR_FAULT);
    }
}
