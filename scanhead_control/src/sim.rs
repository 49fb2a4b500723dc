//! Simulated polygon scanhead.
//!
//! Software stand-in for the motor driver, rotor, tachometer and photodiode
//! so the core can run without hardware.
//!
//! ## Physics
//!
//! - The commanded speed follows the drive clock: one revolution per
//!   `motor_pulses_per_rev` rising edges. Disabling the drive commands zero.
//! - Rotor speed follows the command with a first-order lag.
//! - Facet `f` passes the photodiode at angle `(k + error_f) / FACETS` of
//!   revolution `k`, producing a pulse `pulse_width` ticks wide after an
//!   optional random delay of up to `jitter_ticks`.
//! - The tachometer emits `motor_pulses_per_rev` square pulses per revolution.
//!
//! Fault injection: a seized rotor never turns, a blocked photodiode never
//! pulses.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use scanhead_common::consts::MAX_FACETS;
use scanhead_common::driver::{ScanheadDriver, TickInputs, TickOutputs};
use scanhead_common::scanhead::config::ScanTiming;
use tracing::{debug, trace};

/// Tunables of the simulated hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    /// Angular error of each facet [ppm of the facet pitch].
    pub facet_error_ppm: [i32; MAX_FACETS],
    /// Maximum random delay of a photodiode pulse [ticks].
    pub jitter_ticks: u64,
    /// Photodiode pulse width [ticks].
    pub pulse_width: u64,
    /// Rotor speed time constant [ticks]; a fifth of SPINUP_TIME if unset.
    pub time_constant_ticks: Option<u64>,
    /// Jitter generator seed.
    pub seed: u64,
    pub seized_rotor: bool,
    pub blocked_photodiode: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            facet_error_ppm: [0; MAX_FACETS],
            jitter_ticks: 0,
            pulse_width: 4,
            time_constant_ticks: None,
            seed: 0x5EED_CAFE_F00D_D00D,
            seized_rotor: false,
            blocked_photodiode: false,
        }
    }
}

/// Rotor, tachometer and photodiode model driven once per tick.
pub struct SimulatedScanhead {
    facets: u8,
    pulses_per_rev: u32,
    /// Speed response per tick (1 / time constant).
    alpha: f64,
    params: SimulationParams,

    now: u64,
    /// Rotor speed [rev/tick].
    speed: f64,
    /// Commanded speed [rev/tick].
    command: f64,
    /// Rotor angle since power-up [rev].
    phase: f64,
    last_clock: bool,
    last_rise: Option<u64>,

    /// Global index of the next facet passage.
    next_edge: u64,
    current_facet: u8,
    pulse_start: Option<u64>,
    rng: SmallRng,

    photodiode_pulses: u64,
    laser_ticks: u64,
    laser_by_facet: [u64; MAX_FACETS],
}

impl SimulatedScanhead {
    pub fn new(timing: &ScanTiming, params: SimulationParams) -> Self {
        let tau = params
            .time_constant_ticks
            .unwrap_or(timing.spinup_ticks / 5)
            .max(1);
        debug!(
            facets = timing.facets,
            tau,
            jitter = params.jitter_ticks,
            "simulated scanhead ready"
        );
        Self {
            facets: timing.facets,
            pulses_per_rev: timing.motor_pulses_per_rev.max(1),
            alpha: 1.0 / tau as f64,
            rng: SmallRng::seed_from_u64(params.seed),
            params,
            now: 0,
            speed: 0.0,
            command: 0.0,
            phase: 0.0,
            last_clock: false,
            last_rise: None,
            next_edge: 1,
            current_facet: 0,
            pulse_start: None,
            photodiode_pulses: 0,
            laser_ticks: 0,
            laser_by_facet: [0; MAX_FACETS],
        }
    }

    // ── Fault injection ──

    pub fn set_seized(&mut self, seized: bool) {
        self.params.seized_rotor = seized;
    }

    pub fn set_photodiode_blocked(&mut self, blocked: bool) {
        self.params.blocked_photodiode = blocked;
    }

    // ── Observation ──

    /// Rotor speed [rpm] at `pixel_clock_hz`.
    pub fn speed_rpm(&self, pixel_clock_hz: f64) -> f64 {
        self.speed * pixel_clock_hz * 60.0
    }

    /// Completed revolutions.
    pub fn revolutions(&self) -> u64 {
        self.phase as u64
    }

    /// Physical facet currently facing the beam.
    pub fn current_facet(&self) -> u8 {
        self.current_facet
    }

    pub fn photodiode_pulses(&self) -> u64 {
        self.photodiode_pulses
    }

    /// Ticks with the laser gate applied high.
    pub fn laser_ticks(&self) -> u64 {
        self.laser_ticks
    }

    /// Laser-on ticks per physical facet.
    pub fn laser_ticks_by_facet(&self) -> &[u64] {
        &self.laser_by_facet[..self.facets as usize]
    }

    // ── Internals ──

    fn edge_angle(&self, edge: u64) -> f64 {
        let facet = (edge % self.facets as u64) as usize;
        let error = self.params.facet_error_ppm[facet] as f64 * 1e-6;
        (edge as f64 + error) / self.facets as f64
    }

    /// Uniform delay in `0..=jitter_ticks`.
    fn jitter(&mut self) -> u64 {
        if self.params.jitter_ticks == 0 {
            return 0;
        }
        self.rng.gen_range(0..=self.params.jitter_ticks)
    }

    fn drive(&mut self, outputs: &TickOutputs) {
        if !outputs.motor_enable {
            self.command = 0.0;
            self.last_rise = None;
            self.last_clock = false;
            return;
        }
        if outputs.motor_clock && !self.last_clock {
            if let Some(prev) = self.last_rise {
                let period = self.now - prev;
                if period > 0 {
                    self.command = 1.0 / (self.pulses_per_rev as f64 * period as f64);
                }
            }
            self.last_rise = Some(self.now);
        }
        self.last_clock = outputs.motor_clock;
    }
}

impl ScanheadDriver for SimulatedScanhead {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn cycle(&mut self, outputs: &TickOutputs) -> TickInputs {
        self.drive(outputs);
        if self.params.seized_rotor {
            self.speed = 0.0;
        } else {
            self.speed += (self.command - self.speed) * self.alpha;
        }
        self.phase += self.speed;

        if outputs.laser {
            self.laser_ticks += 1;
            self.laser_by_facet[self.current_facet as usize] += 1;
        }

        while self.phase >= self.edge_angle(self.next_edge) {
            self.current_facet = (self.next_edge % self.facets as u64) as u8;
            self.next_edge += 1;
            if !self.params.blocked_photodiode {
                let delay = self.jitter();
                self.pulse_start = Some(self.now + delay);
                self.photodiode_pulses += 1;
                trace!(facet = self.current_facet, now = self.now, delay, "facet passage");
            }
        }

        let photodiode = self
            .pulse_start
            .is_some_and(|start| self.now >= start && self.now < start + self.params.pulse_width);
        let segment = (self.phase * self.pulses_per_rev as f64 * 2.0) as u64;
        let motor_feedback = segment % 2 == 1;

        self.now += 1;
        TickInputs {
            photodiode,
            motor_feedback,
        }
    }
}
