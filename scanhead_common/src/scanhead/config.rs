//! Build-time scan parameters.
//!
//! `ScanheadConfig` is the TOML-facing parameter set. It is validated and
//! converted once into [`ScanTiming`], where every duration is expressed in
//! pixel-clock ticks. `ConfigStore` freezes that conversion: the core runs on
//! a single immutable timing value and any later attempt to install another
//! one fails with [`ConfigError::Immutable`].

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, SharedConfig};
use crate::consts::{
    MAX_DURATION_TICKS, MAX_FACET_PERIOD_TICKS, MAX_FACETS, MAX_LINE_BYTES, MAX_PIXEL_CLOCK_HZ,
    MIN_FACET_PERIOD_TICKS, OVERSAMPLING, STALL_REVOLUTIONS,
};

/// Parts-per-million scale used for window fractions and tolerances.
pub const PPM: u64 = 1_000_000;

// ─── Raw Parameters ─────────────────────────────────────────────────

/// Bit traversal order of a scanline record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// First bit first.
    #[default]
    Forward,
    /// Last bit first (optical fold reverses the scan).
    Backward,
}

/// Scan parameters as written in `[scanhead]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanheadConfig {
    /// Target rotor speed [rev/min].
    #[serde(default = "default_rpm")]
    pub rpm: f64,

    /// Number of polygon facets.
    #[serde(default = "default_facets")]
    pub facets: u8,

    /// Window start as percentage of the facet period.
    #[serde(default = "default_start_percent")]
    pub start_percent: f64,

    /// Window end as percentage of the facet period.
    #[serde(default = "default_end_percent")]
    pub end_percent: f64,

    /// Laser pixel clock, i.e. the control tick rate [Hz].
    #[serde(default = "default_pixel_clock_hz")]
    pub pixel_clock_hz: f64,

    /// Time allowed for the motor to reach speed [s].
    #[serde(default = "default_spinup_time")]
    pub spinup_time: f64,

    /// Time allowed for the photodiode to lock [s].
    #[serde(default = "default_stable_time")]
    pub stable_time: f64,

    /// Bit traversal order.
    #[serde(default)]
    pub direction: Direction,

    /// Re-expose the first buffered line in every window.
    #[serde(default)]
    pub single_line: bool,

    /// Expose only this facet index.
    #[serde(default)]
    pub single_facet: Option<u8>,

    /// Relative photodiode edge tolerance.
    #[serde(default = "default_lock_tolerance")]
    pub lock_tolerance: f64,

    /// Motor drive-clock pulses per revolution.
    #[serde(default = "default_motor_pulses_per_rev")]
    pub motor_pulses_per_rev: u32,

    /// Supervise rotor motion through the tachometer input.
    #[serde(default = "default_motor_feedback")]
    pub motor_feedback: bool,
}

fn default_rpm() -> f64 {
    2000.0
}
fn default_facets() -> u8 {
    4
}
fn default_start_percent() -> f64 {
    35.0
}
fn default_end_percent() -> f64 {
    70.0
}
fn default_pixel_clock_hz() -> f64 {
    1_000_000.0
}
fn default_spinup_time() -> f64 {
    1.5
}
fn default_stable_time() -> f64 {
    1.125
}
fn default_lock_tolerance() -> f64 {
    0.02
}
fn default_motor_pulses_per_rev() -> u32 {
    6
}
fn default_motor_feedback() -> bool {
    true
}

impl Default for ScanheadConfig {
    fn default() -> Self {
        Self {
            rpm: default_rpm(),
            facets: default_facets(),
            start_percent: default_start_percent(),
            end_percent: default_end_percent(),
            pixel_clock_hz: default_pixel_clock_hz(),
            spinup_time: default_spinup_time(),
            stable_time: default_stable_time(),
            direction: Direction::Forward,
            single_line: false,
            single_facet: None,
            lock_tolerance: default_lock_tolerance(),
            motor_pulses_per_rev: default_motor_pulses_per_rev(),
            motor_feedback: default_motor_feedback(),
        }
    }
}

/// Complete configuration file: `[shared]` + `[scanhead]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanheadFileConfig {
    #[serde(default)]
    pub shared: SharedConfig,
    #[serde(default)]
    pub scanhead: ScanheadConfig,
}

impl ScanheadConfig {
    /// Validate parameter bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: String) -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError(msg))
        }

        if !self.rpm.is_finite() || self.rpm <= 0.0 {
            return invalid(format!("rpm {} must be positive", self.rpm));
        }
        if self.facets == 0 || self.facets as usize > MAX_FACETS {
            return invalid(format!(
                "facets {} out of range [1, {MAX_FACETS}]",
                self.facets
            ));
        }
        if !(0.0..100.0).contains(&self.start_percent)
            || self.end_percent > 100.0
            || self.start_percent >= self.end_percent
        {
            return invalid(format!(
                "window {}%..{}% must satisfy 0 <= start < end <= 100",
                self.start_percent, self.end_percent
            ));
        }
        if !self.pixel_clock_hz.is_finite()
            || self.pixel_clock_hz <= 0.0
            || self.pixel_clock_hz > MAX_PIXEL_CLOCK_HZ
        {
            return invalid(format!(
                "pixel_clock_hz {} out of range (0, {MAX_PIXEL_CLOCK_HZ}]",
                self.pixel_clock_hz
            ));
        }
        if !(self.spinup_time > 0.0) || !(self.stable_time > 0.0) {
            return invalid(format!(
                "spinup_time {} and stable_time {} must be positive",
                self.spinup_time, self.stable_time
            ));
        }
        for (name, seconds) in [
            ("spinup_time", self.spinup_time),
            ("stable_time", self.stable_time),
        ] {
            let ticks = seconds * self.pixel_clock_hz;
            if !(ticks <= MAX_DURATION_TICKS as f64) {
                return invalid(format!(
                    "{name} {seconds} s is {ticks} ticks, above {MAX_DURATION_TICKS}"
                ));
            }
        }
        if !(self.lock_tolerance > 0.0 && self.lock_tolerance < 0.5) {
            return invalid(format!(
                "lock_tolerance {} out of range (0, 0.5)",
                self.lock_tolerance
            ));
        }
        if self.motor_pulses_per_rev == 0 {
            return invalid("motor_pulses_per_rev must be at least 1".to_string());
        }
        if let Some(facet) = self.single_facet {
            if facet >= self.facets {
                return invalid(format!(
                    "single_facet {facet} out of range [0, {})",
                    self.facets
                ));
            }
        }

        // Checked as a float: the integer conversion saturates.
        let raw_period = self.pixel_clock_hz * 60.0 / (self.rpm * self.facets as f64);
        if !(raw_period.round() <= MAX_FACET_PERIOD_TICKS as f64) {
            return invalid(format!(
                "facet period {raw_period} ticks above maximum {MAX_FACET_PERIOD_TICKS}"
            ));
        }
        let period = self.facet_period_ticks();
        if period < MIN_FACET_PERIOD_TICKS {
            return invalid(format!(
                "facet period {period} ticks below minimum {MIN_FACET_PERIOD_TICKS}"
            ));
        }
        let bits = self.bits_per_line();
        if bits == 0 {
            return invalid("exposure window shorter than one pixel".to_string());
        }
        let bytes = bits.div_ceil(8) as usize;
        if bytes > MAX_LINE_BYTES {
            return invalid(format!(
                "{bits} bits per line exceed the {MAX_LINE_BYTES}-byte line limit"
            ));
        }
        Ok(())
    }

    fn facet_period_ticks(&self) -> u64 {
        (self.pixel_clock_hz * 60.0 / (self.rpm * self.facets as f64)).round() as u64
    }

    fn start_ppm(&self) -> u64 {
        (self.start_percent * 10_000.0).round() as u64
    }

    fn end_ppm(&self) -> u64 {
        (self.end_percent * 10_000.0).round() as u64
    }

    fn bits_per_line(&self) -> u64 {
        let window = ExposureWindow::for_period(
            self.facet_period_ticks(),
            self.start_ppm(),
            self.end_ppm(),
        );
        window.length / OVERSAMPLING
    }

    fn seconds_to_ticks(&self, seconds: f64) -> u64 {
        (seconds * self.pixel_clock_hz).round() as u64
    }

    /// Validate and convert to tick units.
    pub fn timing(&self) -> Result<ScanTiming, ConfigError> {
        self.validate()?;

        let target_period = self.facet_period_ticks();
        let facets = self.facets;
        let rotor_period = target_period * facets as u64;
        let bits_per_line = self.bits_per_line();
        let motor_half_period = ((self.pixel_clock_hz * 60.0)
            / (self.rpm * self.motor_pulses_per_rev as f64 * 2.0))
            .round()
            .max(1.0) as u64;

        Ok(ScanTiming {
            pixel_clock_hz: self.pixel_clock_hz,
            facets,
            target_period,
            rotor_period,
            start_ppm: self.start_ppm(),
            end_ppm: self.end_ppm(),
            bits_per_line,
            bytes_per_line: bits_per_line.div_ceil(8) as usize,
            spinup_ticks: self.seconds_to_ticks(self.spinup_time),
            stable_ticks: self.seconds_to_ticks(self.stable_time),
            tolerance_ppm: (self.lock_tolerance * PPM as f64).round() as u64,
            motor_half_period,
            motor_pulses_per_rev: self.motor_pulses_per_rev,
            motor_feedback: self.motor_feedback,
            stall_ticks: STALL_REVOLUTIONS * rotor_period,
            direction: self.direction,
            single_line: self.single_line,
            single_facet: self.single_facet,
        })
    }
}

// ─── Derived Timing ─────────────────────────────────────────────────

/// Active firing window relative to a facet trigger [ticks].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureWindow {
    /// Delay from the facet trigger to the first exposed tick.
    pub offset: u64,
    /// Number of exposed ticks.
    pub length: u64,
}

impl ExposureWindow {
    /// Window for a facet period given start/end fractions in ppm.
    ///
    /// `offset = P·start`, `length = P·(end − start)`, both floored.
    #[inline]
    pub const fn for_period(period: u64, start_ppm: u64, end_ppm: u64) -> Self {
        Self {
            offset: period * start_ppm / PPM,
            length: period * (end_ppm - start_ppm) / PPM,
        }
    }

    /// First tick after the window.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Frozen scan parameters in tick units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanTiming {
    /// Tick rate [Hz].
    pub pixel_clock_hz: f64,
    /// Polygon facet count.
    pub facets: u8,
    /// Nominal facet period from RPM [ticks].
    pub target_period: u64,
    /// Nominal revolution [ticks].
    pub rotor_period: u64,
    /// Window start [ppm of facet period].
    pub start_ppm: u64,
    /// Window end [ppm of facet period].
    pub end_ppm: u64,
    /// Bits exposed per line.
    pub bits_per_line: u64,
    /// Bytes per full line.
    pub bytes_per_line: usize,
    /// SPINUP_TIME [ticks].
    pub spinup_ticks: u64,
    /// STABLE_TIME [ticks].
    pub stable_ticks: u64,
    /// Edge tolerance [ppm of period].
    pub tolerance_ppm: u64,
    /// Half period of the motor drive clock [ticks].
    pub motor_half_period: u64,
    /// Drive-clock pulses per revolution.
    pub motor_pulses_per_rev: u32,
    /// Tachometer supervision enabled.
    pub motor_feedback: bool,
    /// Silence on the tachometer treated as a stall [ticks].
    pub stall_ticks: u64,
    pub direction: Direction,
    pub single_line: bool,
    pub single_facet: Option<u8>,
}

impl ScanTiming {
    /// Window for a given measured facet period.
    #[inline]
    pub const fn window(&self, period: u64) -> ExposureWindow {
        ExposureWindow::for_period(period, self.start_ppm, self.end_ppm)
    }

    /// Nominal window at the target period.
    #[inline]
    pub const fn nominal_window(&self) -> ExposureWindow {
        self.window(self.target_period)
    }

    /// Allowed deviation from a period [ticks].
    #[inline]
    pub const fn tolerance_for(&self, period: u64) -> u64 {
        period * self.tolerance_ppm / PPM
    }

    /// Convert ticks to seconds (diagnostics only).
    #[inline]
    pub fn ticks_to_secs(&self, ticks: u64) -> f64 {
        ticks as f64 / self.pixel_clock_hz
    }
}

// ─── Freezing ───────────────────────────────────────────────────────

/// Holds the one timing value the core runs with.
#[derive(Debug, Default)]
pub struct ConfigStore {
    timing: OnceLock<ScanTiming>,
}

impl ConfigStore {
    pub const fn new() -> Self {
        Self {
            timing: OnceLock::new(),
        }
    }

    /// Validate `config` and install it.
    ///
    /// # Errors
    /// `ConfigError::Immutable` if a configuration is already installed;
    /// `ConfigError::ValidationError` if `config` is out of bounds.
    pub fn freeze(&self, config: &ScanheadConfig) -> Result<&ScanTiming, ConfigError> {
        if self.timing.get().is_some() {
            return Err(ConfigError::Immutable);
        }
        let timing = config.timing()?;
        self.timing.set(timing).map_err(|_| ConfigError::Immutable)?;
        self.timing.get().ok_or(ConfigError::Immutable)
    }

    /// Installed timing, if any.
    pub fn get(&self) -> Option<&ScanTiming> {
        self.timing.get()
    }
}
