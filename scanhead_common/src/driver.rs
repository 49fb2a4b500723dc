//! Hardware seam for the real-time tick.
//!
//! A driver samples the scanhead inputs and applies the outputs once per
//! pixel-clock tick. The simulated scanhead and any real I/O backend plug in
//! through [`ScanheadDriver`].

/// Inputs sampled at the start of a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickInputs {
    /// Photodiode level (high while the beam crosses the sensor).
    pub photodiode: bool,
    /// Tachometer level from the polygon motor.
    pub motor_feedback: bool,
}

/// Outputs computed by a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutputs {
    /// Laser gate.
    pub laser: bool,
    /// Motor driver enable.
    pub motor_enable: bool,
    /// Motor drive clock level.
    pub motor_clock: bool,
}

impl TickOutputs {
    /// Everything off.
    pub const OFF: Self = Self {
        laser: false,
        motor_enable: false,
        motor_clock: false,
    };
}

/// Interface of a pluggable scanhead I/O backend.
///
/// # Timing Contract
///
/// `cycle()` runs once per tick on the real-time thread and must not block
/// or allocate.
pub trait ScanheadDriver: Send {
    /// Driver identifier (e.g. "simulation").
    fn name(&self) -> &'static str;

    /// Apply `outputs` and return the inputs for the next tick.
    fn cycle(&mut self, outputs: &TickOutputs) -> TickInputs;
}
