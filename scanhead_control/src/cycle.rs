//! Deterministic real-time tick and batch cycle runner.
//!
//! ## Tick Order
//! 1. Load the mode; apply entry actions if the host changed it (STOP, START
//!    and the test commands land here). A STOP counted since the last tick
//!    is applied first even when a later command already replaced it.
//! 2. Sequence modes from the motor and lock states left by step 1, then
//!    apply entry actions for any sequenced change.
//! 3. Motor controller → photodiode synchronizer → exposure engine.
//! 4. Return laser, motor enable and motor clock outputs.
//!
//! No allocation and no blocking on the tick path.
//!
//! ## RT Setup Sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)`: lock all pages.
//! 2. Prefault stack pages.
//! 3. `sched_setaffinity`: pin to isolated CPU core.
//! 4. `sched_setscheduler(SCHED_FIFO, prio)`: RT priority.
//!
//! ## Cycle Loop
//! Ticks run in batches of `batch_ticks`. With the `rt` feature each batch
//! is paced on `CLOCK_MONOTONIC` with absolute-time sleeps and a batch that
//! exceeds its budget aborts the loop. Without it the loop free-runs and
//! overruns are only counted.

use std::sync::atomic::{AtomicBool, Ordering};

use scanhead_common::driver::{ScanheadDriver, TickInputs, TickOutputs};
use scanhead_common::scanhead::config::ScanTiming;
use scanhead_common::scanhead::error::ErrorFlags;
use scanhead_common::scanhead::state::{LockStatus, MotorState, SystemMode};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

use crate::buffer::LineConsumer;
use crate::command::sequencer;
use crate::command::SharedStatus;
use crate::exposure::{ExposureEngine, ExposureStats};
use crate::motor::MotorController;
use crate::photodiode::{PhotodiodeSync, RotorState};

// ─── Scanhead Core ──────────────────────────────────────────────────

/// Real-time side of the core: owns every component FSM and the buffer
/// consumer half.
pub struct Scanhead<'a> {
    status: &'a SharedStatus,
    motor: MotorController,
    sync: PhotodiodeSync,
    exposure: ExposureEngine<'a>,
    mode: SystemMode,
    /// STOPs applied so far.
    stops: u64,
    now: u64,
}

impl<'a> Scanhead<'a> {
    pub fn new(timing: &ScanTiming, status: &'a SharedStatus, consumer: LineConsumer<'a>) -> Self {
        Self {
            status,
            motor: MotorController::new(timing),
            sync: PhotodiodeSync::new(timing),
            exposure: ExposureEngine::new(timing, consumer),
            // A mode set before the first tick still gets its entry actions.
            mode: SystemMode::Idle,
            stops: 0,
            now: 0,
        }
    }

    /// Execute one pixel-clock tick.
    pub fn tick(&mut self, inputs: TickInputs) -> TickOutputs {
        let now = self.now;
        let errors = self.status.errors();

        self.apply_mode();
        sequencer::sequence(self.status, self.motor.state(), self.sync.lock_status());
        let mode = self.apply_mode();

        let drive = self.motor.tick(inputs.motor_feedback, errors);
        let events = self.sync.tick(now, inputs.photodiode, errors);
        let laser = self.exposure.tick(now, mode, &self.sync, events, errors);

        self.now += 1;
        TickOutputs {
            laser,
            motor_enable: drive.enable,
            motor_clock: drive.clock,
        }
    }

    /// Load the shared mode and run entry actions if it changed.
    fn apply_mode(&mut self) -> SystemMode {
        let stops = self.status.stops();
        let mode = self.status.mode();
        if stops != self.stops {
            self.stops = stops;
            self.enter(self.mode, SystemMode::Stopped);
            self.mode = SystemMode::Stopped;
        }
        if mode != self.mode {
            self.enter(self.mode, mode);
            self.mode = mode;
        }
        mode
    }

    /// Entry actions for `to`.
    fn enter(&mut self, from: SystemMode, to: SystemMode) {
        debug!(?from, ?to, now = self.now, "applying mode");

        if to == SystemMode::Stopped {
            self.motor.stop();
            self.sync.stop();
            self.exposure.reset();
            self.exposure.flush(self.status.stop_mark());
            // Faults raised by the tick that raced the STOP.
            let stale = self.status.errors().clear_flags(ErrorFlags::RT_RAISED);
            if !stale.is_empty() {
                debug!(?stale, "stale faults cleared after STOP");
            }
        }

        if to.drives_motor() {
            self.motor.start();
        }
        if to.tracks_lock() {
            self.sync.start(self.now);
        }
        match to {
            SystemMode::Stabilizing | SystemMode::Scanning => self.exposure.reset(),
            SystemMode::Error => {
                self.motor.stop();
                self.sync.stop();
                self.exposure.reset();
            }
            _ => {}
        }
    }

    // ── Observation ──

    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Mode applied at the last tick.
    #[inline]
    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn motor_state(&self) -> MotorState {
        self.motor.state()
    }

    pub fn lock_status(&self) -> LockStatus {
        self.sync.lock_status()
    }

    pub fn rotor_state(&self) -> RotorState {
        self.sync.rotor_state(self.now)
    }

    pub fn sync(&self) -> &PhotodiodeSync {
        &self.sync
    }

    pub fn exposure_stats(&self) -> ExposureStats {
        self.exposure.stats()
    }

    /// Whether an exposure window is open.
    pub fn in_window(&self) -> bool {
        self.exposure.in_window()
    }
}

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-batch timing statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    /// Total batches executed.
    pub batch_count: u64,
    /// Total ticks executed.
    pub tick_count: u64,
    /// Last batch duration [ns].
    pub last_batch_ns: i64,
    /// Minimum batch duration [ns].
    pub min_batch_ns: i64,
    /// Maximum batch duration [ns].
    pub max_batch_ns: i64,
    /// Running sum for average computation.
    pub sum_batch_ns: i64,
    /// Batches that exceeded their real-time budget.
    pub overruns: u64,
    /// Maximum wake-up latency [ns].
    pub max_latency_ns: i64,
}

impl CycleStats {
    pub const fn new() -> Self {
        Self {
            batch_count: 0,
            tick_count: 0,
            last_batch_ns: 0,
            min_batch_ns: i64::MAX,
            max_batch_ns: 0,
            sum_batch_ns: 0,
            overruns: 0,
            max_latency_ns: 0,
        }
    }

    /// Record a batch duration. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, ticks: u64, duration_ns: i64, latency_ns: i64) {
        self.batch_count += 1;
        self.tick_count += ticks;
        self.last_batch_ns = duration_ns;
        self.min_batch_ns = self.min_batch_ns.min(duration_ns);
        self.max_batch_ns = self.max_batch_ns.max(duration_ns);
        self.sum_batch_ns += duration_ns;
        self.max_latency_ns = self.max_latency_ns.max(latency_ns);
    }

    /// Average batch time [ns] (0 if no batches).
    #[inline]
    pub fn avg_batch_ns(&self) -> i64 {
        if self.batch_count == 0 {
            0
        } else {
            self.sum_batch_ns / self.batch_count as i64
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Errors during RT setup or cycle execution.
#[derive(Debug, Error)]
pub enum CycleError {
    /// RT system call failed.
    #[error("RT setup error: {0}")]
    RtSetup(String),
    /// Batch exceeded its real-time budget.
    #[error("batch overrun: {actual_ns}ns > {budget_ns}ns budget")]
    BatchOverrun {
        /// Actual batch duration [ns].
        actual_ns: i64,
        /// Budget for the batch [ns].
        budget_ns: i64,
    },
}

#[cfg(feature = "rt")]
fn rt_mlockall() -> Result<(), CycleError> {
    use nix::sys::mman::{mlockall, MlockallFlags};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| CycleError::RtSetup(format!("mlockall failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_mlockall() -> Result<(), CycleError> {
    Ok(())
}

/// Touch 256 KiB of stack so the tick loop takes no page faults.
fn prefault_stack() {
    let mut buf = [0u8; 256 * 1024];
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, exclusive reference into `buf`.
        unsafe { core::ptr::write_volatile(byte, 0xFF) };
    }
    core::hint::black_box(&buf);
}

#[cfg(feature = "rt")]
fn rt_set_affinity(cpu: usize) -> Result<(), CycleError> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| CycleError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| CycleError::RtSetup(format!("sched_setaffinity failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn rt_set_affinity(_cpu: usize) -> Result<(), CycleError> {
    Ok(())
}

#[cfg(feature = "rt")]
fn rt_set_scheduler(priority: i32) -> Result<(), CycleError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` outlives the call; pid 0 targets the calling thread.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(CycleError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn rt_set_scheduler(_priority: i32) -> Result<(), CycleError> {
    Ok(())
}

/// Prepare the calling thread for the tick loop.
///
/// In simulation mode (no `rt` feature), all RT calls are no-ops.
pub fn rt_setup(cpu_core: usize, rt_priority: i32) -> Result<(), CycleError> {
    rt_mlockall()?;
    prefault_stack();
    rt_set_affinity(cpu_core)?;
    rt_set_scheduler(rt_priority)?;
    Ok(())
}

// ─── Cycle Runner ───────────────────────────────────────────────────

/// Drives a [`Scanhead`] against a hardware driver in timed batches.
pub struct CycleRunner<'a, D: ScanheadDriver> {
    scanhead: Scanhead<'a>,
    driver: D,
    outputs: TickOutputs,
    batch_ticks: u64,
    batch_budget_ns: i64,
    stats: CycleStats,
}

impl<'a, D: ScanheadDriver> CycleRunner<'a, D> {
    pub fn new(scanhead: Scanhead<'a>, driver: D, timing: &ScanTiming, batch_ticks: u64) -> Self {
        let batch_ticks = batch_ticks.max(1);
        let batch_budget_ns = (batch_ticks as f64 * 1e9 / timing.pixel_clock_hz) as i64;
        debug!(
            driver = driver.name(),
            batch_ticks, batch_budget_ns, "cycle runner ready"
        );
        Self {
            scanhead,
            driver,
            outputs: TickOutputs::OFF,
            batch_ticks,
            batch_budget_ns,
            stats: CycleStats::new(),
        }
    }

    pub fn scanhead(&self) -> &Scanhead<'a> {
        &self.scanhead
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    /// Outputs applied at the last tick.
    pub fn outputs(&self) -> TickOutputs {
        self.outputs
    }

    /// One tick: apply the previous outputs, sample, compute new outputs.
    #[inline]
    pub fn step(&mut self) -> TickOutputs {
        let inputs = self.driver.cycle(&self.outputs);
        self.outputs = self.scanhead.tick(inputs);
        self.outputs
    }

    fn batch_body(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Run until `running` clears or `max_ticks` ticks have executed.
    ///
    /// # Errors
    /// With the `rt` feature, `CycleError::BatchOverrun` on the first batch
    /// that exceeds its budget.
    pub fn run(&mut self, running: &AtomicBool, max_ticks: u64) -> Result<u64, CycleError> {
        #[cfg(feature = "rt")]
        {
            self.run_rt_loop(running, max_ticks)
        }

        #[cfg(not(feature = "rt"))]
        {
            self.run_sim_loop(running, max_ticks)
        }
    }

    #[cfg(feature = "rt")]
    fn run_rt_loop(&mut self, running: &AtomicBool, max_ticks: u64) -> Result<u64, CycleError> {
        use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};

        let clock = ClockId::CLOCK_MONOTONIC;
        let now = |what: &str| {
            clock_gettime(clock).map_err(|e| CycleError::RtSetup(format!("{what}: {e}")))
        };
        let mut next_wake = now("clock_gettime")?;

        while running.load(Ordering::Relaxed) && self.scanhead.now() < max_ticks {
            let ticks = self.batch_ticks.min(max_ticks - self.scanhead.now());

            let batch_start = now("clock_gettime")?;
            let wake_latency_ns = timespec_diff_ns(&batch_start, &next_wake).abs();
            next_wake = timespec_add_ns(next_wake, self.batch_budget_ns);

            self.batch_body(ticks);

            let batch_end = now("clock_gettime")?;
            let duration_ns = timespec_diff_ns(&batch_end, &batch_start);
            self.stats.record(ticks, duration_ns, wake_latency_ns);

            if duration_ns > self.batch_budget_ns {
                self.stats.overruns += 1;
                return Err(CycleError::BatchOverrun {
                    actual_ns: duration_ns,
                    budget_ns: self.batch_budget_ns,
                });
            }

            let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &next_wake);
        }
        Ok(self.scanhead.now())
    }

    #[cfg(not(feature = "rt"))]
    fn run_sim_loop(&mut self, running: &AtomicBool, max_ticks: u64) -> Result<u64, CycleError> {
        use std::time::Instant;

        while running.load(Ordering::Relaxed) && self.scanhead.now() < max_ticks {
            let ticks = self.batch_ticks.min(max_ticks - self.scanhead.now());
            let batch_start = Instant::now();

            self.batch_body(ticks);

            let duration_ns = batch_start.elapsed().as_nanos() as i64;
            self.stats.record(ticks, duration_ns, 0);
            if duration_ns > self.batch_budget_ns {
                // Simulation runs slower than the pixel clock; count only.
                self.stats.overruns += 1;
                trace!(duration_ns, budget_ns = self.batch_budget_ns, "batch overrun");
            }
        }
        Ok(self.scanhead.now())
    }
}

// ─── Time Helpers ───────────────────────────────────────────────────

#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let total = ts.tv_nsec() + ns;
    TimeSpec::new(
        ts.tv_sec() + total.div_euclid(1_000_000_000),
        total.rem_euclid(1_000_000_000),
    )
}

#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

// ─── Tests ──────────────────────────────────────────────────────────
