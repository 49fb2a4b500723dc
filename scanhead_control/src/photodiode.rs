//! Photodiode facet synchronizer.
//!
//! Turns facet-passage pulses into a locked rotor-period estimate and a
//! per-facet phase table.
//!
//! ## State Machine
//!
//! ```text
//! Inactive ──start()──► Seeking ──stable run ≥ STABLE_TIME──► Locked
//!                         ▲                                    │
//!                         └──── next tick ◄──── Lost ◄─────────┘
//!                                   (bad edge or missed edge)
//! ```
//!
//! - A stability run starts at the first edge. Every in-tolerance edge
//!   extends it; an out-of-tolerance or missed edge restarts it.
//! - The tolerance reference is the target period until a full revolution
//!   of good deltas is known, then the rolling mean of the last `FACETS`
//!   deltas.
//! - The locking edge becomes facet 0, the revolution reference. Facet
//!   offsets are the cumulative deltas of the preceding revolution and are
//!   refined on every later reference edge with a 1/4 smoothing factor.
//! - `Lost` is not an error. A seek episode longer than STABLE_TIME plus
//!   `LOCK_GRACE_PERIODS` target periods raises `DIODE_TIMEOUT`.

use heapless::{Deque, Vec};
use scanhead_common::consts::{LOCK_GRACE_PERIODS, MAX_FACETS, MISSED_EDGE_PERIODS};
use scanhead_common::scanhead::config::ScanTiming;
use scanhead_common::scanhead::error::ErrorFlags;
use scanhead_common::scanhead::state::LockStatus;
use tracing::{debug, error, info, warn};

use crate::error::ErrorAggregator;

// ─── Facet Table ────────────────────────────────────────────────────

/// Phase offsets of the exposed facets from the revolution reference edge.
///
/// Holds every facet, or only the designated one in single-facet mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacetTable {
    offsets: Vec<u64, MAX_FACETS>,
    first_facet: u8,
}

impl FacetTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Offset of entry `slot` [ticks].
    #[inline]
    pub fn offset(&self, slot: usize) -> Option<u64> {
        self.offsets.get(slot).copied()
    }

    /// Facet index of entry `slot`.
    #[inline]
    pub fn facet(&self, slot: usize) -> u8 {
        self.first_facet + slot as u8
    }

    /// `(facet, offset)` pairs in exposure order.
    pub fn entries(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.offsets
            .iter()
            .enumerate()
            .map(|(slot, &offset)| (self.facet(slot), offset))
    }
}

// ─── Rotor State ────────────────────────────────────────────────────

/// Snapshot of the rotor timing estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotorState {
    /// Facet period from RPM [ticks].
    pub target_period: u64,
    /// Rolling mean of the last FACETS edge deltas [ticks].
    pub measured_period: u64,
    /// Ticks since the last revolution reference edge.
    pub phase_accumulator: u64,
    pub lock_status: LockStatus,
}

/// Edge events observed during one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncTick {
    /// Rising photodiode edge this tick.
    pub edge: bool,
    /// Edge was a revolution reference while locked.
    pub reference: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Inactive,
    Seeking,
    Locked,
    Lost,
}

// ─── Synchronizer ───────────────────────────────────────────────────

/// Rising-edge tracker with lock supervision.
#[derive(Debug, Clone)]
pub struct PhotodiodeSync {
    facets: u8,
    single_facet: Option<u8>,
    target_period: u64,
    stable_ticks: u64,
    tolerance_ppm: u64,
    timeout_ticks: u64,

    phase: SyncPhase,
    last_level: bool,
    last_edge: Option<u64>,
    /// Last FACETS in-tolerance deltas, oldest first.
    history: Deque<u64, MAX_FACETS>,
    run_start: Option<u64>,
    good_deltas: u32,
    seek_start: u64,
    timed_out: bool,

    measured_period: u64,
    offsets: [u64; MAX_FACETS],
    table: FacetTable,
    facet_index: u8,
    ref_edge: u64,

    edges: u64,
    locks: u32,
    losses: u32,
}

impl PhotodiodeSync {
    pub fn new(timing: &ScanTiming) -> Self {
        Self {
            facets: timing.facets,
            single_facet: timing.single_facet,
            target_period: timing.target_period,
            stable_ticks: timing.stable_ticks,
            tolerance_ppm: timing.tolerance_ppm,
            timeout_ticks: timing.stable_ticks + LOCK_GRACE_PERIODS * timing.target_period,
            phase: SyncPhase::Inactive,
            last_level: false,
            last_edge: None,
            history: Deque::new(),
            run_start: None,
            good_deltas: 0,
            seek_start: 0,
            timed_out: false,
            measured_period: timing.target_period,
            offsets: [0; MAX_FACETS],
            table: FacetTable::default(),
            facet_index: 0,
            ref_edge: 0,
            edges: 0,
            locks: 0,
            losses: 0,
        }
    }

    // ── Accessors ──

    pub fn lock_status(&self) -> LockStatus {
        match self.phase {
            SyncPhase::Inactive => LockStatus::Unlocked,
            SyncPhase::Seeking | SyncPhase::Lost => LockStatus::Seeking,
            SyncPhase::Locked => LockStatus::Locked,
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.phase == SyncPhase::Locked
    }

    #[inline]
    pub fn measured_period(&self) -> u64 {
        self.measured_period
    }

    /// Tick of the latest revolution reference edge.
    #[inline]
    pub fn ref_edge(&self) -> u64 {
        self.ref_edge
    }

    #[inline]
    pub fn facet_table(&self) -> &FacetTable {
        &self.table
    }

    /// Facet index of the latest edge while locked.
    #[inline]
    pub fn facet_index(&self) -> u8 {
        self.facet_index
    }

    pub fn rotor_state(&self, now: u64) -> RotorState {
        RotorState {
            target_period: self.target_period,
            measured_period: self.measured_period,
            phase_accumulator: if self.is_locked() {
                now.saturating_sub(self.ref_edge)
            } else {
                0
            },
            lock_status: self.lock_status(),
        }
    }

    /// `(edges, locks acquired, locks lost)` counters.
    pub fn counters(&self) -> (u64, u32, u32) {
        (self.edges, self.locks, self.losses)
    }

    // ── Control ──

    /// Begin seeking lock. No effect unless inactive.
    pub fn start(&mut self, now: u64) {
        if self.phase != SyncPhase::Inactive {
            return;
        }
        self.phase = SyncPhase::Seeking;
        self.begin_episode(now);
        debug!(timeout_ticks = self.timeout_ticks, "photodiode seeking lock");
    }

    /// Stop tracking. Edge detection continues.
    pub fn stop(&mut self) {
        self.phase = SyncPhase::Inactive;
        self.restart_run();
        self.table = FacetTable::default();
    }

    /// Sample the photodiode for one tick.
    pub fn tick(&mut self, now: u64, level: bool, errors: &ErrorAggregator) -> SyncTick {
        let edge = level && !self.last_level;
        self.last_level = level;
        if edge {
            self.edges += 1;
        }

        let mut out = SyncTick {
            edge,
            reference: false,
        };

        match self.phase {
            SyncPhase::Inactive => {}
            SyncPhase::Lost => {
                self.phase = SyncPhase::Seeking;
                self.begin_episode(now);
                if edge {
                    self.seek_edge(now);
                }
            }
            SyncPhase::Seeking => {
                if edge {
                    self.seek_edge(now);
                } else if self.edge_overdue(now, self.reference_period()) {
                    debug!("photodiode edge missed while seeking");
                    self.restart_run();
                }
            }
            SyncPhase::Locked => {
                if edge {
                    out.reference = self.locked_edge(now);
                } else if self.edge_overdue(now, self.measured_period) {
                    self.lose(now, "edge missed");
                    self.restart_run();
                }
            }
        }

        if self.phase == SyncPhase::Seeking
            && !self.timed_out
            && now.saturating_sub(self.seek_start) > self.timeout_ticks
        {
            self.timed_out = true;
            error!(
                seek_ticks = now - self.seek_start,
                good_deltas = self.good_deltas,
                "no stable photodiode lock"
            );
            errors.raise(ErrorFlags::DIODE_TIMEOUT);
        }

        out
    }

    // ── Internals ──

    fn begin_episode(&mut self, now: u64) {
        self.seek_start = now;
        self.timed_out = false;
    }

    fn restart_run(&mut self) {
        self.history.clear();
        self.good_deltas = 0;
        self.run_start = None;
        self.last_edge = None;
    }

    fn reference_period(&self) -> u64 {
        if self.history.len() >= self.facets as usize {
            self.measured_period
        } else {
            self.target_period
        }
    }

    fn within_tolerance(&self, delta: u64, reference: u64) -> bool {
        let band = reference * self.tolerance_ppm / 1_000_000;
        delta.abs_diff(reference) <= band
    }

    fn edge_overdue(&self, now: u64, period: u64) -> bool {
        self.last_edge
            .is_some_and(|last| now - last > MISSED_EDGE_PERIODS * period)
    }

    fn record_delta(&mut self, delta: u64) {
        if self.history.len() >= self.facets as usize {
            self.history.pop_front();
        }
        // Capacity is MAX_FACETS >= facets, so this cannot overflow.
        let _ = self.history.push_back(delta);
        let sum: u64 = self.history.iter().sum();
        self.measured_period = sum / self.history.len() as u64;
    }

    fn seek_edge(&mut self, now: u64) {
        let Some(prev) = self.last_edge else {
            self.run_start = Some(now);
            self.last_edge = Some(now);
            return;
        };
        let delta = now - prev;
        let reference = self.reference_period();
        if self.within_tolerance(delta, reference) {
            self.record_delta(delta);
            self.good_deltas += 1;
        } else {
            debug!(delta, reference, "photodiode edge out of tolerance, run restarted");
            self.restart_run();
            self.run_start = Some(now);
        }
        self.last_edge = Some(now);

        let run_ticks = self.run_start.map_or(0, |start| now - start);
        if self.good_deltas >= self.facets as u32 && run_ticks >= self.stable_ticks {
            self.acquire(now);
        }
    }

    fn acquire(&mut self, now: u64) {
        self.phase = SyncPhase::Locked;
        self.facet_index = 0;
        self.ref_edge = now;
        self.locks += 1;

        let mut cumulative = 0;
        for (facet, delta) in self.history.iter().enumerate() {
            self.offsets[facet] = cumulative;
            cumulative += delta;
        }
        self.rebuild_table();
        info!(
            measured_period = self.measured_period,
            seek_ticks = now - self.seek_start,
            "photodiode locked"
        );
    }

    /// Returns true when the edge is a revolution reference.
    fn locked_edge(&mut self, now: u64) -> bool {
        let Some(prev) = self.last_edge else {
            self.last_edge = Some(now);
            return false;
        };
        let delta = now - prev;
        if !self.within_tolerance(delta, self.measured_period) {
            self.lose(now, "edge out of tolerance");
            self.restart_run();
            self.run_start = Some(now);
            self.last_edge = Some(now);
            return false;
        }
        self.record_delta(delta);
        self.last_edge = Some(now);
        self.facet_index = (self.facet_index + 1) % self.facets;
        if self.facet_index != 0 {
            return false;
        }
        self.ref_edge = now;
        self.refine();
        true
    }

    fn refine(&mut self) {
        let rotor = self.measured_period * self.facets as u64;
        let mut cumulative = 0u64;
        for (facet, delta) in self.history.iter().enumerate() {
            let old = self.offsets[facet] as i64;
            let smoothed = old + (cumulative as i64 - old) / 4;
            self.offsets[facet] = (smoothed.max(0) as u64).min(rotor.saturating_sub(1));
            cumulative += delta;
        }
        self.rebuild_table();
    }

    fn rebuild_table(&mut self) {
        let mut offsets = Vec::new();
        let first_facet = match self.single_facet {
            Some(facet) => {
                let _ = offsets.push(self.offsets[facet as usize]);
                facet
            }
            None => {
                for &offset in &self.offsets[..self.facets as usize] {
                    let _ = offsets.push(offset);
                }
                0
            }
        };
        self.table = FacetTable {
            offsets,
            first_facet,
        };
    }

    fn lose(&mut self, now: u64, reason: &'static str) {
        self.phase = SyncPhase::Lost;
        self.losses += 1;
        warn!(
            reason,
            last_edge = ?self.last_edge,
            since_ref = now.saturating_sub(self.ref_edge),
            "photodiode lock lost"
        );
    }
}
