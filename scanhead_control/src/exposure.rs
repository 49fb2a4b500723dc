//! Exposure engine: per-facet firing windows and bit streaming.
//!
//! While scanning, every reference edge starts a new revolution schedule.
//! Each facet-table entry `f` opens a window at
//! `ref + FacetTable[f] + window.offset` lasting `window.length` ticks, where
//! the window is recomputed from the measured facet period. At the first
//! tick of a window a record is taken from the buffer (or the retained record
//! in single-line mode); each bit is then held for `OVERSAMPLING` ticks.
//!
//! | Condition                         | Laser | Effect                     |
//! |-----------------------------------|-------|----------------------------|
//! | outside every window              | off   |                            |
//! | no record at window start         | off   | facet skipped              |
//! | bit `k < bits_per_line` available | bit   |                            |
//! | `k >= bits_per_line`              | off   | rest of window blank       |
//! | short record runs out             | off   | FIFO_UNDERRUN, line dropped|
//! | window ends early                 | off   | line truncated             |

use scanhead_common::consts::OVERSAMPLING;
use scanhead_common::scanhead::config::{Direction, ExposureWindow, ScanTiming};
use scanhead_common::scanhead::error::ErrorFlags;
use scanhead_common::scanhead::state::SystemMode;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::buffer::{LineConsumer, ScanlineRecord};
use crate::error::ErrorAggregator;
use crate::photodiode::{PhotodiodeSync, SyncTick};

/// Counters reported in the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExposureStats {
    /// Lines whose window opened with a record.
    pub lines_exposed: u64,
    /// Windows that found no record.
    pub windows_skipped: u64,
    /// Lines abandoned on underrun.
    pub underruns: u64,
    /// Lines cut short by the window end.
    pub truncated: u64,
    /// Ticks with the laser on.
    pub laser_ticks: u64,
}

#[derive(Debug, Clone)]
struct ActiveWindow {
    facet: u8,
    start: u64,
    end: u64,
    record: ScanlineRecord,
    /// Bits this line will expose: `min(record bits, bits_per_line)`.
    line_bits: u64,
}

/// Consumer of the scanline buffer and sole driver of the laser gate.
pub struct ExposureEngine<'a> {
    consumer: LineConsumer<'a>,
    bits_per_line: u64,
    direction: Direction,
    single_line: bool,
    start_ppm: u64,
    end_ppm: u64,

    /// Reference edge of the current revolution schedule.
    rev_ref: Option<u64>,
    next_slot: usize,
    active: Option<ActiveWindow>,
    retained: Option<ScanlineRecord>,
    /// Photodiode test: laser latched off after the first edge.
    diode_latched: bool,
    stats: ExposureStats,
}

impl<'a> ExposureEngine<'a> {
    pub fn new(timing: &ScanTiming, consumer: LineConsumer<'a>) -> Self {
        Self {
            consumer,
            bits_per_line: timing.bits_per_line,
            direction: timing.direction,
            single_line: timing.single_line,
            start_ppm: timing.start_ppm,
            end_ppm: timing.end_ppm,
            rev_ref: None,
            next_slot: 0,
            active: None,
            retained: None,
            diode_latched: false,
            stats: ExposureStats::default(),
        }
    }

    pub fn stats(&self) -> ExposureStats {
        self.stats
    }

    /// Whether a window is currently open.
    pub fn in_window(&self) -> bool {
        self.active.is_some()
    }

    /// Complete records waiting in the buffer.
    pub fn pending_lines(&self) -> usize {
        self.consumer.pending_lines()
    }

    /// Abandon any open window and revolution schedule.
    pub fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(facet = active.facet, "exposure window abandoned");
        }
        self.rev_ref = None;
        self.next_slot = 0;
        self.diode_latched = false;
    }

    /// Drop the retained line and every record committed before the
    /// producer sequence number `mark`.
    pub fn flush(&mut self, mark: u64) -> usize {
        self.retained = None;
        let dropped = self.consumer.drain_until(mark);
        if dropped > 0 {
            debug!(dropped, "scanline buffer flushed");
        }
        dropped
    }

    /// Compute the laser gate for tick `now`.
    pub fn tick(
        &mut self,
        now: u64,
        mode: SystemMode,
        sync: &PhotodiodeSync,
        events: SyncTick,
        errors: &ErrorAggregator,
    ) -> bool {
        let laser = match mode {
            SystemMode::Scanning => self.scan(now, sync, events, errors),
            SystemMode::LaserTest | SystemMode::LineTest => true,
            SystemMode::PhotodiodeTest => {
                if events.edge && !self.diode_latched {
                    self.diode_latched = true;
                    debug!(now, "photodiode triggered, laser off");
                }
                !self.diode_latched
            }
            _ => {
                if self.active.is_some() {
                    self.reset();
                }
                false
            }
        };
        if laser {
            self.stats.laser_ticks += 1;
        }
        laser
    }

    fn scan(
        &mut self,
        now: u64,
        sync: &PhotodiodeSync,
        events: SyncTick,
        errors: &ErrorAggregator,
    ) -> bool {
        if !sync.is_locked() {
            self.reset();
            return false;
        }
        if events.reference || self.rev_ref.is_none() {
            self.rev_ref = Some(sync.ref_edge());
            self.next_slot = 0;
        }

        self.close_expired(now);
        if self.active.is_none() {
            self.open_window(now, sync);
        }
        self.emit(now, errors)
    }

    /// Retire the active window once its end tick is reached, so a window
    /// starting on that same tick can open.
    fn close_expired(&mut self, now: u64) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if now < active.end {
            return;
        }
        if (active.end - active.start) / OVERSAMPLING < active.line_bits {
            self.stats.truncated += 1;
            trace!(facet = active.facet, "line truncated by window end");
        }
        self.active = None;
    }

    /// Open the next scheduled window if its first tick has come.
    fn open_window(&mut self, now: u64, sync: &PhotodiodeSync) {
        let Some(rev_ref) = self.rev_ref else {
            return;
        };
        let table = sync.facet_table();
        let window =
            ExposureWindow::for_period(sync.measured_period(), self.start_ppm, self.end_ppm);

        while let Some(offset) = table.offset(self.next_slot) {
            let start = rev_ref + offset + window.offset;
            let end = start + window.length;
            if now < start {
                return;
            }
            let facet = table.facet(self.next_slot);
            self.next_slot += 1;
            if now >= end {
                continue;
            }
            match self.acquire() {
                Some(record) => {
                    let line_bits = record.bit_len().min(self.bits_per_line);
                    trace!(facet, start, end, line_bits, "exposure window open");
                    self.stats.lines_exposed += 1;
                    self.active = Some(ActiveWindow {
                        facet,
                        start,
                        end,
                        record,
                        line_bits,
                    });
                }
                None => {
                    trace!(facet, "no scanline, facet skipped");
                    self.stats.windows_skipped += 1;
                }
            }
            return;
        }
    }

    fn acquire(&mut self) -> Option<ScanlineRecord> {
        if self.single_line {
            if self.retained.is_none() {
                self.retained = self.consumer.pop_line().ok();
            }
            return self.retained.clone();
        }
        self.consumer.pop_line().ok()
    }

    fn emit(&mut self, now: u64, errors: &ErrorAggregator) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };

        let k = (now - active.start) / OVERSAMPLING;
        if k >= self.bits_per_line {
            return false;
        }
        if k >= active.line_bits {
            warn!(
                facet = active.facet,
                bits = active.line_bits,
                expected = self.bits_per_line,
                "scanline underrun"
            );
            self.stats.underruns += 1;
            self.active = None;
            errors.raise(ErrorFlags::FIFO_UNDERRUN);
            return false;
        }

        let index = match self.direction {
            Direction::Forward => k,
            Direction::Backward => active.line_bits - 1 - k,
        };
        active.record.bit(index).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{LineProducer, ScanlineBuffer};
    use scanhead_common::scanhead::config::ScanheadConfig;

    fn timing(direction: Direction, single_line: bool) -> ScanTiming {
        ScanheadConfig {
            rpm: 3000.0,
            facets: 4,
            spinup_time: 0.01,
            stable_time: 0.02,
            direction,
            single_line,
            ..Default::default()
        }
        .timing()
        .unwrap()
    }

    fn push_record(tx: &mut LineProducer<'_>, bytes: &[u8]) {
        tx.open_line().unwrap();
        for &b in bytes {
            tx.push_byte(b).unwrap();
        }
        tx.close_line().unwrap();
    }

    /// Lock `sync` on an ideal pulse train and return the tick after lock.
    fn lock(sync: &mut PhotodiodeSync, errors: &ErrorAggregator, period: u64) -> u64 {
        sync.start(0);
        let mut now = 0;
        while !sync.is_locked() {
            sync.tick(now, now % period == 0, errors);
            now += 1;
        }
        now
    }

    /// Drive scanning from `from` for `ticks`, returning the laser trace.
    fn scan_trace(
        engine: &mut ExposureEngine<'_>,
        sync: &mut PhotodiodeSync,
        errors: &ErrorAggregator,
        period: u64,
        from: u64,
        ticks: u64,
    ) -> std::vec::Vec<bool> {
        (from..from + ticks)
            .map(|now| {
                let events = sync.tick(now, now % period == 0, errors);
                engine.tick(now, SystemMode::Scanning, sync, events, errors)
            })
            .collect()
    }

    #[test]
    fn window_property_holds_for_all_percent_pairs() {
        for period in [997u64, 5000, 7500, 123_457] {
            for start in 0..100u64 {
                for end in (start + 1)..=100 {
                    let w = ExposureWindow::for_period(period, start * 10_000, end * 10_000);
                    assert_eq!(w.offset, period * start / 100);
                    assert_eq!(w.length, period * (end - start) / 100);
                }
            }
        }
    }

    #[test]
    fn full_line_is_exposed_inside_window_only() {
        let t = timing(Direction::Forward, false);
        let errors = ErrorAggregator::new();
        let mut buffer = ScanlineBuffer::new();
        let (mut tx, rx) = buffer.split();
        push_record(&mut tx, &vec![0xFF; t.bytes_per_line]);

        let mut sync = PhotodiodeSync::new(&t);
        let mut engine = ExposureEngine::new(&t, rx);
        let period = t.target_period;
        let locked_at = lock(&mut sync, &errors, period) - 1;

        let trace = scan_trace(&mut engine, &mut sync, &errors, period, locked_at, period);
        let window = t.nominal_window();
        let on: std::vec::Vec<usize> = trace
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(on.first().copied(), Some(window.offset as usize));
        assert_eq!(
            on.len() as u64,
            t.bits_per_line * OVERSAMPLING,
            "every bit held two ticks"
        );
        assert!(on.iter().all(|&i| (i as u64) < window.end()));
        assert_eq!(engine.stats().lines_exposed, 1);
        assert!(errors.snapshot().is_empty());
    }

    #[test]
    fn adjacent_windows_hand_over_on_the_same_tick() {
        let t = ScanheadConfig {
            rpm: 3000.0,
            facets: 4,
            start_percent: 0.0,
            end_percent: 100.0,
            spinup_time: 0.01,
            stable_time: 0.02,
            ..Default::default()
        }
        .timing()
        .unwrap();
        let errors = ErrorAggregator::new();
        let mut buffer = ScanlineBuffer::new();
        let (mut tx, rx) = buffer.split();
        for _ in 0..3 {
            push_record(&mut tx, &vec![0xFF; t.bytes_per_line]);
        }

        let mut sync = PhotodiodeSync::new(&t);
        let mut engine = ExposureEngine::new(&t, rx);
        let period = t.target_period;
        let locked_at = lock(&mut sync, &errors, period) - 1;

        let trace = scan_trace(&mut engine, &mut sync, &errors, period, locked_at, 4 * period);
        let lit = 3 * period as usize;
        assert_eq!(trace.iter().position(|on| !on), Some(lit));
        assert!(trace[lit..].iter().all(|on| !on));
        assert_eq!(engine.stats().lines_exposed, 3);
        assert_eq!(engine.stats().truncated, 0);
        assert_eq!(engine.stats().underruns, 0);
        assert!(errors.snapshot().is_empty());
    }

    #[test]
    fn short_record_underruns_before_window_end() {
        let t = timing(Direction::Forward, false);
        let errors = ErrorAggregator::new();
        let mut buffer = ScanlineBuffer::new();
        let (mut tx, rx) = buffer.split();
        push_record(&mut tx, &[0xFF; 10]);

        let mut sync = PhotodiodeSync::new(&t);
        let mut engine = ExposureEngine::new(&t, rx);
        let period = t.target_period;
        let locked_at = lock(&mut sync, &errors, period) - 1;

        let trace = scan_trace(&mut engine, &mut sync, &errors, period, locked_at, period);
        let window = t.nominal_window();
        let last_on = trace.iter().rposition(|on| *on).unwrap() as u64;
        assert_eq!(last_on, window.offset + 80 * OVERSAMPLING - 1);
        assert!(last_on < window.end());
        assert_eq!(errors.snapshot(), ErrorFlags::FIFO_UNDERRUN);
        assert_eq!(engine.stats().underruns, 1);
    }

    #[test]
    fn empty_buffer_skips_facets_without_error() {
        let t = timing(Direction::Forward, false);
        let errors = ErrorAggregator::new();
        let mut buffer = ScanlineBuffer::new();
        let (_tx, rx) = buffer.split();

        let mut sync = PhotodiodeSync::new(&t);
        let mut engine = ExposureEngine::new(&t, rx);
        let period = t.target_period;
        let locked_at = lock(&mut sync, &errors, period) - 1;

        let trace = scan_trace(&mut engine, &mut sync, &errors, period, locked_at, 4 * period);
        assert!(trace.iter().all(|on| !on));
        assert_eq!(engine.stats().windows_skipped, 4);
        assert!(errors.snapshot().is_empty());
    }

    #[test]
    fn backward_direction_mirrors_forward() {
        let bytes: std::vec::Vec<u8> = (0..110u8).map(|b| b.wrapping_mul(37) ^ 0x5A).collect();
        let mut traces = std::vec::Vec::new();

        for direction in [Direction::Forward, Direction::Backward] {
            let t = timing(direction, false);
            let errors = ErrorAggregator::new();
            let mut buffer = ScanlineBuffer::new();
            let (mut tx, rx) = buffer.split();
            push_record(&mut tx, &bytes[..t.bytes_per_line]);

            let mut sync = PhotodiodeSync::new(&t);
            let mut engine = ExposureEngine::new(&t, rx);
            let period = t.target_period;
            let locked_at = lock(&mut sync, &errors, period) - 1;
            let trace = scan_trace(&mut engine, &mut sync, &errors, period, locked_at, period);

            let window = t.nominal_window();
            let bits: std::vec::Vec<bool> = (0..t.bits_per_line)
                .map(|k| trace[(window.offset + k * OVERSAMPLING) as usize])
                .collect();
            traces.push(bits);
        }

        let mut reversed = traces[1].clone();
        reversed.reverse();
        assert_eq!(traces[0], reversed);
        assert_ne!(traces[0], traces[1]);
    }

    #[test]
    fn single_line_reexposes_first_record() {
        let t = timing(Direction::Forward, true);
        let errors = ErrorAggregator::new();
        let mut buffer = ScanlineBuffer::new();
        let (mut tx, rx) = buffer.split();
        push_record(&mut tx, &vec![0xFF; t.bytes_per_line]);
        push_record(&mut tx, &vec![0x00; t.bytes_per_line]);

        let mut sync = PhotodiodeSync::new(&t);
        let mut engine = ExposureEngine::new(&t, rx);
        let period = t.target_period;
        let locked_at = lock(&mut sync, &errors, period) - 1;

        let trace = scan_trace(&mut engine, &mut sync, &errors, period, locked_at, 8 * period);
        let on = trace.iter().filter(|on| **on).count() as u64;
        assert_eq!(on, 8 * t.bits_per_line * OVERSAMPLING);
        assert_eq!(engine.pending_lines(), 1);
    }

    #[test]
    fn test_modes_gate_laser() {
        let t = timing(Direction::Forward, false);
        let errors = ErrorAggregator::new();
        let mut buffer = ScanlineBuffer::new();
        let (_tx, rx) = buffer.split();
        let sync = PhotodiodeSync::new(&t);
        let mut engine = ExposureEngine::new(&t, rx);
        let quiet = SyncTick::default();
        let edge = SyncTick {
            edge: true,
            reference: false,
        };

        assert!(engine.tick(0, SystemMode::LaserTest, &sync, quiet, &errors));
        assert!(engine.tick(1, SystemMode::LineTest, &sync, edge, &errors));
        assert!(!engine.tick(2, SystemMode::MotorTest, &sync, quiet, &errors));
        assert!(!engine.tick(3, SystemMode::Stopped, &sync, quiet, &errors));

        engine.reset();
        assert!(engine.tick(4, SystemMode::PhotodiodeTest, &sync, quiet, &errors));
        assert!(!engine.tick(5, SystemMode::PhotodiodeTest, &sync, edge, &errors));
        assert!(!engine.tick(6, SystemMode::PhotodiodeTest, &sync, quiet, &errors));
    }

    #[test]
    fn flush_drops_queued_lines() {
        let t = timing(Direction::Forward, true);
        let mut buffer = ScanlineBuffer::new();
        let (mut tx, rx) = buffer.split();
        push_record(&mut tx, &[1, 2, 3]);
        push_record(&mut tx, &[4]);
        let mut engine = ExposureEngine::new(&t, rx);
        assert_eq!(engine.flush(u64::MAX), 2);
        assert_eq!(engine.pending_lines(), 0);
    }
}
