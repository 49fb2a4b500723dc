//! Command processing root.
//!
//! Host command handling (serial context), the per-tick mode sequencer
//! (real-time context), and the status word both of them share.
//!
//! ## Single-Writer Rule
//!
//! `SystemMode` is written only from this module: by the processor on host
//! commands and by the sequencer on component progress. The sequencer uses
//! compare-and-swap so a concurrent STOP always wins. Error flags are written
//! only through the [`ErrorAggregator`].

pub mod processor;
pub mod sequencer;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use scanhead_common::scanhead::state::SystemMode;

use crate::error::ErrorAggregator;

/// Mode and fault word shared by the command side and the real-time side.
#[derive(Debug, Default)]
pub struct SharedStatus {
    mode: AtomicU8,
    errors: ErrorAggregator,
    /// Producer sequence number at the last STOP.
    stop_mark: AtomicU64,
    /// STOP commands processed.
    stops: AtomicU64,
}

impl SharedStatus {
    pub const fn new() -> Self {
        Self {
            mode: AtomicU8::new(SystemMode::Idle as u8),
            errors: ErrorAggregator::new(),
            stop_mark: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    /// Current global mode.
    #[inline]
    pub fn mode(&self) -> SystemMode {
        // Only valid codes are ever stored.
        SystemMode::from_u8(self.mode.load(Ordering::Acquire)).unwrap_or(SystemMode::Error)
    }

    #[inline]
    pub fn errors(&self) -> &ErrorAggregator {
        &self.errors
    }

    /// Records committed before the last STOP; the real-time side drops
    /// exactly these when it applies the STOP.
    #[inline]
    pub fn stop_mark(&self) -> u64 {
        self.stop_mark.load(Ordering::Acquire)
    }

    /// Number of STOPs so far. Lets the real-time side notice a STOP whose
    /// `Stopped` mode was overwritten by a new command before the next tick.
    #[inline]
    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Acquire)
    }

    /// Publish a STOP: the mark, then the mode, then the count. A reader
    /// that loads the count first and sees it advanced also sees the mode
    /// at `Stopped` or later. Returns the previous mode.
    pub(in crate::command) fn stop(&self, mark: u64) -> SystemMode {
        self.stop_mark.store(mark, Ordering::Release);
        let from = self.set_mode(SystemMode::Stopped);
        self.stops.fetch_add(1, Ordering::AcqRel);
        from
    }

    /// Unconditional mode write. Returns the previous mode.
    pub(in crate::command) fn set_mode(&self, mode: SystemMode) -> SystemMode {
        let prev = self.mode.swap(mode as u8, Ordering::AcqRel);
        SystemMode::from_u8(prev).unwrap_or(SystemMode::Error)
    }

    /// Move `from → to` only if the mode is still `from`.
    pub(in crate::command) fn transition(&self, from: SystemMode, to: SystemMode) -> bool {
        self.mode
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
