//! Sticky fault aggregation.
//!
//! Every component that detects a fault raises it here immediately. Flags
//! are OR-combined into one atomic word that the command side reads for each
//! status reply. Only STOP handling clears it.
//!
//! ## Propagation Model
//!
//! - **Non-critical** (`FIFO_UNDERRUN`, `FIFO_FULL`): reported, session keeps
//!   running. An underrun aborts only the current line.
//! - **Critical** (`DIODE_TIMEOUT`, `MOTOR_FAULT`): the mode sequencer forces
//!   `SystemMode::Error` on the next tick.

use std::sync::atomic::{AtomicU8, Ordering};

use scanhead_common::scanhead::error::ErrorFlags;
use tracing::{error, warn};

/// Lock-free OR-reduction of [`ErrorFlags`].
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    bits: AtomicU8,
}

impl ErrorAggregator {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    /// OR `flags` into the sticky word. Returns the newly set flags.
    #[inline]
    pub fn raise(&self, flags: ErrorFlags) -> ErrorFlags {
        let prev = self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
        let fresh = flags.difference(ErrorFlags::from_bits_truncate(prev));
        if fresh.has_critical() {
            error!(flags = ?fresh, "critical fault raised");
        } else if !fresh.is_empty() {
            warn!(flags = ?fresh, "fault raised");
        }
        fresh
    }

    /// Current flags.
    #[inline]
    pub fn snapshot(&self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_critical(&self) -> bool {
        self.snapshot().has_critical()
    }

    /// Clear only `flags`. Returns those of them that were set.
    pub fn clear_flags(&self, flags: ErrorFlags) -> ErrorFlags {
        let prev = self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
        ErrorFlags::from_bits_truncate(prev).intersection(flags)
    }

    /// Reset to empty. Returns the flags that were set.
    pub fn clear(&self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(self.bits.swap(0, Ordering::AcqRel))
    }
}
