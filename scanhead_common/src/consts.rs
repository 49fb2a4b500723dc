//! System-wide constants for the scanhead workspace.
//!
//! Single source of truth for numeric limits, capacities and defaults.
//! Imported by both crates.

use static_assertions::const_assert;

/// Laser ticks per buffered bit. The laser toggles at twice the
/// data-streaming rate, so every bit is held for two pixel-clock ticks.
pub const OVERSAMPLING: u64 = 2;

/// Maximum laser toggle rate [Hz].
pub const MAX_PIXEL_CLOCK_HZ: f64 = 50_000_000.0;

/// Maximum polygon facet count.
pub const MAX_FACETS: usize = 16;

/// Maximum bytes in one scanline record.
pub const MAX_LINE_BYTES: usize = 512;

/// Backing size of the scanline byte queue (usable capacity is one less).
pub const BUFFER_BYTES: usize = 4096;

/// Backing size of the scanline record queue (usable capacity is one less).
pub const BUFFER_LINES: usize = 64;

/// Facet periods without an edge before the lock is declared lost.
pub const MISSED_EDGE_PERIODS: u64 = 2;

/// Extra facet periods granted on top of STABLE_TIME before DIODE_TIMEOUT.
pub const LOCK_GRACE_PERIODS: u64 = 3;

/// Nominal revolutions without a tachometer edge before a stall is declared.
pub const STALL_REVOLUTIONS: u64 = 2;

/// Smallest facet period accepted by validation [ticks].
pub const MIN_FACET_PERIOD_TICKS: u64 = 16;

/// Largest facet period accepted by validation [ticks]. Keeps window
/// arithmetic (`period * PPM`) inside `u64`.
pub const MAX_FACET_PERIOD_TICKS: u64 = 1 << 32;

/// Largest SPINUP_TIME or STABLE_TIME accepted, in ticks.
pub const MAX_DURATION_TICKS: u64 = 1 << 48;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/scanhead.toml";

const_assert!(MAX_FACETS <= u8::MAX as usize);
const_assert!(MAX_LINE_BYTES < BUFFER_BYTES);
const_assert!(MAX_LINE_BYTES * 8 <= u16::MAX as usize);
const_assert!(BUFFER_BYTES.is_power_of_two());
const_assert!(BUFFER_LINES.is_power_of_two());
const_assert!(MIN_FACET_PERIOD_TICKS < MAX_FACET_PERIOD_TICKS);
const_assert!(MAX_FACET_PERIOD_TICKS.checked_mul(1_000_000 * MAX_FACETS as u64).is_some());
