//! Scanhead Common Library
//!
//! Shared constants, types, wire protocol and configuration loading for the
//! polygon scanhead workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Capacities, limits and timing constants
//! - [`config`] - Configuration loading traits and types
//! - [`scanhead`] - State enums, fault flags, frozen timing, wire protocol
//! - [`driver`] - Hardware seam used by the real-time tick
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use scanhead_common::prelude::*;
//!
//! let timing = ScanheadConfig::default().timing().unwrap();
//! assert_eq!(timing.facets, 4);
//! ```

pub mod config;
pub mod consts;
pub mod driver;
pub mod prelude;
pub mod scanhead;
