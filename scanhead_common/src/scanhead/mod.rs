//! Scanhead shared types.
//!
//! Everything the real-time core, the command side and host tooling agree
//! on: state enums, fault flags, frozen timing, and the wire protocol.

pub mod config;
pub mod error;
pub mod protocol;
pub mod state;
