//! # Scanhead Control Library
//!
//! Timing and streaming core for a rotating-polygon laser scanhead. One
//! deterministic tick per pixel clock drives the polygon motor, locks onto
//! the facet photodiode and gates the laser from buffered scanlines, while a
//! host streams lines and commands through a two-byte wire protocol.
//!
//! ## Components
//!
//! | Module        | Role                                              |
//! |---------------|---------------------------------------------------|
//! | `buffer`      | SPSC scanline FIFO between host and tick          |
//! | `motor`       | Drive clock, spin-up and stall supervision        |
//! | `photodiode`  | Facet edge tracking, lock, phase table            |
//! | `exposure`    | Firing windows and bit streaming                  |
//! | `error`       | Sticky fault flags                                |
//! | `command`     | Host commands, mode sequencing                    |
//! | `cycle`       | Tick composition, batch runner, RT setup          |
//! | `sim`         | Simulated rotor, tachometer and photodiode        |
//!
//! ## Contexts
//!
//! The tick side owns the component FSMs and the buffer consumer. The command
//! side owns the buffer producer. They share nothing else but the atomics in
//! [`command::SharedStatus`].

pub mod buffer;
pub mod command;
pub mod cycle;
pub mod error;
pub mod exposure;
pub mod motor;
pub mod photodiode;
pub mod sim;
