mod cancellation;
mod exposure;
mod faults;
mod harness;
mod start_sequence;
mod streaming;
