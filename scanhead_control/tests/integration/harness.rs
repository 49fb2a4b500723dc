//! Shared test rig: command processor + tick core + simulated scanhead.

use scanhead_common::prelude::*;
use scanhead_control::buffer::ScanlineBuffer;
use scanhead_control::command::SharedStatus;
use scanhead_control::command::processor::CommandProcessor;
use scanhead_control::cycle::{CycleRunner, Scanhead};
use scanhead_control::sim::{SimulatedScanhead, SimulationParams};

/// 3000 rpm, 4 facets, 1 MHz: facet period 5000 ticks, window 1750..3500,
/// 875 bits (110 bytes) per line, spin-up 10 000 ticks, stable 20 000 ticks.
pub fn fast_config() -> ScanheadConfig {
    ScanheadConfig {
        rpm: 3000.0,
        facets: 4,
        spinup_time: 0.01,
        stable_time: 0.02,
        ..Default::default()
    }
}

/// Rotor settles well inside the spin-up window.
pub fn fast_params() -> SimulationParams {
    SimulationParams {
        time_constant_ticks: Some(1000),
        ..Default::default()
    }
}

pub struct Rig<'a> {
    pub timing: ScanTiming,
    pub status: &'a SharedStatus,
    pub host: CommandProcessor<'a>,
    pub runner: CycleRunner<'a, SimulatedScanhead>,
}

/// Build a rig on the stack and hand it to `f`.
pub fn with_rig<R>(
    config: ScanheadConfig,
    params: SimulationParams,
    f: impl FnOnce(&mut Rig<'_>) -> R,
) -> R {
    let timing = config.timing().unwrap();
    let status = SharedStatus::new();
    let mut buffer = ScanlineBuffer::new();
    let (tx, rx) = buffer.split();
    let mut rig = Rig {
        timing,
        status: &status,
        host: CommandProcessor::new(&timing, &status, tx),
        runner: CycleRunner::new(
            Scanhead::new(&timing, &status, rx),
            SimulatedScanhead::new(&timing, params),
            &timing,
            1000,
        ),
    };
    f(&mut rig)
}

impl<'a> Rig<'a> {
    pub fn send(&mut self, command: Command) -> StatusReply {
        self.host.handle(command)
    }

    /// Stream one line as `LINE SCAN`, payload, `LINE STOP`.
    pub fn push_line(&mut self, bytes: &[u8]) {
        self.send(Command::Line(LineMarker::Scan));
        for &byte in bytes {
            self.send(Command::WriteLine(byte));
        }
        self.send(Command::Line(LineMarker::Stop));
    }

    pub fn full_line(&self, byte: u8) -> Vec<u8> {
        vec![byte; self.timing.bytes_per_line]
    }

    pub fn step(&mut self) -> TickOutputs {
        self.runner.step()
    }

    /// Step `ticks` times, returning every output.
    pub fn run(&mut self, ticks: u64) -> Vec<TickOutputs> {
        (0..ticks).map(|_| self.step()).collect()
    }

    /// Step until `done` holds, at most `limit` ticks. Returns the tick count
    /// at which it held.
    pub fn run_until(
        &mut self,
        limit: u64,
        mut done: impl FnMut(&Self, TickOutputs) -> bool,
    ) -> Option<u64> {
        for _ in 0..limit {
            let out = self.step();
            if done(self, out) {
                return Some(self.now());
            }
        }
        None
    }

    /// Step until the applied mode equals `mode`.
    pub fn run_until_mode(&mut self, mode: SystemMode, limit: u64) -> Option<u64> {
        self.run_until(limit, |rig, _| rig.head().mode() == mode)
    }

    pub fn head(&self) -> &Scanhead<'a> {
        self.runner.scanhead()
    }

    pub fn sim(&self) -> &SimulatedScanhead {
        self.runner.driver()
    }

    pub fn now(&self) -> u64 {
        self.head().now()
    }

    pub fn mode(&self) -> SystemMode {
        self.status.mode()
    }

    pub fn errors(&self) -> ErrorFlags {
        self.status.errors().snapshot()
    }
}
