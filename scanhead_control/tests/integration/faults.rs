//! Integration test: fault handling and recovery.
//!
//! 1. No tachometer motion during SPINUP_TIME → MOTOR_FAULT → ERROR
//! 2. STOP clears the fault word; START recovers
//! 3. Rotor stall while scanning → MOTOR_FAULT → ERROR
//! 4. Lock lost while scanning and never regained → DIODE_TIMEOUT → ERROR
//! 5. FIFO_FULL is reported but not critical

use scanhead_common::consts::LOCK_GRACE_PERIODS;
use scanhead_common::prelude::*;
use scanhead_control::sim::SimulationParams;

use super::harness::{fast_config, fast_params, with_rig};

#[test]
fn seized_rotor_faults_at_end_of_spinup() {
    let params = SimulationParams {
        seized_rotor: true,
        ..fast_params()
    };
    with_rig(fast_config(), params, |rig| {
        rig.send(Command::Start);
        let error_at = rig
            .run_until_mode(SystemMode::Error, 20_000)
            .expect("motor fault");

        assert!(error_at >= rig.timing.spinup_ticks);
        assert!(rig.errors().contains(ErrorFlags::MOTOR_FAULT));
        assert!(!rig.step().motor_enable);

        // Payload is refused while in ERROR.
        let before = rig.host.stats().bytes_written;
        rig.send(Command::Line(LineMarker::Scan));
        rig.send(Command::WriteLine(0xFF));
        assert_eq!(rig.host.stats().bytes_written, before);
    });
}

#[test]
fn stop_clears_fault_and_start_recovers() {
    let params = SimulationParams {
        seized_rotor: true,
        ..fast_params()
    };
    with_rig(fast_config(), params, |rig| {
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Error, 20_000)
            .expect("motor fault");

        let reply = rig.send(Command::Stop);
        assert_eq!(reply.mode, SystemMode::Stopped);
        assert!(reply.errors.is_empty());
        rig.step();
        assert_eq!(rig.head().mode(), SystemMode::Stopped);

        rig.runner.driver_mut().set_seized(false);
        assert_eq!(rig.send(Command::Start).mode, SystemMode::Spinup);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("recovered to scanning");
        assert!(rig.errors().is_empty());
    });
}

#[test]
fn stall_while_scanning_forces_error() {
    with_rig(fast_config(), fast_params(), |rig| {
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");

        rig.runner.driver_mut().set_seized(true);
        let limit = 2 * rig.timing.stall_ticks;
        rig.run_until_mode(SystemMode::Error, limit)
            .expect("stall detected");

        assert!(rig.errors().contains(ErrorFlags::MOTOR_FAULT));
        assert_eq!(rig.head().motor_state(), MotorState::Off);
        assert!(!rig.step().laser);
    });
}

#[test]
fn lost_lock_times_out_after_stable_time() {
    with_rig(fast_config(), fast_params(), |rig| {
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");

        rig.runner.driver_mut().set_photodiode_blocked(true);
        let period = rig.timing.target_period;
        let lost = rig
            .run_until_mode(SystemMode::Stabilizing, 4 * period)
            .expect("lock loss noticed");
        assert_eq!(rig.head().motor_state(), MotorState::AtSpeed);
        assert!(rig.errors().is_empty());

        let stable = rig.timing.stable_ticks;
        let failed = rig
            .run_until_mode(SystemMode::Error, stable + 5 * period)
            .expect("diode timeout");
        assert!(failed - lost > stable, "{} ticks", failed - lost);
        assert!(failed - lost <= stable + (LOCK_GRACE_PERIODS + 1) * period);
        assert!(rig.errors().contains(ErrorFlags::DIODE_TIMEOUT));
        assert_eq!(rig.step(), TickOutputs::OFF);
    });
}

#[test]
fn fifo_full_is_reported_without_leaving_mode() {
    with_rig(fast_config(), fast_params(), |rig| {
        let line = rig.full_line(0xA5);
        let mut reply = rig.send(Command::Status);
        while reply.free_lines > 0 {
            rig.push_line(&line);
            reply = rig.send(Command::Status);
        }
        assert!(reply.errors.is_empty());

        rig.push_line(&line);
        let reply = rig.send(Command::Status);
        assert!(reply.errors.contains(ErrorFlags::FIFO_FULL));
        assert_eq!(reply.mode, SystemMode::Idle);
        assert!(rig.host.stats().bytes_dropped > 0);
    });
}
