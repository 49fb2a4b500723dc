//! Integration test: STOP cancellation.
//!
//! STOP forces the laser low on the next tick from every mode, disables the
//! motor, drops the lines queued before it and clears the fault word.

use scanhead_common::prelude::*;

use super::harness::{Rig, fast_config, fast_params, with_rig};

/// Issue STOP and check the very next tick.
fn stop_and_check(rig: &mut Rig<'_>) {
    let reply = rig.send(Command::Stop);
    assert_eq!(reply.mode, SystemMode::Stopped);
    assert!(reply.errors.is_empty());

    let out = rig.step();
    assert!(!out.laser, "laser high on the tick after STOP");
    assert!(!out.motor_enable);
    assert_eq!(rig.head().mode(), SystemMode::Stopped);
}

#[test]
fn stop_inside_exposure_window_drops_laser_next_tick() {
    with_rig(fast_config(), fast_params(), |rig| {
        for _ in 0..10 {
            let line = rig.full_line(0xFF);
            rig.push_line(&line);
        }
        rig.send(Command::Start);
        rig.run_until(100_000, |rig, out| out.laser && rig.head().in_window())
            .expect("laser firing inside a window");

        stop_and_check(rig);
        assert!(!rig.head().in_window());

        // Queued lines were flushed; nothing fires afterwards.
        let idle = rig.send(Command::Status).free_lines;
        assert!(rig.run(rig.timing.rotor_period).iter().all(|out| !out.laser));
        assert_eq!(rig.send(Command::Status).free_lines, idle);
        assert!(rig.head().exposure_stats().lines_exposed < 10);
    });
}

#[test]
fn stop_from_every_laser_mode() {
    for command in [Command::LaserTest, Command::LineTest, Command::PhotodiodeTest] {
        with_rig(fast_config(), fast_params(), |rig| {
            let reply = rig.send(command);
            assert_eq!(Some(reply.mode), command.test_mode());

            // Rotor is at rest, so the photodiode test has not triggered yet.
            let out = rig.run(10);
            assert!(out.iter().all(|out| out.laser), "{command:?}");

            stop_and_check(rig);
        });
    }
}

#[test]
fn stop_from_motor_modes() {
    for command in [Command::Start, Command::MotorTest] {
        with_rig(fast_config(), fast_params(), |rig| {
            rig.send(command);
            let out = rig.run(5_000);
            assert!(out.iter().any(|out| out.motor_enable));
            assert!(out.iter().all(|out| !out.laser));

            stop_and_check(rig);
            assert_eq!(rig.head().motor_state(), MotorState::Off);
        });
    }
}

#[test]
fn stop_and_start_between_ticks_restarts_cleanly() {
    with_rig(fast_config(), fast_params(), |rig| {
        let line = rig.full_line(0xFF);
        rig.push_line(&line);
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");

        // Both commands land before the next tick.
        rig.send(Command::Stop);
        assert_eq!(rig.send(Command::Start).mode, SystemMode::Spinup);

        let out = rig.step();
        assert!(!out.laser);
        assert_eq!(rig.head().mode(), SystemMode::Spinup);
        assert_eq!(rig.head().motor_state(), MotorState::Ramping);
        assert_eq!(rig.head().lock_status(), LockStatus::Unlocked);

        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning again");
    });
}

#[test]
fn lines_committed_after_stop_survive_it() {
    with_rig(fast_config(), fast_params(), |rig| {
        let empty = rig.send(Command::Status).free_lines;
        let stale = rig.full_line(0x00);
        let fresh = rig.full_line(0xFF);
        rig.push_line(&stale);
        rig.push_line(&stale);

        rig.send(Command::Stop);
        rig.push_line(&fresh);
        rig.step();
        assert_eq!(rig.send(Command::Status).free_lines, empty - 1);

        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");
        let out = rig.run(2 * rig.timing.rotor_period);
        assert!(out.iter().any(|out| out.laser));
        assert_eq!(rig.head().exposure_stats().lines_exposed, 1);
        assert_eq!(rig.send(Command::Status).free_lines, empty);
    });
}

#[test]
fn photodiode_test_latches_laser_off_on_first_pulse() {
    with_rig(fast_config(), fast_params(), |rig| {
        rig.send(Command::PhotodiodeTest);
        assert!(rig.step().laser);

        let hit = rig
            .run_until(50_000, |_, out| !out.laser)
            .expect("photodiode triggered");
        assert!(rig.sim().photodiode_pulses() >= 1);

        assert!(rig.run(20_000).iter().all(|out| !out.laser));
        assert!(hit > 1);
        assert_eq!(rig.mode(), SystemMode::PhotodiodeTest);
        assert!(rig.head().motor_state() != MotorState::Off);
    });
}
