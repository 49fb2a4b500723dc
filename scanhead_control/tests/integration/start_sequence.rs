//! Integration test: START sequence and photodiode lock.
//!
//! 1. START → SPINUP, motor ramps for SPINUP_TIME
//! 2. AtSpeed → STABILIZING, synchronizer seeks lock
//! 3. In-tolerance pulses for STABLE_TIME → LOCKED → SCANNING
//! 4. No pulses → DIODE_TIMEOUT → ERROR

use scanhead_common::prelude::*;
use scanhead_control::sim::SimulationParams;

use super::harness::{fast_config, fast_params, with_rig};

#[test]
fn start_reaches_scanning_and_exposes_queued_lines() {
    with_rig(fast_config(), fast_params(), |rig| {
        for _ in 0..8 {
            let line = rig.full_line(0xFF);
            rig.push_line(&line);
        }
        let queued = rig.send(Command::Status).free_lines;
        assert_eq!(rig.send(Command::Start).mode, SystemMode::Spinup);

        let at_speed = rig
            .run_until_mode(SystemMode::Stabilizing, 20_000)
            .expect("motor at speed");
        assert!(at_speed >= rig.timing.spinup_ticks);

        let scanning = rig
            .run_until_mode(SystemMode::Scanning, 60_000)
            .expect("photodiode lock");
        assert!(scanning - at_speed >= rig.timing.stable_ticks);
        assert_eq!(rig.head().lock_status(), LockStatus::Locked);
        assert_eq!(rig.head().motor_state(), MotorState::AtSpeed);

        let period = rig.timing.rotor_period;
        rig.run(3 * period);
        let stats = rig.head().exposure_stats();
        assert_eq!(stats.lines_exposed, 8);
        assert_eq!(stats.underruns, 0);
        assert!(rig.errors().is_empty());
        assert_eq!(rig.mode(), SystemMode::Scanning);
        assert!(rig.send(Command::Status).free_lines > queued);
    });
}

#[test]
fn laser_stays_off_until_scanning() {
    with_rig(fast_config(), fast_params(), |rig| {
        let line = rig.full_line(0xFF);
        rig.push_line(&line);
        rig.send(Command::Start);

        let mut laser_before_scan = false;
        rig.run_until(80_000, |rig, out| {
            laser_before_scan |= out.laser && rig.head().mode() != SystemMode::Scanning;
            rig.head().mode() == SystemMode::Scanning
        })
        .expect("scanning");
        assert!(!laser_before_scan);
    });
}

#[test]
fn no_photodiode_pulses_time_out_into_error() {
    let params = SimulationParams {
        blocked_photodiode: true,
        ..fast_params()
    };
    with_rig(fast_config(), params, |rig| {
        rig.send(Command::Start);
        let stabilizing = rig
            .run_until_mode(SystemMode::Stabilizing, 20_000)
            .expect("motor at speed");

        let mut laser = false;
        let error_at = rig
            .run_until(100_000, |rig, out| {
                laser |= out.laser;
                rig.head().mode() == SystemMode::Error
            })
            .expect("diode timeout");

        assert!(error_at - stabilizing > rig.timing.stable_ticks);
        assert!(!laser);
        assert!(rig.errors().contains(ErrorFlags::DIODE_TIMEOUT));
        assert_eq!(rig.step(), TickOutputs::OFF);

        // ERROR is only left through STOP.
        assert_eq!(rig.send(Command::Start).mode, SystemMode::Error);
    });
}

#[test]
fn lock_tolerates_facet_errors_and_jitter() {
    let mut params = fast_params();
    params.facet_error_ppm[..4].copy_from_slice(&[0, 3_000, -2_000, 1_000]);
    params.jitter_ticks = 2;

    with_rig(fast_config(), params, |rig| {
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("photodiode lock");

        let period = rig.timing.rotor_period;
        rig.run(5 * period);
        assert_eq!(rig.mode(), SystemMode::Scanning);
        let (_, locks, losses) = rig.head().sync().counters();
        assert_eq!((locks, losses), (1, 0));

        let measured = rig.head().rotor_state().measured_period;
        let deviation = rig
            .head()
            .sync()
            .facet_table()
            .entries()
            .map(|(facet, offset)| offset.abs_diff(facet as u64 * measured))
            .max()
            .unwrap();
        assert!(deviation >= 8, "facet offsets should follow facet errors");
        assert!(rig.errors().is_empty());
    });
}
