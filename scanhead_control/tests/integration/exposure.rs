//! Integration test: exposure through the full core.
//!
//! Underrun handling, scan direction, single-facet and single-line modes.

use scanhead_common::prelude::*;

use super::harness::{Rig, fast_config, fast_params, with_rig};

/// Laser levels of the first window that opens, one per tick.
fn first_window(rig: &mut Rig<'_>) -> Vec<bool> {
    rig.run_until(100_000, |rig, _| rig.head().in_window())
        .expect("window opened");
    let mut trace = vec![rig.runner.outputs().laser];
    loop {
        let out = rig.step();
        if !rig.head().in_window() {
            break;
        }
        trace.push(out.laser);
    }
    trace
}

#[test]
fn short_record_underruns_before_window_end() {
    with_rig(fast_config(), fast_params(), |rig| {
        rig.push_line(&[0xFF; 10]);
        rig.send(Command::Start);

        let trace = first_window(rig);
        // 80 bits, two ticks each, then the line is abandoned.
        assert_eq!(trace.len(), 160);
        assert!(trace.iter().all(|on| *on));
        assert!((trace.len() as u64) < rig.timing.nominal_window().length);

        assert!(rig.errors().contains(ErrorFlags::FIFO_UNDERRUN));
        assert_eq!(rig.head().exposure_stats().underruns, 1);
        // Underrun is not critical: scanning continues.
        rig.run(rig.timing.rotor_period);
        assert_eq!(rig.mode(), SystemMode::Scanning);
        assert_eq!(rig.sim().laser_ticks(), 160);
    });
}

#[test]
fn backward_exposure_mirrors_forward() {
    let bytes: Vec<u8> = (0..110u8).map(|b| b.wrapping_mul(37) ^ 0x5A).collect();
    let mut bits = Vec::new();

    for direction in [Direction::Forward, Direction::Backward] {
        let config = ScanheadConfig {
            direction,
            ..fast_config()
        };
        let sampled = with_rig(config, fast_params(), |rig| {
            let len = rig.timing.bytes_per_line;
            rig.push_line(&bytes[..len]);
            rig.send(Command::Start);
            first_window(rig)
                .into_iter()
                .step_by(OVERSAMPLING as usize)
                .take(rig.timing.bits_per_line as usize)
                .collect::<Vec<bool>>()
        });
        bits.push(sampled);
    }

    let forward = &bits[0];
    let mut backward = bits[1].clone();
    assert_eq!(forward.len(), 875);
    assert_ne!(*forward, backward);
    backward.reverse();
    assert_eq!(*forward, backward);
}

#[test]
fn single_facet_fires_only_in_designated_facet() {
    let config = ScanheadConfig {
        single_facet: Some(2),
        ..fast_config()
    };
    with_rig(config, fast_params(), |rig| {
        for _ in 0..20 {
            let line = rig.full_line(0xFF);
            rig.push_line(&line);
        }
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");

        let revolutions = 10;
        let mut stray = 0u64;
        let ticks = revolutions * rig.timing.rotor_period;
        rig.run_until(ticks, |rig, out| {
            if out.laser && rig.head().sync().facet_index() != 2 {
                stray += 1;
            }
            false
        });
        assert_eq!(stray, 0);

        let exposed = rig.head().exposure_stats().lines_exposed;
        assert!((10..=11).contains(&exposed), "exposed {exposed}");

        let lit: Vec<&u64> = rig
            .sim()
            .laser_ticks_by_facet()
            .iter()
            .filter(|n| **n > 0)
            .collect();
        assert_eq!(lit.len(), 1, "one physical facet carries all exposure");
        assert!(rig.errors().is_empty());
    });
}

#[test]
fn single_line_repeats_first_record() {
    let config = ScanheadConfig {
        single_line: true,
        ..fast_config()
    };
    with_rig(config, fast_params(), |rig| {
        let line = rig.full_line(0xFF);
        rig.push_line(&line);
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");

        let period = rig.timing.rotor_period;
        rig.run(3 * period);
        let stats = rig.head().exposure_stats();
        assert!(stats.lines_exposed >= 11);
        assert_eq!(stats.windows_skipped, 0);
        assert!(rig.errors().is_empty());
    });
}
