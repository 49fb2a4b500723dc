//! Integration test: host streaming.
//!
//! Wire-level framing, FIFO exposure order, and a full job with the host and
//! the tick loop on separate threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use scanhead_common::prelude::*;

use super::harness::{fast_config, fast_params, with_rig};

#[test]
fn byte_stream_is_framed_and_answered() {
    with_rig(fast_config(), fast_params(), |rig| {
        let stream = [
            0x01, 0x00, // STATUS
            0x7F, 0x00, // unknown opcode
            0x0A, 0x02, // LINE, bad marker
            0x0A, 0x01, // LINE SCAN
            0x05, 0x11, // WRITE_L
            0x05, 0x22, // WRITE_L
            0x05, 0x33, // WRITE_L
            0x0A, 0x00, // LINE STOP
        ];
        let replies: Vec<StatusReply> = stream.iter().filter_map(|&b| rig.host.feed(b)).collect();

        assert_eq!(replies.len(), 8);
        assert!(replies.iter().all(|r| r.mode == SystemMode::Idle));
        let encoded = replies[0].encode();
        assert_eq!(StatusReply::decode(&encoded).unwrap(), replies[0]);

        let stats = rig.host.stats();
        assert_eq!(stats.frames, 8);
        assert_eq!(stats.protocol_errors, 2);
        assert_eq!(stats.bytes_written, 3);
        assert_eq!(stats.lines_committed, 1);
    });
}

#[test]
fn lines_are_exposed_in_enqueue_order() {
    with_rig(fast_config(), fast_params(), |rig| {
        for i in 0..6u8 {
            let mut line = rig.full_line(0x00);
            line[0] = i * 17 + 3;
            rig.push_line(&line);
        }
        rig.send(Command::Start);
        rig.run_until_mode(SystemMode::Scanning, 80_000)
            .expect("scanning");

        // First byte of each exposed line, read back from the laser gate.
        let mut decoded = Vec::new();
        let mut current: Option<(u64, u8)> = None;
        let ticks = 3 * rig.timing.rotor_period;
        rig.run_until(ticks, |rig, out| {
            let now = rig.now() - 1;
            let in_window = rig.head().in_window();
            match current {
                Some((start, ref mut value)) if in_window => {
                    let k = now - start;
                    if k % OVERSAMPLING == 0 && k / OVERSAMPLING < 8 {
                        *value |= (out.laser as u8) << (k / OVERSAMPLING);
                    }
                }
                Some((_, value)) => {
                    decoded.push(value);
                    current = None;
                }
                None if in_window => current = Some((now, out.laser as u8)),
                None => {}
            }
            false
        });

        let expected: Vec<u8> = (0..6u8).map(|i| i * 17 + 3).collect();
        assert_eq!(decoded, expected);
    });
}

#[test]
fn threaded_job_streams_every_line() {
    const LINES: usize = 48;

    with_rig(fast_config(), fast_params(), |rig| {
        let line = rig.full_line(0xC3);
        let running = AtomicBool::new(true);
        let host = &mut rig.host;
        let runner = &mut rig.runner;

        thread::scope(|s| {
            let running = &running;
            let rt = s.spawn(move || {
                let result = runner.run(running, 20_000_000);
                running.store(false, Ordering::SeqCst);
                result
            });

            s.spawn(move || {
                let idle = host.handle(Command::Status).free_lines;
                let mut started = false;

                for _ in 0..LINES {
                    while host.handle(Command::Status).free_lines == 0 {
                        if !started {
                            host.handle(Command::Start);
                            started = true;
                        }
                        if !running.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::yield_now();
                    }
                    host.handle(Command::Line(LineMarker::Scan));
                    for &byte in &line {
                        host.handle(Command::WriteLine(byte));
                    }
                    host.handle(Command::Line(LineMarker::Stop));
                }
                if !started {
                    host.handle(Command::Start);
                }
                while running.load(Ordering::SeqCst)
                    && host.handle(Command::Status).free_lines < idle
                {
                    thread::yield_now();
                }
                host.handle(Command::Stop);
                running.store(false, Ordering::SeqCst);
            });

            rt.join().unwrap().unwrap();
        });

        assert_eq!(rig.host.stats().lines_committed, LINES as u64);
        assert_eq!(rig.host.stats().bytes_dropped, 0);
        let stats = rig.head().exposure_stats();
        assert_eq!(stats.lines_exposed, LINES as u64);
        assert_eq!(stats.underruns, 0);
        assert!(rig.errors().is_empty());
        assert_eq!(rig.mode(), SystemMode::Stopped);
        assert!(rig.runner.stats().batch_count > 0);
    });
}
