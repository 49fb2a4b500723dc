//! # Scanhead Control
//!
//! Runs a complete print job against the simulated scanhead.
//!
//! The real-time thread drives the tick loop through a [`CycleRunner`]. The
//! host thread streams scanlines as wire-protocol frames (`LINE SCAN`,
//! `WRITE_L` payload, `LINE STOP`), respecting the buffer's free-line count,
//! issues `START` once the buffer is primed and `STOP` when the job has
//! drained. A JSON run summary is printed on exit.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use scanhead_common::prelude::*;
use scanhead_common::consts::DEFAULT_CONFIG_PATH;
use scanhead_control::buffer::ScanlineBuffer;
use scanhead_control::command::SharedStatus;
use scanhead_control::command::processor::{CommandProcessor, CommandStats};
use scanhead_control::cycle::{CycleRunner, CycleStats, Scanhead, rt_setup};
use scanhead_control::exposure::ExposureStats;
use scanhead_control::sim::{SimulatedScanhead, SimulationParams};
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Scanhead Control: polygon scanhead timing and streaming core
#[derive(Parser, Debug)]
#[command(name = "scanhead_control")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Deterministic polygon scanhead core running a simulated print job")]
struct Args {
    /// Path to the scanhead configuration TOML.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Number of scanlines to stream.
    #[arg(long, default_value_t = 64)]
    lines: u32,

    /// Scanline bit pattern.
    #[arg(long, value_enum, default_value_t = Pattern::Checker)]
    pattern: Pattern,

    /// Stop after this many ticks (default: enough for the job plus spin-up).
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Ticks executed per timed batch.
    #[arg(long, default_value_t = 1000)]
    batch_ticks: u64,

    /// CPU core to pin the RT thread to (default: 1).
    #[arg(long, default_value_t = 1)]
    cpu_core: usize,

    /// SCHED_FIFO priority (default: 80).
    #[arg(long, default_value_t = 80)]
    rt_priority: i32,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pattern {
    /// Alternating 0xAA / 0x55 lines.
    Checker,
    /// Every bit set.
    Solid,
    /// Byte values rising across the line.
    Ramp,
}

impl Pattern {
    fn line(self, index: u32, len: usize) -> Vec<u8> {
        match self {
            Pattern::Checker => {
                let byte = if index % 2 == 0 { 0xAA } else { 0x55 };
                vec![byte; len]
            }
            Pattern::Solid => vec![0xFF; len],
            Pattern::Ramp => (0..len)
                .map(|i| (i * 255 / len.saturating_sub(1).max(1)) as u8)
                .collect(),
        }
    }
}

/// Printed as JSON when the job ends.
#[derive(Debug, Serialize)]
struct RunSummary {
    ticks: u64,
    simulated_secs: f64,
    mode: String,
    errors: String,
    lock: String,
    measured_period: u64,
    facet_offsets: Vec<u64>,
    rotor_rpm: f64,
    /// `(edges, locks, losses)` seen by the synchronizer.
    sync_counters: (u64, u32, u32),
    laser_ticks_by_facet: Vec<u64>,
    lines_streamed: u32,
    exposure: ExposureStats,
    commands: CommandStats,
    cycle: CycleStats,
    avg_batch_ns: i64,
}

fn main() {
    let args = Args::parse();
    let loaded = load_config(&args.config);
    let log_level = loaded
        .as_ref()
        .map_or(LogLevel::Info, |loaded| loaded.file.shared.log_level);
    setup_tracing(&args, log_level);

    info!("Scanhead Control v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = loaded
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        .and_then(|loaded| run(&args, loaded));
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Scanhead Control shutdown complete");
}

/// Configuration file contents and whether the file existed.
struct LoadedConfig {
    file: ScanheadFileConfig,
    found: bool,
}

fn run(args: &Args, loaded: LoadedConfig) -> Result<(), Box<dyn std::error::Error>> {
    if loaded.found {
        info!("Loaded config from {}", args.config.display());
    } else {
        warn!("Config '{}' not found, using defaults", args.config.display());
    }
    let file = loaded.file;
    file.shared.validate()?;

    let store = ConfigStore::new();
    let timing = *store.freeze(&file.scanhead)?;
    info!(
        service = %file.shared.service_name,
        facet_period = timing.target_period,
        bits_per_line = timing.bits_per_line,
        bytes_per_line = timing.bytes_per_line,
        "Config OK"
    );

    let max_ticks = args
        .max_ticks
        .unwrap_or_else(|| default_max_ticks(&timing, args.lines));

    // Setup signal handler for graceful shutdown.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(true, Ordering::SeqCst);
    })?;

    let status = SharedStatus::new();
    let mut buffer = ScanlineBuffer::new();
    let (producer, consumer) = buffer.split();
    let mut processor = CommandProcessor::new(&timing, &status, producer);
    let scanhead = Scanhead::new(&timing, &status, consumer);
    let sim = SimulatedScanhead::new(&timing, SimulationParams::default());
    let mut runner = CycleRunner::new(scanhead, sim, &timing, args.batch_ticks);

    let running = AtomicBool::new(true);
    let (cpu_core, rt_priority) = (args.cpu_core, args.rt_priority);

    let (runner, commands) = thread::scope(|s| {
        let running = &running;
        let rt = s.spawn(move || {
            let result = rt_setup(cpu_core, rt_priority).and_then(|()| {
                info!(cpu_core, rt_priority, max_ticks, "entering tick loop");
                runner.run(running, max_ticks)
            });
            running.store(false, Ordering::SeqCst);
            result.map(|_| runner)
        });

        let host = s.spawn(|| {
            stream_job(&mut processor, &timing, args, running, &interrupted);
            running.store(false, Ordering::SeqCst);
            processor.stats()
        });

        let commands = host.join().map_err(|_| "host thread panicked")?;
        let runner = rt.join().map_err(|_| "real-time thread panicked")??;
        Ok::<_, Box<dyn std::error::Error>>((runner, commands))
    })?;

    let head = runner.scanhead();
    let rotor = head.rotor_state();
    let summary = RunSummary {
        ticks: head.now(),
        simulated_secs: timing.ticks_to_secs(head.now()),
        mode: format!("{:?}", head.mode()),
        errors: format!("{:?}", status.errors().snapshot()),
        lock: format!("{:?}", rotor.lock_status),
        measured_period: rotor.measured_period,
        facet_offsets: head.sync().facet_table().entries().map(|(_, o)| o).collect(),
        rotor_rpm: runner.driver().speed_rpm(timing.pixel_clock_hz),
        sync_counters: head.sync().counters(),
        laser_ticks_by_facet: runner.driver().laser_ticks_by_facet().to_vec(),
        lines_streamed: args.lines,
        exposure: head.exposure_stats(),
        commands,
        cycle: runner.stats().clone(),
        avg_batch_ns: runner.stats().avg_batch_ns(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Load the configuration file, falling back to defaults when it is absent.
fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    match ScanheadFileConfig::load(path) {
        Ok(file) => Ok(LoadedConfig { file, found: true }),
        Err(ConfigError::FileNotFound) => Ok(LoadedConfig {
            file: ScanheadFileConfig::default(),
            found: false,
        }),
        Err(e) => Err(e),
    }
}

/// Spin-up, lock and twice the revolutions the job needs.
fn default_max_ticks(timing: &ScanTiming, lines: u32) -> u64 {
    let per_rev = if timing.single_facet.is_some() {
        1
    } else {
        timing.facets as u64
    };
    let revolutions = (lines as u64).div_ceil(per_rev) * 2 + 8;
    timing.spinup_ticks + 2 * timing.stable_ticks + revolutions * timing.rotor_period
}

/// Send one command frame byte by byte.
fn send(processor: &mut CommandProcessor<'_>, command: Command) -> StatusReply {
    let mut reply = None;
    for byte in command.encode() {
        reply = processor.feed(byte).or(reply);
    }
    reply.unwrap_or_else(|| processor.status())
}

/// Host side of the job: stream every line, start, wait for drain, stop.
fn stream_job(
    processor: &mut CommandProcessor<'_>,
    timing: &ScanTiming,
    args: &Args,
    running: &AtomicBool,
    interrupted: &AtomicBool,
) {
    let active = || running.load(Ordering::SeqCst) && !interrupted.load(Ordering::SeqCst);
    let idle_free = send(processor, Command::Status).free_lines;
    let mut started = false;

    for index in 0..args.lines {
        let line = args.pattern.line(index, timing.bytes_per_line);
        loop {
            if !active() {
                break;
            }
            let reply = send(processor, Command::Status);
            if reply.mode == SystemMode::Error {
                warn!(errors = ?reply.errors, "scanhead in ERROR, aborting stream");
                send(processor, Command::Stop);
                return;
            }
            if reply.free_lines > 0 {
                break;
            }
            if !started {
                started = start(processor);
            }
            thread::sleep(Duration::from_micros(50));
        }
        if !active() {
            break;
        }

        send(processor, Command::Line(LineMarker::Scan));
        for &byte in &line {
            send(processor, Command::WriteLine(byte));
        }
        send(processor, Command::Line(LineMarker::Stop));
        debug!(index, "line queued");
    }

    if !started && active() {
        start(processor);
    }

    // Wait for the buffer to drain, then let the last window finish.
    while active() {
        let reply = send(processor, Command::Status);
        if reply.mode == SystemMode::Error || reply.free_lines >= idle_free {
            break;
        }
        thread::sleep(Duration::from_micros(200));
    }
    if active() {
        thread::sleep(Duration::from_millis(5));
    }

    let reply = send(processor, Command::Stop);
    info!(mode = ?reply.mode, errors = ?reply.errors, "job finished");
}

fn start(processor: &mut CommandProcessor<'_>) -> bool {
    let reply = send(processor, Command::Start);
    info!(mode = ?reply.mode, "START issued");
    true
}

/// Setup tracing subscriber from CLI arguments and the configured level.
fn setup_tracing(args: &Args, log_level: LogLevel) {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        log_level
            .as_directive()
            .parse()
            .unwrap_or(LevelFilter::INFO)
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}
