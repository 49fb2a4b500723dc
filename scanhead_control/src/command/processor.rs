//! Host command processor (serial context).
//!
//! Decodes command frames, applies mode changes and line payload, and
//! answers every frame with a [`StatusReply`].
//!
//! ## Command Table
//!
//! | Command          | Accepted from   | Effect                                 |
//! |------------------|-----------------|----------------------------------------|
//! | START            | Idle, Stopped   | → Spinup                               |
//! | MOTORTEST ...    | Idle, Stopped   | → dedicated test mode                  |
//! | STOP             | any             | → Stopped, clear faults, drop open line|
//! | LINE SCAN / STOP | any             | open / close a scanline record         |
//! | WRITE_L b        | any but Error   | append `b`; auto-close at line length  |
//! | STATUS, READ_D   | any             | none                                   |

use scanhead_common::scanhead::config::ScanTiming;
use scanhead_common::scanhead::error::{BufferError, ErrorFlags};
use scanhead_common::scanhead::protocol::{
    Command, FrameDecoder, LineMarker, StatusReply, FRAME_LEN,
};
use scanhead_common::scanhead::state::SystemMode;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::SharedStatus;
use crate::buffer::LineProducer;

/// Result of applying one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Mode changed.
    Transition { from: SystemMode, to: SystemMode },
    /// Accepted without a mode change.
    Accepted,
    /// Rejected, with the reason.
    Rejected(&'static str),
}

/// Command-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub frames: u64,
    pub rejected: u64,
    pub protocol_errors: u64,
    pub bytes_written: u64,
    pub bytes_dropped: u64,
    pub lines_committed: u64,
}

/// Owner of the buffer producer half and writer of host-driven modes.
pub struct CommandProcessor<'a> {
    status: &'a SharedStatus,
    producer: LineProducer<'a>,
    bytes_per_line: usize,
    decoder: FrameDecoder,
    stats: CommandStats,
}

impl<'a> CommandProcessor<'a> {
    pub fn new(timing: &ScanTiming, status: &'a SharedStatus, producer: LineProducer<'a>) -> Self {
        Self {
            status,
            producer,
            bytes_per_line: timing.bytes_per_line,
            decoder: FrameDecoder::new(),
            stats: CommandStats::default(),
        }
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    /// Current status reply.
    pub fn status(&self) -> StatusReply {
        StatusReply {
            mode: self.status.mode(),
            errors: self.status.errors().snapshot(),
            free_lines: self
                .producer
                .free_lines(self.bytes_per_line)
                .min(u8::MAX as usize) as u8,
        }
    }

    /// Feed one byte of the host stream. Returns a reply per completed frame.
    pub fn feed(&mut self, byte: u8) -> Option<StatusReply> {
        let frame = self.decoder.push(byte)?;
        Some(self.handle_frame(frame))
    }

    /// Decode and apply one frame. Malformed frames are logged and answered.
    pub fn handle_frame(&mut self, frame: [u8; FRAME_LEN]) -> StatusReply {
        match Command::decode(frame) {
            Ok(command) => self.handle(command),
            Err(e) => {
                self.stats.frames += 1;
                self.stats.protocol_errors += 1;
                warn!(error = %e, ?frame, "malformed command frame");
                self.status()
            }
        }
    }

    /// Apply a command and build its reply.
    pub fn handle(&mut self, command: Command) -> StatusReply {
        self.stats.frames += 1;
        if let CommandOutcome::Rejected(reason) = self.apply(command) {
            self.stats.rejected += 1;
            warn!(?command, mode = ?self.status.mode(), reason, "command rejected");
        }
        self.status()
    }

    /// Apply a command without building a reply.
    pub fn apply(&mut self, command: Command) -> CommandOutcome {
        match command {
            Command::Status | Command::ReadDiagnostic => CommandOutcome::Accepted,
            Command::Start => self.enter(SystemMode::Spinup),
            Command::MotorTest
            | Command::LaserTest
            | Command::LineTest
            | Command::PhotodiodeTest => match command.test_mode() {
                Some(mode) => self.enter(mode),
                None => CommandOutcome::Rejected("not a test command"),
            },
            Command::Stop => self.stop(),
            Command::WriteLine(byte) => self.write(byte),
            Command::Line(LineMarker::Scan) => self.open_line(),
            Command::Line(LineMarker::Stop) => self.close_line(),
        }
    }

    fn enter(&mut self, to: SystemMode) -> CommandOutcome {
        let from = self.status.mode();
        if !from.accepts_start() {
            return CommandOutcome::Rejected("only accepted from IDLE or STOPPED");
        }
        if !self.status.transition(from, to) {
            return CommandOutcome::Rejected("mode changed concurrently");
        }
        info!(?from, ?to, "mode entered on host command");
        CommandOutcome::Transition { from, to }
    }

    /// Lines committed after STOP but before the next tick stay queued;
    /// the tick drains only those committed up to here.
    fn stop(&mut self) -> CommandOutcome {
        let from = self.status.stop(self.producer.committed());
        let cleared = self.status.errors().clear();
        self.producer.discard_open();
        info!(?from, ?cleared, "STOP");
        CommandOutcome::Transition {
            from,
            to: SystemMode::Stopped,
        }
    }

    fn write(&mut self, byte: u8) -> CommandOutcome {
        if self.status.mode() == SystemMode::Error {
            return CommandOutcome::Rejected("payload rejected in ERROR");
        }
        match self.producer.push_byte(byte) {
            Ok(()) => {
                self.stats.bytes_written += 1;
                if self.producer.open_len() >= self.bytes_per_line {
                    trace!("line length reached, closing");
                    return self.close_line();
                }
                CommandOutcome::Accepted
            }
            Err(BufferError::Full) => {
                self.stats.bytes_dropped += 1;
                self.status.errors().raise(ErrorFlags::FIFO_FULL);
                CommandOutcome::Rejected("scanline buffer full")
            }
            Err(BufferError::NoOpenLine) => {
                self.stats.bytes_dropped += 1;
                CommandOutcome::Rejected("no scanline open")
            }
            Err(BufferError::LineTooLong { .. } | BufferError::Empty) => {
                self.stats.bytes_dropped += 1;
                CommandOutcome::Rejected("scanline too long")
            }
        }
    }

    fn open_line(&mut self) -> CommandOutcome {
        match self.producer.open_line() {
            Ok(()) => CommandOutcome::Accepted,
            Err(e) => self.commit_failed(e),
        }
    }

    fn close_line(&mut self) -> CommandOutcome {
        match self.producer.close_line() {
            Ok(true) => {
                self.stats.lines_committed += 1;
                debug!(pending = self.producer.pending_lines(), "scanline queued");
                CommandOutcome::Accepted
            }
            Ok(false) => CommandOutcome::Accepted,
            Err(e) => self.commit_failed(e),
        }
    }

    fn commit_failed(&mut self, e: BufferError) -> CommandOutcome {
        warn!(error = %e, "scanline commit failed");
        self.status.errors().raise(ErrorFlags::FIFO_FULL);
        CommandOutcome::Rejected("scanline commit failed")
    }
}
