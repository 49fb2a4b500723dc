//! Bounded scanline buffer with single-producer / single-consumer halves.
//!
//! Payload bytes and record headers live in two lock-free `heapless::spsc`
//! rings. The producer half (command side) stages the open record locally
//! and commits it by enqueuing its bytes first and its length header last,
//! so the consumer half (real-time side) never observes a header whose bytes
//! are not yet visible. Both rings are fixed-size; no heap allocation.
//!
//! ## Capacity
//!
//! - Byte ring: `BUFFER_BYTES - 1` usable bytes.
//! - Header ring: `BUFFER_LINES - 1` records.
//! - A record holds at most `MAX_LINE_BYTES`.
//!
//! The first byte of a record reserves its header slot, and every staged byte
//! is checked against the free space of the byte ring. Since only the
//! consumer frees space, committing a staged record can never fail.

use heapless::spsc::{Consumer, Producer, Queue};
use heapless::Vec;
use scanhead_common::consts::{BUFFER_BYTES, BUFFER_LINES, MAX_LINE_BYTES};
use scanhead_common::scanhead::error::BufferError;
use static_assertions::const_assert;
use tracing::trace;

/// Byte length of a committed record.
type LineHeader = u16;

const_assert!(MAX_LINE_BYTES <= LineHeader::MAX as usize);
const_assert!(MAX_LINE_BYTES < BUFFER_BYTES - 1);

// ─── Record ─────────────────────────────────────────────────────────

/// One finalized scanline.
///
/// Bit `i` is bit `i % 8` of byte `i / 8` (LSB first).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanlineRecord {
    data: Vec<u8, MAX_LINE_BYTES>,
}

impl ScanlineRecord {
    /// Build a record from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BufferError> {
        let data = Vec::from_slice(bytes).map_err(|_| BufferError::LineTooLong {
            max: MAX_LINE_BYTES,
        })?;
        Ok(Self { data })
    }

    /// Number of bits held.
    #[inline]
    pub fn bit_len(&self) -> u64 {
        self.data.len() as u64 * 8
    }

    /// Bit at `index`, or `None` past the end.
    #[inline]
    pub fn bit(&self, index: u64) -> Option<bool> {
        let byte = self.data.get((index / 8) as usize)?;
        Some((byte >> (index % 8)) & 1 == 1)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ─── Storage ────────────────────────────────────────────────────────

/// Backing storage for both rings. Split once into its two halves.
pub struct ScanlineBuffer {
    bytes: Queue<u8, BUFFER_BYTES>,
    headers: Queue<LineHeader, BUFFER_LINES>,
}

impl ScanlineBuffer {
    pub const fn new() -> Self {
        Self {
            bytes: Queue::new(),
            headers: Queue::new(),
        }
    }

    /// Split into the producer (command side) and consumer (real-time side).
    pub fn split(&mut self) -> (LineProducer<'_>, LineConsumer<'_>) {
        let (bytes_tx, bytes_rx) = self.bytes.split();
        let (headers_tx, headers_rx) = self.headers.split();
        (
            LineProducer {
                bytes: bytes_tx,
                headers: headers_tx,
                open: None,
                committed: 0,
            },
            LineConsumer {
                bytes: bytes_rx,
                headers: headers_rx,
                consumed: 0,
            },
        )
    }
}

impl Default for ScanlineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Producer ───────────────────────────────────────────────────────

/// Producer half: opens, fills and finalizes records.
pub struct LineProducer<'a> {
    bytes: Producer<'a, u8, BUFFER_BYTES>,
    headers: Producer<'a, LineHeader, BUFFER_LINES>,
    /// Staged open record. `None` when no line is open.
    open: Option<Vec<u8, MAX_LINE_BYTES>>,
    /// Records enqueued since the split.
    committed: u64,
}

impl LineProducer<'_> {
    /// Finalize any open record and start a new one.
    pub fn open_line(&mut self) -> Result<(), BufferError> {
        self.commit()?;
        self.open = Some(Vec::new());
        Ok(())
    }

    /// Finalize the open record. Returns whether a record was enqueued.
    ///
    /// Empty records are dropped rather than enqueued.
    pub fn close_line(&mut self) -> Result<bool, BufferError> {
        self.commit()
    }

    /// Append one byte to the open record.
    ///
    /// # Errors
    /// - `NoOpenLine` if no record is open.
    /// - `LineTooLong` if the record already holds `MAX_LINE_BYTES`.
    /// - `Full` if the byte or header ring cannot take it (byte dropped).
    pub fn push_byte(&mut self, byte: u8) -> Result<(), BufferError> {
        let free_bytes = self.free_bytes();
        let free_headers = self.free_headers();
        let open = self.open.as_mut().ok_or(BufferError::NoOpenLine)?;

        if open.is_full() {
            return Err(BufferError::LineTooLong {
                max: MAX_LINE_BYTES,
            });
        }
        if open.len() >= free_bytes || (open.is_empty() && free_headers == 0) {
            return Err(BufferError::Full);
        }
        open.push(byte).map_err(|_| BufferError::LineTooLong {
            max: MAX_LINE_BYTES,
        })
    }

    /// Drop the open record without enqueuing it.
    pub fn discard_open(&mut self) {
        if let Some(open) = self.open.take() {
            trace!(bytes = open.len(), "open scanline discarded");
        }
    }

    /// Whether a record is open.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Bytes staged in the open record.
    #[inline]
    pub fn open_len(&self) -> usize {
        self.open.as_ref().map_or(0, |open| open.len())
    }

    /// Complete records not yet consumed.
    #[inline]
    pub fn pending_lines(&self) -> usize {
        self.headers.len()
    }

    /// Sequence number of the next record to be committed.
    #[inline]
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// How many more records of `line_len` bytes can still be accepted.
    pub fn free_lines(&self, line_len: usize) -> usize {
        let staged = self.open_len();
        let bytes = self.free_bytes().saturating_sub(staged);
        let mut headers = self.free_headers();
        if staged > 0 {
            headers = headers.saturating_sub(1);
        }
        (bytes / line_len.max(1)).min(headers)
    }

    fn free_bytes(&self) -> usize {
        self.bytes.capacity() - self.bytes.len()
    }

    fn free_headers(&self) -> usize {
        self.headers.capacity() - self.headers.len()
    }

    /// Bytes first, header last: the header publishes the record.
    fn commit(&mut self) -> Result<bool, BufferError> {
        let Some(open) = self.open.take() else {
            return Ok(false);
        };
        if open.is_empty() {
            return Ok(false);
        }
        for &byte in open.iter() {
            self.bytes.enqueue(byte).map_err(|_| BufferError::Full)?;
        }
        self.headers
            .enqueue(open.len() as LineHeader)
            .map_err(|_| BufferError::Full)?;
        self.committed += 1;
        trace!(bytes = open.len(), seq = self.committed, "scanline committed");
        Ok(true)
    }
}

// ─── Consumer ───────────────────────────────────────────────────────

/// Consumer half: removes complete records in FIFO order.
pub struct LineConsumer<'a> {
    bytes: Consumer<'a, u8, BUFFER_BYTES>,
    headers: Consumer<'a, LineHeader, BUFFER_LINES>,
    /// Records removed since the split. Matches [`LineProducer::committed`]
    /// numbering.
    consumed: u64,
}

impl LineConsumer<'_> {
    /// Remove and return the oldest complete record.
    pub fn pop_line(&mut self) -> Result<ScanlineRecord, BufferError> {
        let len = self.headers.dequeue().ok_or(BufferError::Empty)? as usize;
        self.consumed += 1;
        let mut data = Vec::new();
        for _ in 0..len {
            let byte = self.bytes.dequeue().ok_or(BufferError::Empty)?;
            data.push(byte).map_err(|_| BufferError::LineTooLong {
                max: MAX_LINE_BYTES,
            })?;
        }
        Ok(ScanlineRecord { data })
    }

    /// Drop every complete record. Returns the number dropped.
    pub fn drain(&mut self) -> usize {
        self.drain_until(u64::MAX)
    }

    /// Drop records committed before sequence number `mark`, leaving later
    /// ones queued. Returns the number dropped.
    pub fn drain_until(&mut self, mark: u64) -> usize {
        let mut dropped = 0;
        while self.consumed < mark {
            let Some(len) = self.headers.dequeue() else {
                break;
            };
            for _ in 0..len {
                let _ = self.bytes.dequeue();
            }
            self.consumed += 1;
            dropped += 1;
        }
        dropped
    }

    #[inline]
    pub fn pending_lines(&self) -> usize {
        self.headers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.headers.ready()
    }
}
