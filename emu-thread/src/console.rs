//! Bounded byte channel carrying console text from the computation thread to
//! the controller.
//!
//! # Design
//!
//! A fixed-capacity byte ring guarded by two counting permits:
//!
//! - `writable` starts at the capacity and counts bytes the producer may fill
//! - `readable` starts at zero and counts bytes the consumer may take
//!
//! The producer owns its write cursor and the consumer owns its read cursor;
//! neither is shared. With no transfer in flight
//! `writable + readable == capacity`.
//!
//! When the ring is full the producer blocks on `writable` instead of
//! dropping text. That stall is the backpressure that slows emulation down to
//! the speed at which the controller drains output.
//!
//! Message boundaries are not stored in the ring. Each committed chunk is
//! announced with one [`EmuEvent::ConsoleDataReady`] carrying the stream.
//!
//! # Write path
//!
//! 1. Format straight into the contiguous free space at the cursor
//!    (`min(writable, capacity - cursor)`), counting the full length even
//!    past the end of the window.
//! 2. If it fit, take exactly that many permits, advance, announce once.
//! 3. Otherwise format again into a spill buffer and copy it into the ring
//!    chunk by chunk, each chunk ending at the wrap point or the end of the
//!    message. Each chunk takes its permits, advances the cursor, releases
//!    `readable` and is announced, so the consumer starts draining before
//!    the whole message has landed.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;
use crate::event::{EmuEvent, EventSender};
use crate::sync::{Permits, StopSignal};
use crate::trace::{trace, warn};

/// Which console a piece of text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsoleStream {
    Normal,
    Error,
}

/// Default ring size in bytes.
pub const DEFAULT_CONSOLE_CAPACITY: usize = 4096;

/// The spill buffer is released after a write if it grew past this many
/// ring capacities.
const SPILL_RETAIN_FACTOR: usize = 4;

struct Ring {
    bytes: Box<[UnsafeCell<u8>]>,
    writable: Permits,
    readable: Permits,
}

// SAFETY: a byte range is written only by the producer while it holds the
// matching `writable` permits (or before it has released them to the
// consumer), and read only by the consumer after acquiring the matching
// `readable` permits. Permit release/acquire is Release/Acquire, which
// orders the byte accesses.
unsafe impl Sync for Ring {}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            bytes: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            writable: Permits::new(capacity),
            readable: Permits::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.bytes.as_ptr())
    }

    /// # Safety
    ///
    /// `at + src.len() <= capacity` and the caller must own that range.
    unsafe fn store(&self, at: usize, src: &[u8]) {
        debug_assert!(at + src.len() <= self.capacity());
        // SAFETY: in bounds per the contract; the range is owned by the caller.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(at), src.len()) };
    }

    /// # Safety
    ///
    /// `at + dst.len() <= capacity` and the caller must own that range.
    unsafe fn load(&self, at: usize, dst: &mut [u8]) {
        debug_assert!(at + dst.len() <= self.capacity());
        // SAFETY: in bounds per the contract; the range is owned by the caller.
        unsafe { std::ptr::copy_nonoverlapping(self.base().add(at), dst.as_mut_ptr(), dst.len()) };
    }
}

/// Creates a connected writer/reader pair over a ring of `capacity` bytes.
///
/// The writer announces every committed chunk on `events` and gives up a
/// blocked write when `stop` requests an exit.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel(
    capacity: usize,
    events: EventSender,
    stop: Arc<StopSignal>,
) -> (ConsoleWriter, ConsoleReader) {
    assert!(capacity > 0, "console capacity must be > 0");
    let ring = Arc::new(Ring::new(capacity));
    let writer = ConsoleWriter {
        ring: Arc::clone(&ring),
        cursor: 0,
        spill: Vec::new(),
        events,
        stop,
    };
    let reader = ConsoleReader { ring, cursor: 0 };
    (writer, reader)
}

/// Producer half. Lives on the computation thread.
pub struct ConsoleWriter {
    ring: Arc<Ring>,
    cursor: usize,
    spill: Vec<u8>,
    events: EventSender,
    stop: Arc<StopSignal>,
}

impl ConsoleWriter {
    /// Formats `args` and enqueues the bytes for `stream`.
    ///
    /// Returns the number of bytes enqueued. An empty message enqueues
    /// nothing and sends no notification.
    ///
    /// # Errors
    ///
    /// - [`ConsoleError::Format`] if a `Display` impl failed; nothing is
    ///   enqueued.
    /// - [`ConsoleError::OutOfMemory`] if an oversized message could not be
    ///   spilled; nothing is enqueued.
    /// - [`ConsoleError::Interrupted`] if the ring stayed full until a stop
    ///   request arrived.
    pub fn write(
        &mut self,
        stream: ConsoleStream,
        args: fmt::Arguments<'_>,
    ) -> Result<usize, ConsoleError> {
        let capacity = self.ring.capacity();
        let space = self.ring.writable.available().min(capacity - self.cursor);

        let mut window = Window {
            ring: &self.ring,
            start: self.cursor,
            space,
            len: 0,
        };
        fmt::write(&mut window, args).map_err(|_| ConsoleError::Format)?;
        let size = window.len;

        if size == 0 {
            return Ok(0);
        }
        if size <= space {
            // The permits are there already; only this thread takes them.
            self.ring
                .writable
                .acquire(size, &self.stop)
                .map_err(|_| ConsoleError::Interrupted { delivered: 0 })?;
            self.commit(size, stream);
            return Ok(size);
        }

        self.spill.clear();
        if self.spill.try_reserve(size).is_err() {
            warn!(size, "console message dropped: spill allocation failed");
            return Err(ConsoleError::OutOfMemory { size });
        }
        fmt::write(&mut Spill(&mut self.spill), args).map_err(|_| ConsoleError::Format)?;
        trace!(size, space, "console message spilled");

        let spill = std::mem::take(&mut self.spill);
        let result = self.write_chunked(&spill, stream);
        if spill.capacity() <= capacity * SPILL_RETAIN_FACTOR {
            self.spill = spill;
        }
        result
    }

    /// Enqueues raw bytes through the chunked path.
    ///
    /// # Errors
    ///
    /// [`ConsoleError::Interrupted`] if a stop request arrived while the
    /// ring was full.
    pub fn write_bytes(
        &mut self,
        stream: ConsoleStream,
        bytes: &[u8],
    ) -> Result<usize, ConsoleError> {
        self.write_chunked(bytes, stream)
    }

    fn write_chunked(&mut self, data: &[u8], stream: ConsoleStream) -> Result<usize, ConsoleError> {
        let capacity = self.ring.capacity();
        let mut delivered = 0;
        while delivered < data.len() {
            let chunk = (data.len() - delivered).min(capacity - self.cursor);
            self.ring
                .writable
                .acquire(chunk, &self.stop)
                .map_err(|_| ConsoleError::Interrupted { delivered })?;
            // SAFETY: chunk ends at or before the wrap point and we hold
            // `chunk` writable permits starting at the cursor.
            unsafe {
                self.ring.store(self.cursor, &data[delivered..delivered + chunk]);
            }
            delivered += chunk;
            self.commit(chunk, stream);
        }
        Ok(delivered)
    }

    fn commit(&mut self, len: usize, stream: ConsoleStream) {
        self.cursor = (self.cursor + len) % self.ring.capacity();
        self.ring.readable.release(len);
        self.events.emit(EmuEvent::ConsoleDataReady(stream));
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// Formats into the free contiguous space at the cursor and counts the
/// total length, including whatever did not fit.
struct Window<'a> {
    ring: &'a Ring,
    start: usize,
    space: usize,
    len: usize,
}

impl fmt::Write for Window<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.len < self.space {
            let fits = s.len().min(self.space - self.len);
            // SAFETY: [start, start + space) is free space below the wrap
            // point. Nothing there is visible to the consumer until the
            // producer releases it.
            unsafe { self.ring.store(self.start + self.len, &s.as_bytes()[..fits]) };
        }
        self.len += s.len();
        Ok(())
    }
}

struct Spill<'a>(&'a mut Vec<u8>);

impl fmt::Write for Spill<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Consumer half. Lives on the controller thread.
pub struct ConsoleReader {
    ring: Arc<Ring>,
    cursor: usize,
}

impl ConsoleReader {
    /// Bytes ready to read.
    #[must_use]
    pub fn available(&self) -> usize {
        self.ring.readable.available()
    }

    /// Bytes the producer may still write without blocking.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.ring.writable.available()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Copies up to `buf.len()` ready bytes without blocking.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.available().min(buf.len());
        if n == 0 || !self.ring.readable.try_acquire(n) {
            return 0;
        }
        let capacity = self.ring.capacity();
        let first = n.min(capacity - self.cursor);
        // SAFETY: we hold `n` readable permits starting at our cursor; the
        // two ranges cover them up to and after the wrap point.
        unsafe {
            self.ring.load(self.cursor, &mut buf[..first]);
            self.ring.load(0, &mut buf[first..n]);
        }
        self.cursor = (self.cursor + n) % capacity;
        self.ring.writable.release(n);
        n
    }

    /// Like [`read`](Self::read) but waits up to `timeout` for the first byte.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> usize {
        if buf.is_empty() || !self.ring.readable.wait_available(1, timeout) {
            return 0;
        }
        self.read(buf)
    }

    /// Drains every ready byte.
    #[must_use]
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = vec![0; self.available()];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use std::thread;

    fn pair(capacity: usize) -> (ConsoleWriter, ConsoleReader, event::EventReceiver) {
        let (events, receiver) = event::channel();
        let (writer, reader) = channel(capacity, events, Arc::new(StopSignal::new()));
        (writer, reader, receiver)
    }

    fn notifications(receiver: &event::EventReceiver) -> Vec<ConsoleStream> {
        receiver
            .try_iter()
            .filter_map(|e| match e {
                EmuEvent::ConsoleDataReady(stream) => Some(stream),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn small_write_is_one_notification() {
        let (mut writer, mut reader, events) = pair(64);

        let n = writer
            .write(ConsoleStream::Normal, format_args!("pc={:04x}\n", 0x1234))
            .unwrap();

        assert_eq!(n, 8);
        assert_eq!(reader.read_all(), b"pc=1234\n");
        assert_eq!(notifications(&events), vec![ConsoleStream::Normal]);
    }

    #[test]
    fn empty_write_is_a_no_op() {
        let (mut writer, reader, events) = pair(16);

        assert_eq!(writer.write(ConsoleStream::Error, format_args!("")).unwrap(), 0);
        assert_eq!(reader.available(), 0);
        assert!(notifications(&events).is_empty());
    }

    #[test]
    fn message_filling_window_exactly_takes_fast_path() {
        let (mut writer, mut reader, events) = pair(8);

        writer.write(ConsoleStream::Normal, format_args!("abcdefgh")).unwrap();

        assert_eq!(reader.free_space(), 0);
        assert_eq!(reader.read_all(), b"abcdefgh");
        assert_eq!(notifications(&events).len(), 1);
        assert_eq!(reader.free_space(), 8);
    }

    #[test]
    fn wrapping_write_is_split_at_wrap_point() {
        let (mut writer, mut reader, events) = pair(8);

        writer.write(ConsoleStream::Normal, format_args!("012345")).unwrap();
        assert_eq!(reader.read_all(), b"012345");
        let _ = notifications(&events);

        // Cursor at 6: two bytes to the wrap point, then four from the start.
        writer.write(ConsoleStream::Error, format_args!("abcdef")).unwrap();

        assert_eq!(
            notifications(&events),
            vec![ConsoleStream::Error, ConsoleStream::Error]
        );
        assert_eq!(reader.read_all(), b"abcdef");
    }

    #[test]
    fn oversized_message_streams_through_with_backpressure() {
        let (mut writer, mut reader, events) = pair(16);
        let message: String = (0..200).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let expected = message.clone();

        let producer = thread::spawn(move || {
            let n = writer
                .write(ConsoleStream::Normal, format_args!("{message}"))
                .unwrap();
            (n, writer)
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 5];
        while received.len() < expected.len() {
            let n = reader.read_timeout(&mut buf, Duration::from_millis(100));
            received.extend_from_slice(&buf[..n]);
        }

        let (n, _writer) = producer.join().unwrap();
        assert_eq!(n, 200);
        assert_eq!(received, expected.as_bytes());
        assert!(notifications(&events).len() >= 200 / 16);
        assert_eq!(reader.available() + reader.free_space(), 16);
    }

    #[test]
    fn blocked_writer_gives_up_on_stop() {
        let (events, _receiver) = event::channel();
        let stop = Arc::new(StopSignal::new());
        let (mut writer, reader) = channel(4, events, Arc::clone(&stop));

        let producer = thread::spawn(move || {
            writer.write(ConsoleStream::Normal, format_args!("0123456789"))
        });

        thread::sleep(Duration::from_millis(20));
        stop.request_exit();

        match producer.join().unwrap() {
            Err(ConsoleError::Interrupted { delivered }) => assert_eq!(delivered, 4),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(reader.available(), 4);
    }

    #[test]
    fn failing_display_enqueues_nothing() {
        struct Broken;
        impl fmt::Display for Broken {
            fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
                Err(fmt::Error)
            }
        }

        let (mut writer, reader, events) = pair(16);
        let result = writer.write(ConsoleStream::Normal, format_args!("x{Broken}"));

        assert!(matches!(result, Err(ConsoleError::Format)));
        assert_eq!(reader.available(), 0);
        assert_eq!(reader.free_space(), 16);
        assert!(notifications(&events).is_empty());
    }

    #[test]
    fn interleaved_reads_and_writes_keep_permit_invariant() {
        let (mut writer, mut reader, _events) = pair(10);
        let mut buf = [0u8; 3];

        for round in 0..20 {
            writer
                .write(ConsoleStream::Normal, format_args!("{round:02}"))
                .unwrap();
            assert_eq!(reader.available() + reader.free_space(), 10);
            let n = reader.read(&mut buf);
            assert!(n > 0);
            assert_eq!(reader.available() + reader.free_space(), 10);
        }
    }
}
