use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{FrameError, Result};

/// Bounded, thread-safe byte queue with blocking reads.
///
/// Writes never block: they take at most the free capacity and report how
/// much was accepted. Reads either drain what is available or block until
/// enough bytes arrive ([`RingBuffer::read_exact`]), bounded by an
/// optional timeout. A mark can be placed at the current fill level so a
/// partially written message can be discarded later.
pub struct RingBuffer {
    inner: Mutex<Ring>,
    readable: Condvar,
}

struct Ring {
    buf: Box<[u8]>,
    /// Read cursor into `buf`.
    read: usize,
    /// Unread byte count. Invariant: bytes written minus bytes read.
    len: usize,
    /// Unread count at the time of the last `mark`.
    mark: Option<usize>,
    closed: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read: 0,
                len: 0,
                mark: None,
                closed: false,
            }),
            readable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write up to the free capacity. Returns the number of bytes
    /// accepted; callers detect truncation from a short count.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut ring = self.lock();
        let n = ring.push(data);
        if n > 0 {
            self.readable.notify_all();
        }
        n
    }

    /// Write all bytes or none. If the data does not fit, the buffer is
    /// cleared (never left half-written) and `BufferOverflow` returned.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut ring = self.lock();
        let free = ring.buf.len() - ring.len;
        if data.len() > free {
            ring.reset();
            return Err(FrameError::BufferOverflow {
                size: data.len(),
                free,
            });
        }
        ring.push(data);
        self.readable.notify_all();
        Ok(())
    }

    /// Non-blocking read of up to `out.len()` bytes.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.lock().pull(out)
    }

    /// Block until exactly `out.len()` bytes are available, or fail with
    /// `Timeout` / `EndOfStream`. The internal lock is released while
    /// waiting.
    pub fn read_exact(&self, out: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        let mut ring = self.wait_for(out.len(), timeout)?;
        ring.pull(out);
        Ok(())
    }

    /// Block until `n` bytes are available, then discard them.
    pub fn skip(&self, n: usize, timeout: Option<Duration>) -> Result<()> {
        let mut ring = self.wait_for(n, timeout)?;
        ring.drop_front(n);
        Ok(())
    }

    fn wait_for(&self, n: usize, timeout: Option<Duration>) -> Result<MutexGuard<'_, Ring>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.lock();
        loop {
            if ring.len >= n {
                return Ok(ring);
            }
            if ring.closed {
                return Err(FrameError::EndOfStream);
            }
            ring = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(FrameError::Timeout(timeout.unwrap_or_default()));
                    }
                    let (guard, _) = self
                        .readable
                        .wait_timeout(ring, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard
                }
                None => self
                    .readable
                    .wait(ring)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    /// Mark the current fill level. A later [`reset_to_mark`] discards
    /// everything written after this point.
    ///
    /// [`reset_to_mark`]: RingBuffer::reset_to_mark
    pub fn mark(&self) {
        let mut ring = self.lock();
        ring.mark = Some(ring.len);
    }

    /// Discard bytes written after the mark. Without a usable mark the
    /// whole buffer is cleared.
    pub fn reset_to_mark(&self) {
        let mut ring = self.lock();
        match ring.mark {
            Some(m) if ring.len >= m => ring.len = m,
            _ => ring.reset(),
        }
    }

    pub fn clear(&self) {
        self.lock().reset();
    }

    /// Close the buffer: pending and future blocked reads fail with
    /// `EndOfStream` once the remaining bytes run out.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }

    pub fn remaining(&self) -> usize {
        self.lock().len
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

impl Ring {
    fn push(&mut self, data: &[u8]) -> usize {
        let cap = self.buf.len();
        let free = cap - self.len;
        let n = free.min(data.len());

        let write = (self.read + self.len) % cap;
        let tail = n.min(cap - write);
        self.buf[write..write + tail].copy_from_slice(&data[..tail]);
        self.buf[..n - tail].copy_from_slice(&data[tail..n]);

        self.len += n;
        n
    }

    fn pull(&mut self, out: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = self.len.min(out.len());

        let tail = n.min(cap - self.read);
        out[..tail].copy_from_slice(&self.buf[self.read..self.read + tail]);
        out[tail..n].copy_from_slice(&self.buf[..n - tail]);

        self.read = (self.read + n) % cap;
        self.len -= n;
        self.consume_mark(n);
        n
    }

    fn drop_front(&mut self, n: usize) {
        let n = self.len.min(n);
        self.read = (self.read + n) % self.buf.len();
        self.len -= n;
        self.consume_mark(n);
    }

    fn consume_mark(&mut self, read: usize) {
        if let Some(m) = self.mark {
            self.mark = if read <= m { Some(m - read) } else { None };
        }
    }

    fn reset(&mut self) {
        self.len = 0;
        self.mark = None;
    }
}
