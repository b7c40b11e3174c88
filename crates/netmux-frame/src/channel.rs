use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use netmux_transport::Pipeline;
use tracing::{trace, warn};

use crate::codec::{encode_packet_header, PacketHeader, SUB_HEADER_SIZE};
use crate::error::{FrameError, Result};
use crate::ring::RingBuffer;

/// Receiving side of one logical channel.
///
/// The valve feeds completed packet bodies into [`process`]; this side
/// reassembles sequenced batches into a contiguous byte stream backed by
/// a [`RingBuffer`] and exposes blocking typed reads.
///
/// [`process`]: InputChannel::process
pub struct InputChannel {
    channel_id: u16,
    buffer: RingBuffer,
    state: Mutex<InputState>,
    sequence_losses: AtomicU64,
}

struct InputState {
    /// Batch index of the segment currently being reassembled; 0 when
    /// between messages.
    current_batch: u16,
    /// Payload bytes of the current batch still expected in later calls.
    left_to_read: usize,
    /// Continuation bytes belong to a discarded batch and are skipped.
    discarding: bool,
    package_start: bool,
}

impl InputChannel {
    pub fn new(channel_id: u16, buffer_capacity: usize) -> Self {
        Self {
            channel_id,
            buffer: RingBuffer::new(buffer_capacity),
            state: Mutex::new(InputState {
                current_batch: 0,
                left_to_read: 0,
                discarding: false,
                package_start: false,
            }),
            sequence_losses: AtomicU64::new(0),
        }
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Consume one packet body: `[u16 batch_index][u32 batch_size]`
    /// followed by payload bytes (plus, possibly, further chained
    /// sub-headers).
    ///
    /// Batch index 1 starts a new logical message; `expected + 1`
    /// continues it; any other index discards the in-progress message
    /// and resets cleanly for the next start.
    pub fn process(&self, data: &[u8]) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut rest = data;

        while !rest.is_empty() {
            if state.left_to_read == 0 {
                if rest.len() < SUB_HEADER_SIZE {
                    warn!(
                        channel = self.channel_id,
                        len = rest.len(),
                        "runt packet body, dropping"
                    );
                    return;
                }

                let batch_index = u16::from_be_bytes([rest[0], rest[1]]);
                let batch_size =
                    u32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
                rest = &rest[SUB_HEADER_SIZE..];

                if batch_index == 1 {
                    state.current_batch = 1;
                    state.discarding = false;
                    self.buffer.mark();
                } else if state.current_batch != 0
                    && batch_index == state.current_batch.wrapping_add(1)
                {
                    state.current_batch = batch_index;
                } else {
                    warn!(
                        channel = self.channel_id,
                        expected = state.current_batch.wrapping_add(1),
                        found = batch_index,
                        "lost packet, discarding in-progress message"
                    );
                    self.sequence_losses.fetch_add(1, Ordering::Relaxed);
                    self.buffer.reset_to_mark();
                    state.current_batch = 0;
                    state.discarding = true;
                }

                let take = batch_size.min(rest.len());
                if !state.discarding {
                    self.save_write(&mut state, &rest[..take]);
                }
                state.left_to_read = batch_size - take;
                state.package_start = state.current_batch == 1
                    && state.left_to_read == 0
                    && !state.discarding;
                rest = &rest[take..];
            } else {
                let take = state.left_to_read.min(rest.len());
                if !state.discarding {
                    self.save_write(&mut state, &rest[..take]);
                }
                state.left_to_read -= take;
                state.package_start = state.current_batch == 1
                    && state.left_to_read == 0
                    && !state.discarding;
                rest = &rest[take..];
            }
        }
    }

    fn save_write(&self, state: &mut MutexGuard<'_, InputState>, data: &[u8]) {
        if let Err(err) = self.buffer.write_all(data) {
            warn!(channel = self.channel_id, %err, "input buffer overflow, message lost");
            self.sequence_losses.fetch_add(1, Ordering::Relaxed);
            state.current_batch = 0;
            state.discarding = true;
        }
    }

    /// Whether the most recent `process` call completed the first
    /// segment of a message.
    pub fn is_package_start(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .package_start
    }

    /// Out-of-order packets observed so far.
    pub fn sequence_losses(&self) -> u64 {
        self.sequence_losses.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.buffer.remaining()
    }

    /// Non-blocking read of up to `out.len()` reassembled bytes.
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.buffer.read(out)
    }

    /// Blocking read of exactly `out.len()` bytes.
    pub fn read_exact(&self, out: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        self.buffer.read_exact(out, timeout)
    }

    pub fn read_u8(&self, timeout: Option<Duration>) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.buffer.read_exact(&mut buf, timeout)?;
        Ok(buf[0])
    }

    pub fn read_i32(&self, timeout: Option<Duration>) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.buffer.read_exact(&mut buf, timeout)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn read_u32(&self, timeout: Option<Duration>) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.buffer.read_exact(&mut buf, timeout)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_i64(&self, timeout: Option<Duration>) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.buffer.read_exact(&mut buf, timeout)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    pub fn read_utf(&self, timeout: Option<Duration>) -> Result<String> {
        let mut len_buf = [0u8; 2];
        self.buffer.read_exact(&mut len_buf, timeout)?;
        let mut bytes = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        self.buffer.read_exact(&mut bytes, timeout)?;
        String::from_utf8(bytes).map_err(|_| {
            FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid utf-8 in channel stream",
            ))
        })
    }

    pub fn skip(&self, n: usize, timeout: Option<Duration>) -> Result<()> {
        self.buffer.skip(n, timeout)
    }

    pub fn clear(&self) {
        self.buffer.clear();
    }

    /// Close the backing buffer, waking blocked readers with
    /// `EndOfStream`.
    pub fn close(&self) {
        self.buffer.close();
    }
}

/// Sending side of one logical channel.
///
/// Writes accumulate in a bounded staging buffer; once the buffer is
/// full a pump step is forced before more bytes are accepted, so the
/// buffer never grows past its capacity. Pumping slices the buffered
/// bytes into packets no larger than the valve's network buffer size.
pub struct OutputChannel {
    channel_id: u16,
    pipeline: Arc<Pipeline>,
    /// Staging capacity; writes force a pump at this level.
    capacity: usize,
    /// Maximum packet payload handed to the pipeline.
    max_packet: usize,
    inner: Mutex<OutputState>,
}

struct OutputState {
    buf: BytesMut,
    /// Last sequence number used; reset to 0 on flush so the next
    /// packet starts a fresh message with sequence 1.
    sequence: u16,
}

impl OutputChannel {
    pub fn new(channel_id: u16, buffer_capacity: usize, pipeline: Arc<Pipeline>) -> Self {
        Self {
            channel_id,
            pipeline,
            capacity: buffer_capacity,
            max_packet: buffer_capacity,
            inner: Mutex::new(OutputState {
                buf: BytesMut::with_capacity(buffer_capacity),
                sequence: 0,
            }),
        }
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Buffer bytes for transmission, pumping whenever the staging
    /// buffer fills up.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let mut rest = data;
        while !rest.is_empty() {
            let free = self.capacity.saturating_sub(inner.buf.len());
            if free == 0 {
                self.pump_locked(&mut inner)?;
                continue;
            }
            let take = free.min(rest.len());
            inner.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(())
    }

    pub fn write_u8(&self, value: u8) -> Result<()> {
        self.write(&[value])
    }

    pub fn write_i32(&self, value: i32) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_u32(&self, value: u32) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_i64(&self, value: i64) -> Result<()> {
        self.write(&value.to_be_bytes())
    }

    /// Write a `u16`-length-prefixed UTF-8 string.
    pub fn write_utf(&self, value: &str) -> Result<()> {
        let len = value.len();
        if len > u16::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: u16::MAX as usize,
            });
        }
        self.write(&(len as u16).to_be_bytes())?;
        self.write(value.as_bytes())
    }

    /// Push all buffered bytes through the pipeline without ending the
    /// message. The valve's output task calls this.
    pub fn pump(&self) -> Result<()> {
        let mut inner = self.lock();
        self.pump_locked(&mut inner)
    }

    /// Pump and reset the sequence counter: the next packet starts a
    /// new logical message.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        self.pump_locked(&mut inner)?;
        inner.sequence = 0;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pump_locked(&self, inner: &mut MutexGuard<'_, OutputState>) -> Result<()> {
        while !inner.buf.is_empty() {
            let len = self.max_packet.min(inner.buf.len());
            inner.sequence = inner.sequence.wrapping_add(1);

            let mut packet = BytesMut::with_capacity(crate::codec::PACKET_HEADER_SIZE + len);
            encode_packet_header(
                PacketHeader {
                    channel: self.channel_id,
                    sequence: inner.sequence,
                    payload_len: len as u32,
                },
                &mut packet,
            );
            let chunk = inner.buf.split_to(len);
            packet.put_slice(&chunk);

            self.pipeline.write(&packet)?;
            trace!(
                channel = self.channel_id,
                sequence = inner.sequence,
                bytes = len,
                "packet pumped"
            );
        }
        Ok(())
    }
}
