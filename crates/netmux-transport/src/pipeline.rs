use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use crate::error::{Result, TransportError};

/// Size of the length prefix written before every block.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Practical single-datagram payload budget: the IPv4 UDP maximum minus
/// the length prefix. Callers chunk larger writes upstream.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_507 - LENGTH_PREFIX_SIZE;

const INITIAL_WRITE_CAPACITY: usize = 8 * 1024;

/// The kind of connection a pipeline speaks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Reliable byte stream (TCP).
    Stream,
    /// Unreliable datagrams (UDP).
    Datagram,
}

/// One raw connection with length-prefixed framed transmission.
///
/// Every `write` prepends a 4-byte big-endian length and transmits the
/// block atomically with respect to other writers. Once closed, a
/// pipeline stays closed.
pub struct Pipeline {
    inner: PipelineInner,
    /// Serializes writers and reuses the frame assembly buffer.
    write_buf: Mutex<BytesMut>,
    closed: AtomicBool,
}

enum PipelineInner {
    Tcp(TcpStream),
    Udp { socket: UdpSocket, remote: SocketAddr },
}

impl Pipeline {
    /// Wrap a connected TCP stream.
    pub fn tcp(stream: TcpStream) -> Self {
        Self {
            inner: PipelineInner::Tcp(stream),
            write_buf: Mutex::new(BytesMut::with_capacity(INITIAL_WRITE_CAPACITY)),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap a UDP socket paired with one remote peer.
    pub fn udp(socket: UdpSocket, remote: SocketAddr) -> Self {
        Self {
            inner: PipelineInner::Udp { socket, remote },
            write_buf: Mutex::new(BytesMut::with_capacity(INITIAL_WRITE_CAPACITY)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match &self.inner {
            PipelineInner::Tcp(_) => ConnectionKind::Stream,
            PipelineInner::Udp { .. } => ConnectionKind::Datagram,
        }
    }

    /// Write one length-prefixed block.
    ///
    /// TCP transmits the frame in a single stream write (retrying short
    /// writes). UDP sends exactly one datagram per call and rejects
    /// payloads beyond [`MAX_DATAGRAM_PAYLOAD`].
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut buf = self
            .write_buf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.clear();
        buf.reserve(LENGTH_PREFIX_SIZE + data.len());
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);

        match &self.inner {
            PipelineInner::Tcp(stream) => {
                let mut offset = 0usize;
                while offset < buf.len() {
                    match (&*stream).write(&buf[offset..]) {
                        Ok(0) => {
                            self.closed.store(true, Ordering::SeqCst);
                            return Err(TransportError::Closed);
                        }
                        Ok(n) => offset += n,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                        Err(err) => return Err(TransportError::Io(err)),
                    }
                }
            }
            PipelineInner::Udp { socket, remote } => {
                if data.len() > MAX_DATAGRAM_PAYLOAD {
                    return Err(TransportError::PayloadTooLarge {
                        size: data.len(),
                        max: MAX_DATAGRAM_PAYLOAD,
                    });
                }
                socket.send_to(&buf, *remote)?;
            }
        }

        trace!(bytes = data.len(), "pipeline write");
        Ok(())
    }

    /// Raw (unframed) read for pump tasks.
    ///
    /// For datagram pipelines, blocks of other peers are discarded; only
    /// data from the paired remote is returned.
    pub fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &self.inner {
            PipelineInner::Tcp(stream) => (&*stream).read(buf),
            PipelineInner::Udp { socket, remote } => loop {
                let (n, from) = socket.recv_from(buf)?;
                if from == *remote {
                    return Ok(n);
                }
                trace!(%from, "discarding datagram from foreign peer");
            },
        }
    }

    /// Switch the underlying socket between blocking and non-blocking
    /// mode. Pump tasks run the socket non-blocking.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            PipelineInner::Tcp(stream) => stream.set_nonblocking(nonblocking)?,
            PipelineInner::Udp { socket, .. } => socket.set_nonblocking(nonblocking)?,
        }
        Ok(())
    }

    /// Set a read timeout on the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            PipelineInner::Tcp(stream) => stream.set_read_timeout(timeout)?,
            PipelineInner::Udp { socket, .. } => socket.set_read_timeout(timeout)?,
        }
        Ok(())
    }

    /// Close the pipeline. Idempotent; `is_closed` never flips back.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let PipelineInner::Tcp(stream) = &self.inner {
                let _ = stream.shutdown(Shutdown::Both);
            }
            debug!("pipeline closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            PipelineInner::Tcp(stream) => Ok(stream.local_addr()?),
            PipelineInner::Udp { socket, .. } => Ok(socket.local_addr()?),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            PipelineInner::Tcp(stream) => Ok(stream.peer_addr()?),
            PipelineInner::Udp { remote, .. } => Ok(*remote),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind() {
            ConnectionKind::Stream => "tcp",
            ConnectionKind::Datagram => "udp",
        };
        f.debug_struct("Pipeline")
            .field("kind", &kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}
