/// Errors that can occur in channel and valve operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A blocking read exceeded its deadline.
    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The buffer was closed before enough data arrived.
    #[error("end of stream")]
    EndOfStream,

    /// A producer outran the consumer; the buffer was cleared.
    #[error("buffer overflow ({size} bytes into {free} free)")]
    BufferOverflow { size: usize, free: usize },

    /// A packet arrived out of the expected sequence order.
    #[error("sequence loss on channel {channel} (expected {expected}, got {found})")]
    SequenceLoss {
        channel: u16,
        expected: u16,
        found: u16,
    },

    /// The referenced channel does not exist in the valve.
    #[error("unknown channel {0}")]
    UnknownChannel(u16),

    /// A payload exceeds what the wire format can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Channel creation was vetoed by the event bus.
    #[error("channel {0} creation vetoed")]
    ChannelVetoed(u16),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] netmux_transport::TransportError),

    /// An I/O error occurred.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A received message envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),
}

pub type Result<T> = std::result::Result<T, FrameError>;
