use std::net::SocketAddr;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the pipeline.
    #[error("pipeline I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload does not fit into a single datagram.
    #[error("payload too large for datagram ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The pipeline has been closed.
    #[error("pipeline closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;
