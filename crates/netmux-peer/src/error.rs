use std::time::Duration;

/// Errors that can occur in server and client operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] netmux_transport::TransportError),

    /// Channel/valve-level error.
    #[error("frame error: {0}")]
    Frame(#[from] netmux_frame::FrameError),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Sched(#[from] netmux_sched::SchedError),

    /// An I/O error occurred.
    #[error("peer I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening the raw connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The passphrase exchange failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The peer was silent past the timeout delay.
    #[error("handshake timeout ({silent_for:?} without inbound data)")]
    HandshakeTimeout { silent_for: Duration },

    /// The operation needs an established connection.
    #[error("not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, PeerError>;
