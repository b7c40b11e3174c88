use std::time::Duration;

use netmux_transport::ConnectionKind;

/// Runtime configuration for servers and clients.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP stream or UDP datagrams.
    pub transport: ConnectionKind,
    /// Maximum simultaneous connections a server accepts.
    pub backlog: usize,
    /// Per-channel buffer capacity; also the maximum packet payload.
    pub buffer_capacity: usize,
    /// Deadline for the initial connect and passphrase exchange.
    pub connection_timeout: Duration,
    /// Workers on the pump and handshake groups.
    pub pool_size: usize,
    /// Liveness ping period.
    pub handshake_interval: Duration,
    /// Silence beyond this disconnects (and bans) the peer.
    pub timeout_delay: Duration,
    /// Deadline for reading an echoed ping timestamp.
    pub ping_read_timeout: Duration,
    /// Period of the non-blocking socket poll tasks.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let handshake_interval = Duration::from_millis(200);
        Self {
            transport: ConnectionKind::Stream,
            backlog: 50,
            buffer_capacity: 24 * 1024,
            connection_timeout: Duration::from_secs(3),
            pool_size: 1,
            handshake_interval,
            timeout_delay: handshake_interval * 10,
            ping_read_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(2),
        }
    }
}

impl Config {
    pub fn with_transport(mut self, transport: ConnectionKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_handshake_interval(mut self, interval: Duration) -> Self {
        self.handshake_interval = interval;
        self
    }

    pub fn with_timeout_delay(mut self, delay: Duration) -> Self {
        self.timeout_delay = delay;
        self
    }

    pub fn with_ping_read_timeout(mut self, timeout: Duration) -> Self {
        self.ping_read_timeout = timeout;
        self
    }
}
