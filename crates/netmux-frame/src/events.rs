use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The peer was silent past the configured timeout delay.
    Timeout { silent_for: Duration },
    /// The transport failed.
    Io(String),
    /// The connection was closed in an orderly fashion.
    Closed,
}

/// Everything the core reports to the outside world.
///
/// One closed set of event kinds, dispatched by pattern matching. The
/// core consumes nothing back through this channel; reactions happen via
/// the public `send`/`request`/`reply`/`ban`/`pardon` operations.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    /// A peer is attempting to connect (before the passphrase exchange).
    PreConnection { remote: SocketAddr },
    /// The passphrase exchange succeeded and a valve is registered.
    PostConnection { remote: SocketAddr },
    /// An inbound connection attempt failed. Exactly one per attempt.
    FailedConnection { remote: SocketAddr, cause: String },
    /// A live connection dropped. Exactly one per connection.
    Disconnection {
        remote: SocketAddr,
        cause: DisconnectCause,
    },
    /// A completed packet was routed into a channel.
    DataReceived {
        remote: SocketAddr,
        channel: u16,
        package_start: bool,
    },
    /// An inbound request arrived on a reply channel; answer via
    /// `ReplyChannel::reply` with the carried id.
    RequestReceived {
        remote: SocketAddr,
        channel: u16,
        request_id: i32,
        payload: Vec<Bytes>,
    },
    /// An address was banned.
    Banned {
        remote: SocketAddr,
        duration: Option<Duration>,
    },
    /// An address was pardoned.
    Pardoned { remote: SocketAddr },
}

/// Injected event sink; replaces any global registry.
///
/// `allow_channel` is the one consultation the core makes: returning
/// `false` vetoes creation of that channel and the triggering packet is
/// dropped.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: NetEvent);

    fn allow_channel(&self, _channel: u16) -> bool {
        true
    }
}

/// Event bus that discards everything.
#[derive(Debug, Default)]
pub struct NullBus;

impl EventBus for NullBus {
    fn publish(&self, _event: NetEvent) {}
}
