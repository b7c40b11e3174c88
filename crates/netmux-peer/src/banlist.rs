use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netmux_frame::{EventBus, NetEvent};
use tracing::info;

/// Banned addresses, consulted before any demultiplexing happens.
///
/// Timed bans are recorded here like permanent ones; the auto-pardon is
/// a scheduled task owned by the server.
pub struct BanList {
    banned: Mutex<HashSet<SocketAddr>>,
    bus: Arc<dyn EventBus>,
}

impl BanList {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            banned: Mutex::new(HashSet::new()),
            bus,
        }
    }

    /// Ban an address. Returns false if it was already banned.
    pub fn ban(&self, addr: SocketAddr, duration: Option<Duration>) -> bool {
        let inserted = self
            .banned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(addr);
        if inserted {
            info!(remote = %addr, ?duration, "address banned");
            self.bus.publish(NetEvent::Banned {
                remote: addr,
                duration,
            });
        }
        inserted
    }

    /// Lift a ban. Returns false if the address was not banned.
    pub fn pardon(&self, addr: SocketAddr) -> bool {
        let removed = self
            .banned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&addr);
        if removed {
            info!(remote = %addr, "address pardoned");
            self.bus.publish(NetEvent::Pardoned { remote: addr });
        }
        removed
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(addr)
    }

    pub fn len(&self) -> usize {
        self.banned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
