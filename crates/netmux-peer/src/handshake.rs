use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use netmux_frame::Valve;
use tracing::{trace, warn};

use crate::config::Config;

/// Channel reserved for the liveness handshake.
pub const HANDSHAKE_CHANNEL: u16 = 1;

/// Periodic liveness ping/pong for a set of valves.
///
/// Each tick writes an `i64` millisecond timestamp on the handshake
/// channel of every live valve and, when the peer's timestamp has been
/// echoed back, derives the measured ping. Valves silent beyond the
/// timeout delay are reported to the caller, which disconnects (and on
/// the server side bans) them.
pub struct HandshakeHandler {
    channel: u16,
    interval: Duration,
    timeout_delay: Duration,
    ping_read_timeout: Duration,
    pings: Mutex<HashMap<SocketAddr, Duration>>,
}

impl HandshakeHandler {
    pub fn new(channel: u16, config: &Config) -> Self {
        Self {
            channel,
            interval: config.handshake_interval,
            timeout_delay: config.timeout_delay,
            ping_read_timeout: config.ping_read_timeout,
            pings: Mutex::new(HashMap::new()),
        }
    }

    /// One handshake round. Returns the peers that have been silent
    /// past the timeout delay (grace: one handshake interval).
    pub fn tick(&self, valves: &[Arc<Valve>]) -> Vec<(SocketAddr, Duration)> {
        let mut timed_out = Vec::new();

        for valve in valves {
            let remote = valve.remote();
            let silent_for = valve.last_reception().elapsed();
            if silent_for > self.timeout_delay + self.interval {
                timed_out.push((remote, silent_for));
                continue;
            }

            if let Err(err) = self.ping(valve) {
                warn!(%remote, %err, "handshake ping failed");
            }
        }

        timed_out
    }

    fn ping(&self, valve: &Arc<Valve>) -> netmux_frame::Result<()> {
        let (input, output) = valve.open_channel(self.channel)?;

        output.write_i64(now_millis())?;
        output.flush()?;

        // The peer's most recent timestamp, if it has arrived, yields
        // the measured ping.
        if input.available() >= 8 {
            let sent = input.read_i64(Some(self.ping_read_timeout))?;
            let ping = now_millis().saturating_sub(sent).max(0) as u64;
            trace!(remote = %valve.remote(), ping_ms = ping, "ping measured");
            self.pings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(valve.remote(), Duration::from_millis(ping));
        }
        Ok(())
    }

    /// Last measured round trip for a peer.
    pub fn ping_of(&self, addr: &SocketAddr) -> Option<Duration> {
        self.pings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(addr)
            .copied()
    }

    /// Drop state for a disconnected peer.
    pub fn forget(&self, addr: &SocketAddr) {
        self.pings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(addr);
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::net::{TcpListener, TcpStream};

    use netmux_frame::NullBus;
    use netmux_transport::Pipeline;

    use super::*;

    fn valve_pair() -> (Arc<Valve>, Arc<Valve>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let a = Arc::new(Pipeline::tcp(client));
        let b = Arc::new(Pipeline::tcp(server));
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        (
            Arc::new(Valve::new(a, 1024, Arc::new(NullBus)).unwrap()),
            Arc::new(Valve::new(b, 1024, Arc::new(NullBus)).unwrap()),
        )
    }

    fn pump(valve: &Arc<Valve>) {
        let mut buf = [0u8; 4096];
        loop {
            match valve.pipeline().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => valve.update_inputs(&buf[..n]).unwrap(),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => panic!("pump failed: {err}"),
            }
        }
    }

    fn config() -> Config {
        Config::default()
            .with_handshake_interval(Duration::from_millis(50))
            .with_timeout_delay(Duration::from_millis(200))
    }

    #[test]
    fn ping_is_measured_from_echoed_timestamps() {
        let (va, vb) = valve_pair();
        let server_side = HandshakeHandler::new(HANDSHAKE_CHANNEL, &config());
        let client_side = HandshakeHandler::new(HANDSHAKE_CHANNEL, &config());

        // Round 1: both sides send their timestamps.
        assert!(server_side.tick(std::slice::from_ref(&va)).is_empty());
        assert!(client_side.tick(std::slice::from_ref(&vb)).is_empty());
        pump(&va);
        pump(&vb);

        // Round 2: each side reads the peer's timestamp.
        server_side.tick(std::slice::from_ref(&va));
        client_side.tick(std::slice::from_ref(&vb));

        let ping = server_side.ping_of(&va.remote()).unwrap();
        assert!(ping < Duration::from_secs(2));
    }

    #[test]
    fn silent_peer_is_reported_after_timeout() {
        let (va, _vb) = valve_pair();
        let cfg = Config::default()
            .with_handshake_interval(Duration::from_millis(10))
            .with_timeout_delay(Duration::from_millis(30));
        let handler = HandshakeHandler::new(HANDSHAKE_CHANNEL, &cfg);

        // Nothing inbound: the valve's last reception ages past the
        // delay plus one interval of grace.
        std::thread::sleep(Duration::from_millis(60));
        let timed_out = handler.tick(std::slice::from_ref(&va));

        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].0, va.remote());
        assert!(timed_out[0].1 >= Duration::from_millis(40));
    }

    #[test]
    fn forget_drops_ping_state() {
        let (va, vb) = valve_pair();
        let handler = HandshakeHandler::new(HANDSHAKE_CHANNEL, &config());
        let peer = HandshakeHandler::new(HANDSHAKE_CHANNEL, &config());

        handler.tick(std::slice::from_ref(&va));
        peer.tick(std::slice::from_ref(&vb));
        pump(&va);
        pump(&vb);
        handler.tick(std::slice::from_ref(&va));

        assert!(handler.ping_of(&va.remote()).is_some());
        handler.forget(&va.remote());
        assert!(handler.ping_of(&va.remote()).is_none());
    }
}
