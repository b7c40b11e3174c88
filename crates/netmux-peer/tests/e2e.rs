//! End-to-end scenarios: real sockets, real scheduler workers, both
//! transports.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use netmux_frame::{DisconnectCause, EventBus, NetEvent, NullBus, ReplyChannel};
use netmux_peer::{Client, Config, Server};
use netmux_sched::WorkerBoss;
use netmux_transport::ConnectionKind;

/// Forwards every event over an mpsc channel.
struct CollectBus {
    tx: Mutex<mpsc::Sender<NetEvent>>,
}

impl CollectBus {
    fn new() -> (Arc<Self>, mpsc::Receiver<NetEvent>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }
}

impl EventBus for CollectBus {
    fn publish(&self, event: NetEvent) {
        let _ = self.tx.lock().unwrap().send(event);
    }
}

/// Answers "ping" requests with "pong" as soon as they arrive.
struct EchoBus {
    responder: OnceLock<Arc<ReplyChannel>>,
}

impl EventBus for EchoBus {
    fn publish(&self, event: NetEvent) {
        if let NetEvent::RequestReceived {
            request_id,
            payload,
            ..
        } = event
        {
            if let Some(channel) = self.responder.get() {
                assert_eq!(payload[0].as_ref(), b"ping");
                channel
                    .reply(request_id, &[b"pong"])
                    .expect("reply should send");
            }
        }
    }
}

fn wait_for<T>(
    rx: &mpsc::Receiver<NetEvent>,
    timeout: Duration,
    mut select: impl FnMut(&NetEvent) -> Option<T>,
) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for event");
        match rx.recv_timeout(remaining) {
            Ok(event) => {
                if let Some(value) = select(&event) {
                    return value;
                }
            }
            Err(err) => panic!("timed out waiting for event: {err}"),
        }
    }
}

fn fast_config(transport: ConnectionKind) -> Config {
    Config::default()
        .with_transport(transport)
        .with_handshake_interval(Duration::from_millis(50))
        .with_timeout_delay(Duration::from_millis(400))
        .with_connection_timeout(Duration::from_secs(2))
}

fn request_reply_roundtrip(transport: ConnectionKind) {
    let (server_bus, server_events) = CollectBus::new();
    let server = Server::new(
        fast_config(transport),
        "secret",
        Arc::new(WorkerBoss::new()),
        server_bus,
    );
    let addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = Client::new(
        fast_config(transport),
        "secret",
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    client.connect(addr).unwrap();

    // The server publishes exactly one post-connection notification.
    let peer_addr: SocketAddr = wait_for(&server_events, Duration::from_secs(3), |event| {
        if let NetEvent::PostConnection { remote } = event {
            Some(*remote)
        } else {
            None
        }
    });

    // Answer requests on channel 5 server-side.
    let server_valve = server.valve(&peer_addr).expect("valve should be registered");
    let echo = Arc::new(EchoBus {
        responder: OnceLock::new(),
    });
    let responder = ReplyChannel::attach(&server_valve, 5, echo.clone()).unwrap();
    echo.responder.set(responder).ok().unwrap();

    // Issue the request client-side and block for the reply.
    let client_valve = client.valve().expect("client valve");
    let requester = ReplyChannel::attach(&client_valve, 5, Arc::new(NullBus)).unwrap();
    let reply = requester
        .request(&[b"ping"], Some(Duration::from_secs(3)))
        .unwrap();

    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].as_ref(), b"pong");

    client.disconnect();
    server.stop();
}

#[test]
fn tcp_request_reply_roundtrip() {
    request_reply_roundtrip(ConnectionKind::Stream);
}

#[test]
fn udp_request_reply_roundtrip() {
    request_reply_roundtrip(ConnectionKind::Datagram);
}

#[test]
fn wrong_passphrase_is_rejected() {
    let (server_bus, server_events) = CollectBus::new();
    let server = Server::new(
        fast_config(ConnectionKind::Stream),
        "secret",
        Arc::new(WorkerBoss::new()),
        server_bus,
    );
    let addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = Client::new(
        fast_config(ConnectionKind::Stream),
        "wrong-guess",
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    // The raw connect succeeds; authentication fails server-side.
    client.connect(addr).unwrap();

    let cause = wait_for(&server_events, Duration::from_secs(3), |event| {
        if let NetEvent::FailedConnection { cause, .. } = event {
            Some(cause.clone())
        } else {
            None
        }
    });
    assert!(cause.contains("passphrase"));
    assert!(server.valves().is_empty());

    client.disconnect();
    server.stop();
}

#[test]
fn liveness_handshake_measures_ping() {
    let server = Server::new(
        fast_config(ConnectionKind::Stream),
        "secret",
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    let addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = Client::new(
        fast_config(ConnectionKind::Stream),
        "secret",
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    client.connect(addr).unwrap();

    // A few handshake rounds are enough for both directions.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if client.ping().is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "ping never measured");
        std::thread::sleep(Duration::from_millis(25));
    }

    assert!(client.ping().unwrap() < Duration::from_secs(1));

    client.disconnect();
    server.stop();
}

#[test]
fn banned_peer_times_out_and_is_dropped() {
    let (server_bus, server_events) = CollectBus::new();
    let server = Server::new(
        fast_config(ConnectionKind::Datagram),
        "secret",
        Arc::new(WorkerBoss::new()),
        server_bus,
    );
    let addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();

    // Raw UDP peer: authenticate, then get banned.
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.send_to(b"secret", addr).unwrap();

    let peer_addr = wait_for(&server_events, Duration::from_secs(3), |event| {
        if let NetEvent::PostConnection { remote } = event {
            Some(*remote)
        } else {
            None
        }
    });
    assert_eq!(peer_addr, socket.local_addr().unwrap());

    server.ban(peer_addr);

    // Banned datagrams are dropped before demultiplexing, so the peer
    // goes silent from the server's point of view and times out.
    let cause = wait_for(&server_events, Duration::from_secs(5), |event| {
        if let NetEvent::Disconnection { remote, cause } = event {
            assert_eq!(*remote, peer_addr);
            Some(cause.clone())
        } else {
            None
        }
    });
    assert!(matches!(cause, DisconnectCause::Timeout { .. }));
    assert!(server.valve(&peer_addr).is_none());

    server.stop();
}

#[test]
fn server_stop_disconnects_client() {
    let (client_bus, client_events) = CollectBus::new();
    let server = Server::new(
        fast_config(ConnectionKind::Stream),
        "secret",
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    let addr = server.start("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = Client::new(
        fast_config(ConnectionKind::Stream),
        "secret",
        Arc::new(WorkerBoss::new()),
        client_bus,
    );
    client.connect(addr).unwrap();

    // Wait out the server-side handshake so the valve exists, then
    // stop; the client observes the close.
    std::thread::sleep(Duration::from_millis(200));
    server.stop();

    wait_for(&client_events, Duration::from_secs(3), |event| {
        matches!(event, NetEvent::Disconnection { .. }).then_some(())
    });

    client.disconnect();
}
