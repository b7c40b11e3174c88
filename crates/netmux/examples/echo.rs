//! In-process echo: a server and a client over loopback TCP, one
//! request/reply exchange on channel 5.
//!
//! Run with: `cargo run --example echo`

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use netmux::frame::{EventBus, NetEvent, NullBus, ReplyChannel};
use netmux::peer::{Client, Config, Server};
use netmux::sched::WorkerBoss;

struct EchoBus {
    responder: OnceLock<Arc<ReplyChannel>>,
    connected: Mutex<Option<std::net::SocketAddr>>,
}

impl EventBus for EchoBus {
    fn publish(&self, event: NetEvent) {
        match event {
            NetEvent::PostConnection { remote } => {
                *self.connected.lock().unwrap() = Some(remote);
            }
            NetEvent::RequestReceived {
                request_id,
                payload,
                ..
            } => {
                println!(
                    "server got request {request_id}: {:?}",
                    String::from_utf8_lossy(&payload[0])
                );
                if let Some(channel) = self.responder.get() {
                    channel
                        .reply(request_id, &[b"pong"])
                        .expect("reply should send");
                }
            }
            _ => {}
        }
    }
}

fn main() {
    let bus = Arc::new(EchoBus {
        responder: OnceLock::new(),
        connected: Mutex::new(None),
    });

    let server = Server::new(
        Config::default(),
        "secret",
        Arc::new(WorkerBoss::new()),
        bus.clone(),
    );
    let addr = server
        .start("127.0.0.1:0".parse().unwrap())
        .expect("server should bind");
    println!("server on {addr}");

    let client = Client::new(
        Config::default(),
        "secret",
        Arc::new(WorkerBoss::new()),
        Arc::new(NullBus),
    );
    client.connect(addr).expect("client should connect");

    // Wait for the server to register the valve, then answer channel 5.
    let peer = loop {
        if let Some(peer) = *bus.connected.lock().unwrap() {
            break peer;
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    let valve = server.valve(&peer).expect("valve should exist");
    let responder = ReplyChannel::attach(&valve, 5, bus.clone()).expect("attach");
    bus.responder.set(responder).ok().expect("set once");

    let requester = ReplyChannel::attach(&client.valve().expect("client valve"), 5, Arc::new(NullBus))
        .expect("attach");
    let reply = requester
        .request(&[b"ping"], Some(Duration::from_secs(3)))
        .expect("request should get a reply");
    println!("client got reply: {:?}", String::from_utf8_lossy(&reply[0]));

    client.disconnect();
    server.stop();
}
