use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::error::{FrameError, Result};
use crate::events::{EventBus, NetEvent};
use crate::message::MessageChannel;
use crate::valve::Valve;

const FLAG_REPLY: u8 = 1;

/// Request-id correlation on top of a [`MessageChannel`]: a
/// fire-and-forget channel becomes a synchronous call.
///
/// Outbound requests carry `{id, reply=false, payload}`; the caller
/// blocks on a per-request completion slot until the matching reply
/// arrives or the timeout passes. Inbound requests surface as
/// [`NetEvent::RequestReceived`] and are answered via [`reply`].
///
/// [`reply`]: ReplyChannel::reply
pub struct ReplyChannel {
    message: Arc<MessageChannel>,
    shared: Arc<ReplyShared>,
}

struct ReplyShared {
    bus: Arc<dyn EventBus>,
    remote: SocketAddr,
    channel_id: u16,
    /// Pending request ids and their completion slots. Ids are reused,
    /// but never while still pending.
    pending: Mutex<HashMap<i32, Arc<ReplySlot>>>,
}

struct ReplySlot {
    result: Mutex<Option<Vec<Bytes>>>,
    ready: Condvar,
}

impl ReplyChannel {
    /// Open the channel on the valve and wire up envelope handling.
    pub fn attach(valve: &Valve, channel_id: u16, bus: Arc<dyn EventBus>) -> Result<Arc<Self>> {
        let shared = Arc::new(ReplyShared {
            bus,
            remote: valve.remote(),
            channel_id,
            pending: Mutex::new(HashMap::new()),
        });

        let handler_shared = Arc::clone(&shared);
        let message = MessageChannel::attach(
            valve,
            channel_id,
            Box::new(move |payload| handler_shared.on_envelope(payload)),
        )?;

        Ok(Arc::new(Self { message, shared }))
    }

    pub fn channel_id(&self) -> u16 {
        self.message.channel_id()
    }

    /// Send a request and block until its reply arrives.
    ///
    /// The request id is the lowest integer not currently pending;
    /// reuse skips every outstanding id, not just the last one used. On
    /// timeout the pending id is abandoned and a late reply is dropped.
    pub fn request(&self, parts: &[&[u8]], timeout: Option<Duration>) -> Result<Vec<Bytes>> {
        let (id, slot) = self.shared.register();

        let envelope = encode_envelope(id, false, parts);
        if let Err(err) = self.message.send(&envelope) {
            self.shared.abandon(id);
            return Err(err);
        }
        trace!(channel = self.channel_id(), id, "request sent");

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut result = slot
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(parts) = result.take() {
                self.shared.abandon(id);
                return Ok(parts);
            }
            result = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(result);
                        self.shared.abandon(id);
                        return Err(FrameError::Timeout(timeout.unwrap_or_default()));
                    }
                    let (guard, _) = slot
                        .ready
                        .wait_timeout(result, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard
                }
                None => slot
                    .ready
                    .wait(result)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    /// Answer an inbound request. No correlation bookkeeping.
    pub fn reply(&self, id: i32, parts: &[&[u8]]) -> Result<()> {
        let envelope = encode_envelope(id, true, parts);
        trace!(channel = self.channel_id(), id, "reply sent");
        self.message.send(&envelope)
    }

    #[cfg(test)]
    fn pending_ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .shared
            .pending
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl ReplyShared {
    fn register(&self) -> (i32, Arc<ReplySlot>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut id = 0i32;
        while pending.contains_key(&id) {
            id += 1;
        }
        let slot = Arc::new(ReplySlot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        pending.insert(id, Arc::clone(&slot));
        (id, slot)
    }

    fn abandon(&self, id: i32) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }

    fn on_envelope(&self, payload: Bytes) {
        let (id, is_reply, parts) = match decode_envelope(&payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(channel = self.channel_id, %err, "dropping malformed envelope");
                return;
            }
        };

        if is_reply {
            let slot = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&id)
                .cloned();
            match slot {
                Some(slot) => {
                    *slot
                        .result
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(parts);
                    slot.ready.notify_all();
                }
                None => {
                    trace!(channel = self.channel_id, id, "unmatched reply dropped");
                }
            }
        } else {
            self.bus.publish(NetEvent::RequestReceived {
                remote: self.remote,
                channel: self.channel_id,
                request_id: id,
                payload: parts,
            });
        }
    }
}

/// Envelope wire shape:
/// `[i32 id][u8 flags][u16 count][count × (u32 len, bytes)]`.
fn encode_envelope(id: i32, is_reply: bool, parts: &[&[u8]]) -> BytesMut {
    let total: usize = parts.iter().map(|part| 4 + part.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + 1 + 2 + total);
    buf.put_i32(id);
    buf.put_u8(if is_reply { FLAG_REPLY } else { 0 });
    buf.put_u16(parts.len() as u16);
    for part in parts {
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }
    buf
}

fn decode_envelope(payload: &Bytes) -> Result<(i32, bool, Vec<Bytes>)> {
    if payload.len() < 7 {
        return Err(FrameError::MalformedEnvelope("truncated header"));
    }
    let id = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let is_reply = payload[4] & FLAG_REPLY != 0;
    let count = u16::from_be_bytes([payload[5], payload[6]]) as usize;

    let mut parts = Vec::with_capacity(count);
    let mut offset = 7usize;
    for _ in 0..count {
        if payload.len() < offset + 4 {
            return Err(FrameError::MalformedEnvelope("truncated part length"));
        }
        let len = u32::from_be_bytes([
            payload[offset],
            payload[offset + 1],
            payload[offset + 2],
            payload[offset + 3],
        ]) as usize;
        offset += 4;
        if payload.len() < offset + len {
            return Err(FrameError::MalformedEnvelope("truncated part"));
        }
        parts.push(payload.slice(offset..offset + len));
        offset += len;
    }
    if offset != payload.len() {
        return Err(FrameError::MalformedEnvelope("trailing bytes"));
    }
    Ok((id, is_reply, parts))
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    use netmux_transport::Pipeline;

    use super::*;
    use crate::events::NullBus;

    /// Bus that forwards inbound requests over an mpsc channel.
    struct RequestBus {
        tx: Mutex<mpsc::Sender<(i32, Vec<Bytes>)>>,
    }

    impl RequestBus {
        fn new() -> (Arc<Self>, mpsc::Receiver<(i32, Vec<Bytes>)>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self { tx: Mutex::new(tx) }), rx)
        }
    }

    impl EventBus for RequestBus {
        fn publish(&self, event: NetEvent) {
            if let NetEvent::RequestReceived {
                request_id, payload, ..
            } = event
            {
                let _ = self.tx.lock().unwrap().send((request_id, payload));
            }
        }
    }

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
            Arc::new(Valve::new(a, 256, Arc::new(NullBus)).unwrap()),
            Arc::new(Valve::new(b, 256, Arc::new(NullBus)).unwrap()),
        )
    }

    fn pump(valve: &Valve) {
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

    /// Keep both valves pumped from a background thread while blocking
    /// calls run on the test threads.
    fn background_pump(valves: Vec<Arc<Valve>>) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            for valve in &valves {
                pump(valve);
            }
            match stop_rx.recv_timeout(Duration::from_millis(1)) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });
        (stop_tx, handle)
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = encode_envelope(7, true, &[b"alpha", b"", b"beta"]);
        let (id, is_reply, parts) = decode_envelope(&envelope.freeze()).unwrap();

        assert_eq!(id, 7);
        assert!(is_reply);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_ref(), b"alpha");
        assert!(parts[1].is_empty());
        assert_eq!(parts[2].as_ref(), b"beta");
    }

    #[test]
    fn malformed_envelope_rejected() {
        let short = Bytes::from_static(&[0, 0, 0]);
        assert!(matches!(
            decode_envelope(&short),
            Err(FrameError::MalformedEnvelope(_))
        ));

        let mut truncated = encode_envelope(1, false, &[b"data"]);
        truncated.truncate(truncated.len() - 2);
        assert!(matches!(
            decode_envelope(&truncated.freeze()),
            Err(FrameError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn request_receives_matching_reply() {
        let (va, vb) = valve_pair();
        let requester = ReplyChannel::attach(&va, 5, Arc::new(NullBus)).unwrap();

        let (bus, inbound) = RequestBus::new();
        let responder = ReplyChannel::attach(&vb, 5, bus).unwrap();

        let (stop, pumping) = background_pump(vec![Arc::clone(&va), Arc::clone(&vb)]);

        let caller = {
            let requester = Arc::clone(&requester);
            thread::spawn(move || requester.request(&[b"ping"], Some(Duration::from_secs(2))))
        };

        let (id, payload) = inbound.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].as_ref(), b"ping");
        responder.reply(id, &[b"pong"]).unwrap();

        let reply = caller.join().unwrap().unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].as_ref(), b"pong");

        let _ = stop.send(());
        pumping.join().unwrap();
    }

    #[test]
    fn unmatched_reply_is_dropped() {
        let (va, vb) = valve_pair();
        let requester = ReplyChannel::attach(&va, 2, Arc::new(NullBus)).unwrap();
        let responder = ReplyChannel::attach(&vb, 2, Arc::new(NullBus)).unwrap();

        // Nothing is pending for id 42; the reply must vanish quietly.
        responder.reply(42, &[b"stray"]).unwrap();
        pump(&va);

        assert!(requester.pending_ids().is_empty());
    }

    #[test]
    fn request_times_out_and_abandons_id() {
        let (va, _vb) = valve_pair();
        let requester = ReplyChannel::attach(&va, 4, Arc::new(NullBus)).unwrap();

        let err = requester
            .request(&[b"void"], Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, FrameError::Timeout(_)));
        assert!(requester.pending_ids().is_empty());
    }

    #[test]
    fn id_allocation_skips_all_pending_ids() {
        let (va, _vb) = valve_pair();
        let channel = ReplyChannel::attach(&va, 6, Arc::new(NullBus)).unwrap();

        let (id_a, _slot_a) = channel.shared.register();
        let (id_b, _slot_b) = channel.shared.register();
        assert_eq!((id_a, id_b), (0, 1));

        // Completing A frees id 0; the next request takes 0, never 2.
        channel.shared.abandon(id_a);
        let (id_c, _slot_c) = channel.shared.register();
        assert_eq!(id_c, 0);
        assert_eq!(channel.pending_ids(), vec![0, 1]);
    }

    #[test]
    fn concurrent_requests_each_get_their_own_reply() {
        let (va, vb) = valve_pair();
        let requester = ReplyChannel::attach(&va, 9, Arc::new(NullBus)).unwrap();

        let (bus, inbound) = RequestBus::new();
        let responder = ReplyChannel::attach(&vb, 9, bus).unwrap();

        let (stop, pumping) = background_pump(vec![Arc::clone(&va), Arc::clone(&vb)]);

        let mut callers = Vec::new();
        for i in 0..4u8 {
            let requester = Arc::clone(&requester);
            callers.push(thread::spawn(move || {
                let payload = vec![i; 3];
                let reply = requester
                    .request(&[&payload], Some(Duration::from_secs(3)))
                    .unwrap();
                (payload, reply)
            }));
        }

        // Collect all four requests, then answer them in reverse order.
        let mut requests = Vec::new();
        for _ in 0..4 {
            requests.push(inbound.recv_timeout(Duration::from_secs(3)).unwrap());
        }
        requests.reverse();
        for (id, payload) in &requests {
            let parts: Vec<&[u8]> = payload.iter().map(|p| p.as_ref()).collect();
            responder.reply(*id, &parts).unwrap();
        }

        for caller in callers {
            let (sent, reply) = caller.join().unwrap();
            assert_eq!(reply.len(), 1);
            assert_eq!(reply[0].as_ref(), sent.as_slice());
        }

        let _ = stop.send(());
        pumping.join().unwrap();
    }
}
