use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bytes::BytesMut;
use netmux_transport::Pipeline;
use tracing::{debug, trace, warn};

use crate::channel::{InputChannel, OutputChannel};
use crate::codec::decode_block;
use crate::error::{FrameError, Result};
use crate::events::{EventBus, NetEvent};

/// Per-channel packet notification hook.
///
/// Message-layer channels register themselves so they learn about
/// completed packets without a trip through the event bus.
pub trait ValveObserver: Send + Sync {
    fn on_packet(&self, input: &Arc<InputChannel>, package_start: bool);
}

/// Per-connection demultiplexer owning all logical channels for one
/// pipeline.
///
/// Inbound framed packets are routed by channel id to the right
/// [`InputChannel`]; [`update_outputs`] pumps every [`OutputChannel`]
/// through the shared pipeline. Centralizing the demultiplexing here
/// keeps channel implementations ignorant of framing, so handshake,
/// auth and data channels share one socket.
///
/// [`update_outputs`]: Valve::update_outputs
pub struct Valve {
    pipeline: Arc<Pipeline>,
    bus: Arc<dyn EventBus>,
    remote: SocketAddr,
    buffer_capacity: usize,
    staging: Mutex<BytesMut>,
    channels: RwLock<HashMap<u16, ChannelPair>>,
    observers: RwLock<HashMap<u16, Arc<dyn ValveObserver>>>,
    last_reception: Mutex<Instant>,
}

#[derive(Clone)]
struct ChannelPair {
    input: Arc<InputChannel>,
    output: Arc<OutputChannel>,
}

impl Valve {
    pub fn new(
        pipeline: Arc<Pipeline>,
        buffer_capacity: usize,
        bus: Arc<dyn EventBus>,
    ) -> Result<Self> {
        let remote = pipeline.peer_addr()?;
        Ok(Self {
            pipeline,
            bus,
            remote,
            buffer_capacity,
            staging: Mutex::new(BytesMut::with_capacity(buffer_capacity)),
            channels: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            last_reception: Mutex::new(Instant::now()),
        })
    }

    /// Feed raw bytes from the wire and route every completed packet.
    ///
    /// Bytes are staged until a full `[u32 length][body]` block is
    /// present; the block's leading `u16` selects the channel, which is
    /// created on first use unless the event bus vetoes it (the packet
    /// is then dropped).
    pub fn update_inputs(&self, data: &[u8]) -> Result<()> {
        let mut staging = self
            .staging
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        staging.extend_from_slice(data);

        // A corrupt length prefix would pin the staging buffer forever;
        // cap blocks well above any legal packet.
        let max_block = self.buffer_capacity * 4;

        loop {
            let block = match decode_block(&mut staging, max_block) {
                Ok(Some(block)) => block,
                Ok(None) => break,
                Err(err) => {
                    warn!(remote = %self.remote, %err, "corrupt inbound framing, resetting");
                    staging.clear();
                    return Err(err);
                }
            };

            if block.len() < 2 {
                warn!(remote = %self.remote, len = block.len(), "runt packet, dropping");
                continue;
            }
            let channel = u16::from_be_bytes([block[0], block[1]]);

            let pair = match self.get_or_open(channel) {
                Ok(pair) => pair,
                Err(FrameError::ChannelVetoed(id)) => {
                    debug!(channel = id, "channel creation vetoed, packet dropped");
                    continue;
                }
                Err(err) => return Err(err),
            };

            pair.input.process(&block[2..]);
            *self
                .last_reception
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();

            let package_start = pair.input.is_package_start();
            trace!(remote = %self.remote, channel, package_start, "packet received");

            let observer = self
                .observers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&channel)
                .cloned();
            match observer {
                Some(observer) => observer.on_packet(&pair.input, package_start),
                None => self.bus.publish(NetEvent::DataReceived {
                    remote: self.remote,
                    channel,
                    package_start,
                }),
            }
        }
        Ok(())
    }

    /// Pump every output channel's buffered data through the pipeline.
    pub fn update_outputs(&self) -> Result<()> {
        let outputs: Vec<Arc<OutputChannel>> = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|pair| Arc::clone(&pair.output))
            .collect();

        for output in outputs {
            output.pump()?;
        }
        Ok(())
    }

    /// Open a channel pair, subject to the event bus veto. Opening an
    /// existing channel returns the existing pair.
    pub fn open_channel(&self, id: u16) -> Result<(Arc<InputChannel>, Arc<OutputChannel>)> {
        let pair = self.get_or_open(id)?;
        Ok((pair.input, pair.output))
    }

    fn get_or_open(&self, id: u16) -> Result<ChannelPair> {
        if let Some(pair) = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
        {
            return Ok(pair.clone());
        }

        if !self.bus.allow_channel(id) {
            return Err(FrameError::ChannelVetoed(id));
        }

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Another thread may have opened it between the locks.
        let pair = channels.entry(id).or_insert_with(|| {
            debug!(remote = %self.remote, channel = id, "channel opened");
            ChannelPair {
                input: Arc::new(InputChannel::new(id, self.buffer_capacity)),
                output: Arc::new(OutputChannel::new(
                    id,
                    self.buffer_capacity,
                    Arc::clone(&self.pipeline),
                )),
            }
        });
        Ok(pair.clone())
    }

    /// The lowest channel id not currently in use.
    pub fn next_channel(&self) -> u16 {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut id = 0u16;
        while channels.contains_key(&id) {
            id += 1;
        }
        id
    }

    /// Remove a channel. The id only comes back via an explicit
    /// re-open.
    pub fn close_channel(&self, id: u16) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if let Some(pair) = removed {
            pair.input.close();
            debug!(remote = %self.remote, channel = id, "channel closed");
        }
    }

    pub fn input(&self, id: u16) -> Option<Arc<InputChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .map(|pair| Arc::clone(&pair.input))
    }

    pub fn output(&self, id: u16) -> Option<Arc<OutputChannel>> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .map(|pair| Arc::clone(&pair.output))
    }

    pub fn set_observer(&self, channel: u16, observer: Arc<dyn ValveObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(channel, observer);
    }

    pub fn clear_observer(&self, channel: u16) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&channel);
    }

    /// When the last completed packet arrived; drives liveness checks.
    pub fn last_reception(&self) -> Instant {
        *self
            .last_reception
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Maximum packet payload; also sizes per-channel buffers.
    pub fn network_buffer_size(&self) -> usize {
        self.buffer_capacity
    }

    /// Close the pipeline and every channel buffer.
    pub fn stop(&self) {
        self.pipeline.close();
        let channels = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for pair in channels.values() {
            pair.input.close();
        }
        debug!(remote = %self.remote, "valve stopped");
    }
}

impl std::fmt::Debug for Valve {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Valve")
            .field("remote", &self.remote)
            .field(
                "channels",
                &self
                    .channels
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use super::*;
    use crate::events::NullBus;

    struct RecordingBus {
        events: Mutex<Vec<NetEvent>>,
        vetoed: Option<u16>,
    }

    impl RecordingBus {
        fn new(vetoed: Option<u16>) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                vetoed,
            }
        }

        fn events(&self) -> Vec<NetEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventBus for RecordingBus {
        fn publish(&self, event: NetEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn allow_channel(&self, channel: u16) -> bool {
            self.vetoed != Some(channel)
        }
    }

    fn tcp_valve(bus: Arc<dyn EventBus>) -> (Valve, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        let valve = Valve::new(Arc::new(Pipeline::tcp(client)), 1024, bus).unwrap();
        (valve, server)
    }

    fn wire_block(channel: u16, batch_index: u16, payload: &[u8]) -> Vec<u8> {
        let body_len = 2 + 2 + 4 + payload.len();
        let mut block = Vec::with_capacity(4 + body_len);
        block.extend_from_slice(&(body_len as u32).to_be_bytes());
        block.extend_from_slice(&channel.to_be_bytes());
        block.extend_from_slice(&batch_index.to_be_bytes());
        block.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        block.extend_from_slice(payload);
        block
    }

    #[test]
    fn routes_packets_by_channel_id() {
        let (valve, _peer) = tcp_valve(Arc::new(NullBus));

        let mut wire = wire_block(2, 1, b"two");
        wire.extend_from_slice(&wire_block(9, 1, b"nine"));
        valve.update_inputs(&wire).unwrap();

        let mut out = [0u8; 4];
        let two = valve.input(2).unwrap();
        two.read_exact(&mut out[..3], Some(Duration::from_millis(10))).unwrap();
        assert_eq!(&out[..3], b"two");

        let nine = valve.input(9).unwrap();
        nine.read_exact(&mut out, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(&out, b"nine");
    }

    #[test]
    fn partial_frames_stay_staged() {
        let (valve, _peer) = tcp_valve(Arc::new(NullBus));
        let wire = wire_block(4, 1, b"drip");

        // Deliver one byte at a time; nothing routes until complete.
        for &byte in &wire[..wire.len() - 1] {
            valve.update_inputs(&[byte]).unwrap();
        }
        assert!(valve.input(4).is_none());

        valve.update_inputs(&[wire[wire.len() - 1]]).unwrap();
        let input = valve.input(4).unwrap();
        assert_eq!(input.available(), 4);
    }

    #[test]
    fn vetoed_channel_is_dropped() {
        let bus = Arc::new(RecordingBus::new(Some(13)));
        let (valve, _peer) = tcp_valve(bus.clone() as Arc<dyn EventBus>);

        valve.update_inputs(&wire_block(13, 1, b"nope")).unwrap();
        assert!(valve.input(13).is_none());

        valve.update_inputs(&wire_block(6, 1, b"yes")).unwrap();
        assert!(valve.input(6).is_some());
    }

    #[test]
    fn publishes_data_received_for_unobserved_channels() {
        let bus = Arc::new(RecordingBus::new(None));
        let (valve, _peer) = tcp_valve(bus.clone() as Arc<dyn EventBus>);
        let remote = valve.remote();

        valve.update_inputs(&wire_block(5, 1, b"ping")).unwrap();

        let events = bus.events();
        assert_eq!(
            events,
            vec![NetEvent::DataReceived {
                remote,
                channel: 5,
                package_start: true,
            }]
        );
    }

    #[test]
    fn observer_replaces_event_publication() {
        struct CountingObserver(Mutex<usize>);
        impl ValveObserver for CountingObserver {
            fn on_packet(&self, _input: &Arc<InputChannel>, _package_start: bool) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let bus = Arc::new(RecordingBus::new(None));
        let (valve, _peer) = tcp_valve(bus.clone() as Arc<dyn EventBus>);

        let observer = Arc::new(CountingObserver(Mutex::new(0)));
        valve.open_channel(3).unwrap();
        valve.set_observer(3, observer.clone());

        valve.update_inputs(&wire_block(3, 1, b"seen")).unwrap();

        assert_eq!(*observer.0.lock().unwrap(), 1);
        assert!(bus.events().is_empty());
    }

    #[test]
    fn update_outputs_pumps_all_channels() {
        use std::io::Read;

        let (valve, mut peer) = tcp_valve(Arc::new(NullBus));
        let (_, out_a) = valve.open_channel(1).unwrap();
        let (_, out_b) = valve.open_channel(2).unwrap();

        out_a.write(b"aa").unwrap();
        out_b.write(b"bb").unwrap();
        valve.update_outputs().unwrap();

        // Two packets of 2 bytes each: 2 × (4 outer + 8 header + 2).
        let mut wire = [0u8; 28];
        peer.read_exact(&mut wire).unwrap();
    }

    #[test]
    fn next_channel_returns_lowest_unused() {
        let (valve, _peer) = tcp_valve(Arc::new(NullBus));
        assert_eq!(valve.next_channel(), 0);

        valve.open_channel(0).unwrap();
        valve.open_channel(1).unwrap();
        valve.open_channel(3).unwrap();
        assert_eq!(valve.next_channel(), 2);
    }

    #[test]
    fn closed_channel_requires_explicit_reopen() {
        let (valve, _peer) = tcp_valve(Arc::new(NullBus));
        valve.open_channel(5).unwrap();
        valve.close_channel(5);
        assert!(valve.input(5).is_none());

        valve.open_channel(5).unwrap();
        assert!(valve.input(5).is_some());
    }

    #[test]
    fn corrupt_length_prefix_is_an_error() {
        let (valve, _peer) = tcp_valve(Arc::new(NullBus));
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        wire.extend_from_slice(&[0u8; 16]);

        let err = valve.update_inputs(&wire).unwrap_err();
        assert!(matches!(err, FrameError::BufferOverflow { .. }));
    }
}
