use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::channel::{InputChannel, OutputChannel};
use crate::error::Result;
use crate::valve::{Valve, ValveObserver};

/// Called with every complete, decoded message payload.
pub type MessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Length-prefixed messages over one channel.
///
/// `send` writes `[u32 length][payload]` and flushes, so one message is
/// one packet batch. On the receive side the channel registers itself as
/// the valve observer: a package start carries the length prefix, the
/// following packets are accumulated until exactly that many bytes have
/// arrived, then the handler runs with the complete payload.
pub struct MessageChannel {
    channel_id: u16,
    input: Arc<InputChannel>,
    output: Arc<OutputChannel>,
    rx: Mutex<Option<PendingMessage>>,
    handler: MessageHandler,
}

struct PendingMessage {
    buf: BytesMut,
    expect: usize,
}

impl MessageChannel {
    /// Open the channel on the valve and register as its observer.
    pub fn attach(valve: &Valve, channel_id: u16, handler: MessageHandler) -> Result<Arc<Self>> {
        let (input, output) = valve.open_channel(channel_id)?;
        let channel = Arc::new(Self {
            channel_id,
            input,
            output,
            rx: Mutex::new(None),
            handler,
        });
        valve.set_observer(channel_id, Arc::clone(&channel) as Arc<dyn ValveObserver>);
        Ok(channel)
    }

    /// Send one message: length prefix, payload, flush.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.output.write_u32(payload.len() as u32)?;
        self.output.write(payload)?;
        self.output.flush()
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    pub fn input(&self) -> &Arc<InputChannel> {
        &self.input
    }

    pub fn output(&self) -> &Arc<OutputChannel> {
        &self.output
    }

    fn drain(&self, pending: &mut PendingMessage) {
        let want = pending.expect - pending.buf.len();
        let take = want.min(self.input.available());
        if take > 0 {
            let mut chunk = vec![0u8; take];
            let read = self.input.read(&mut chunk);
            pending.buf.extend_from_slice(&chunk[..read]);
        }
    }
}

impl ValveObserver for MessageChannel {
    fn on_packet(&self, input: &Arc<InputChannel>, package_start: bool) {
        let mut rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if package_start {
            if rx.is_some() {
                warn!(
                    channel = self.channel_id,
                    "new message started before previous completed, dropping partial"
                );
            }
            if input.available() < 4 {
                warn!(channel = self.channel_id, "message start without length prefix");
                *rx = None;
                return;
            }
            match input.read_u32(Some(Duration::ZERO)) {
                Ok(length) => {
                    *rx = Some(PendingMessage {
                        buf: BytesMut::with_capacity(length as usize),
                        expect: length as usize,
                    });
                }
                Err(err) => {
                    warn!(channel = self.channel_id, %err, "failed to read message length");
                    *rx = None;
                    return;
                }
            }
        }

        let complete = match rx.as_mut() {
            Some(pending) => {
                self.drain(pending);
                pending.buf.len() == pending.expect
            }
            None => false,
        };

        if complete {
            let payload = rx.take().map(|pending| pending.buf.freeze());
            drop(rx);
            if let Some(payload) = payload {
                (self.handler)(payload);
            }
        }
    }
}
