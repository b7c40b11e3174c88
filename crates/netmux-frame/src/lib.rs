//! Channel multiplexing over one pipeline.
//!
//! This is the core value-add layer of netmux. A [`Valve`] splits a single
//! [`netmux_transport::Pipeline`] into many logical channels, each with an
//! ordered, reassembled byte stream. [`MessageChannel`] layers
//! length-prefixed messages on a channel; [`ReplyChannel`] adds request-id
//! correlation for synchronous calls.
//!
//! Every packet on the wire carries:
//! - a 2-byte channel id for routing
//! - a 2-byte sequence used for loss detection and reassembly
//! - a 4-byte payload length
//!
//! No partial reads, no buffer management in user code.

pub mod channel;
pub mod codec;
pub mod error;
pub mod events;
pub mod message;
pub mod reply;
pub mod ring;
pub mod valve;

pub use channel::{InputChannel, OutputChannel};
pub use codec::{decode_packet_header, encode_packet_header, PacketHeader, PACKET_HEADER_SIZE};
pub use error::{FrameError, Result};
pub use events::{DisconnectCause, EventBus, NetEvent, NullBus};
pub use message::{MessageChannel, MessageHandler};
pub use reply::ReplyChannel;
pub use ring::RingBuffer;
pub use valve::{Valve, ValveObserver};
