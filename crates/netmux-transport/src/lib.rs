//! Framed byte pipeline over a single raw connection.
//!
//! A [`Pipeline`] owns exactly one OS-level connection handle (TCP stream
//! or UDP peer pair) and frames every outgoing block with a 4-byte
//! big-endian length prefix. This is the lowest layer of netmux.
//! Everything else builds on top of the [`Pipeline`] type provided here.

pub mod error;
pub mod pipeline;

pub use error::{Result, TransportError};
pub use pipeline::{ConnectionKind, Pipeline, LENGTH_PREFIX_SIZE, MAX_DATAGRAM_PAYLOAD};
