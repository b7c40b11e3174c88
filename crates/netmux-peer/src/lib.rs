//! Connection lifecycle for netmux: accept or open raw connections,
//! perform the passphrase handshake, wire a [`netmux_frame::Valve`] and
//! keep it alive with periodic ping/timeout tasks.
//!
//! All I/O and housekeeping runs on a [`netmux_sched::WorkerBoss`]
//! injected by the caller: no thread per connection, no global state.

pub mod banlist;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod server;

pub use banlist::BanList;
pub use client::Client;
pub use config::Config;
pub use error::{PeerError, Result};
pub use handshake::{HandshakeHandler, HANDSHAKE_CHANNEL};
pub use server::Server;
