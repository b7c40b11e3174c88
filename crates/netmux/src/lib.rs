//! Multiplexed channel transport over TCP/UDP with a cooperative
//! scheduler.
//!
//! netmux splits one connection into many logical channels, layers
//! length-framed messages and request/reply correlation on top, and
//! drives all I/O from a fixed pool of priority-scheduled workers.
//!
//! # Crate structure
//!
//! - [`transport`] — framed byte pipeline over one TCP/UDP connection
//! - [`frame`] — ring buffers, channels, valve, message/reply layers
//! - [`sched`] — cooperative worker/group/task scheduler
//! - [`peer`] — server and client lifecycle, handshake, ban list

/// Re-export transport types.
pub mod transport {
    pub use netmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use netmux_frame::*;
}

/// Re-export scheduler types.
pub mod sched {
    pub use netmux_sched::*;
}

/// Re-export peer types.
pub mod peer {
    pub use netmux_peer::*;
}
