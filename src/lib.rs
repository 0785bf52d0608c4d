//! POSIX-socket-like byte and datagram transport over an RPMsg message bus.
//!
//! RPMsg links software running on distinct cores of one SoC through named
//! endpoints carrying fixed-size message frames. This crate layers reliable,
//! ordered, flow-controlled `Stream` and `Dgram` sockets on top of that
//! primitive: connect/accept semantics via the RPMsg name service, a
//! SYNC/DATA framing protocol, credit-based flow control sized by the
//! receiver's ring capacity, non-blocking mode, poll readiness and clean
//! teardown when either core disappears.
//!
//! The crate performs no bus I/O itself. The RPMsg device is reached through
//! the object-safe traits in [`bus`]; production integrations implement them
//! over their platform's RPMsg stack, and the test suite drives the sockets
//! over an in-memory loopback fabric.

use std::fmt;

mod address;
pub mod bus;
mod coding;
mod config;
mod connection;
mod error;
mod frame;
mod poll;
mod ring;
mod socket;
mod sync;

pub use crate::address::{RpmsgAddr, AF_RPMSG, CPU_SIZE, NAME_SIZE};
pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::frame::UCred;
pub use crate::poll::{PollEvents, PollFd};
pub use crate::socket::{
    IoctlValue, MsgFlags, RpmsgSocket, SockCaps, SockOpt, FIOC_FILEPATH, FIONREAD, FIONSPACE,
    SOL_SOCKET, SO_PEERCRED,
};

/// Prefix shared by every RPMsg endpoint name this transport creates
pub const NAME_PREFIX: &str = "sk:";

/// Maximum length of the `:<hex>` suffix appended to client endpoint names
pub(crate) const NAME_ID_LEN: usize = 13;

/// Capacity of an RPMsg endpoint name on the bus, including the terminator
pub(crate) const RPMSG_NAME_SIZE: usize = 32;

// The prefix and the connection-id suffix must leave room for a logical name.
const _: () = assert!(NAME_PREFIX.len() + NAME_ID_LEN < RPMSG_NAME_SIZE);

/// Whether a socket carries a byte stream or whole datagrams
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SocketType {
    /// Ordered byte stream; sends may be split across frames
    Stream,
    /// Whole datagrams, delivered in order, one per frame
    Dgram,
}

impl SocketType {
    #[inline]
    pub fn is_stream(self) -> bool {
        self == SocketType::Stream
    }

    #[inline]
    pub fn is_dgram(self) -> bool {
        self == SocketType::Dgram
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SocketType::Stream => "stream",
            SocketType::Dgram => "dgram",
        })
    }
}
