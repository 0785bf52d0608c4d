//! The socket operation surface consumed by the dispatcher.
//!
//! A [`RpmsgSocket`] is a handle on a connection. Handles may be duplicated
//! with [`RpmsgSocket::try_clone`]; the connection tears down when the last
//! handle closes. Dropping a handle closes it implicitly.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::RpmsgAddr;
use crate::bus::Bus;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::Error;
use crate::frame::UCred;
use crate::poll::PollFd;
use crate::SocketType;

/// Per-call message flags
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MsgFlags(u32);

impl MsgFlags {
    /// Make this one call non-blocking regardless of the socket flag
    pub const DONTWAIT: MsgFlags = MsgFlags(0x1);

    pub const fn empty() -> Self {
        MsgFlags(0)
    }

    pub const fn contains(self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MsgFlags {
    type Output = MsgFlags;
    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

/// Capabilities reported to the dispatcher
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct SockCaps(u32);

impl SockCaps {
    /// The socket honors the non-blocking flag
    pub const NONBLOCKING: SockCaps = SockCaps(0x1);

    pub const fn contains(self, other: SockCaps) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Ioctl: bytes buffered in the receive ring
pub const FIONREAD: u32 = 1;
/// Ioctl: current send credit
pub const FIONSPACE: u32 = 2;
/// Ioctl: printable connection path
pub const FIOC_FILEPATH: u32 = 3;

/// Result of an [`RpmsgSocket::ioctl`] call
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IoctlValue {
    /// `FIONREAD`: bytes available to read
    Available(u32),
    /// `FIONSPACE`: send credit in bytes
    Space(u32),
    /// `FIOC_FILEPATH`: printable path, e.g. `rpmsg:[cpuA<->cpuB:[echo:1f]]`
    FilePath(String),
}

/// Socket-level option namespace
pub const SOL_SOCKET: u32 = 1;
/// Peer credentials captured from the connection handshake
pub const SO_PEERCRED: u32 = 17;

/// Result of an [`RpmsgSocket::getsockopt`] call
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SockOpt {
    PeerCred(UCred),
}

/// A stream or datagram socket over the RPMsg bus
pub struct RpmsgSocket {
    conn: Arc<Connection>,
    closed: AtomicBool,
}

impl RpmsgSocket {
    /// Create an unbound socket on `bus`
    pub fn new(bus: Arc<dyn Bus>, socket_type: SocketType, config: Config) -> Self {
        RpmsgSocket {
            conn: Connection::new(bus, socket_type, config),
            closed: AtomicBool::new(false),
        }
    }

    fn accepted(conn: Arc<Connection>) -> Self {
        RpmsgSocket {
            conn,
            closed: AtomicBool::new(false),
        }
    }

    pub fn socket_type(&self) -> SocketType {
        self.conn.socket_type()
    }

    /// Capabilities of this socket implementation
    pub fn sockcaps(&self) -> SockCaps {
        SockCaps::NONBLOCKING
    }

    /// Duplicate the handle; both handles refer to the same connection
    pub fn try_clone(&self) -> RpmsgSocket {
        self.conn.addref();
        RpmsgSocket {
            conn: self.conn.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Record the local address. Required before `listen`; a bound datagram
    /// socket connects implicitly on first receive.
    pub fn bind(&self, addr: &RpmsgAddr) -> Result<(), Error> {
        self.conn.bind(addr)
    }

    /// The bound or connected name, with the CPU field naming the local CPU
    pub fn local_addr(&self) -> RpmsgAddr {
        self.conn.local_addr()
    }

    /// The remote address, including any client name suffix
    pub fn peer_addr(&self) -> RpmsgAddr {
        self.conn.peer_addr()
    }

    /// Start accepting connections to the bound name. Stream sockets only;
    /// `backlog` must be non-zero.
    pub fn listen(&self, backlog: usize) -> Result<(), Error> {
        self.conn.listen(backlog)
    }

    /// Connect to a remote named endpoint.
    ///
    /// Blocks until the peer's SYNC arrives, bounded by the receive timeout.
    /// Non-blocking sockets return [`Error::InProgress`] and become writable
    /// once connected.
    pub fn connect(&self, addr: &RpmsgAddr) -> Result<(), Error> {
        self.conn.connect(addr)
    }

    /// Take the next queued connection, waiting unless non-blocking
    pub fn accept(&self) -> Result<(RpmsgSocket, RpmsgAddr), Error> {
        let (conn, addr) = self.conn.accept()?;
        Ok((RpmsgSocket::accepted(conn), addr))
    }

    /// Register a poll waiter and immediately report current readiness
    pub fn poll_setup(&self, fd: &Arc<PollFd>) -> Result<(), Error> {
        self.conn.poll_setup(fd)
    }

    /// Remove a previously registered poll waiter
    pub fn poll_remove(&self, fd: &Arc<PollFd>) {
        self.conn.poll_remove(fd)
    }

    /// Gathering send.
    ///
    /// An unconnected socket with a destination connects first. Stream
    /// sockets may report a short write under back-pressure; datagram sends
    /// are all-or-nothing and fail with [`Error::MessageTooBig`] if the
    /// datagram cannot fit the peer's window.
    pub fn send_msg(
        &self,
        bufs: &[&[u8]],
        to: Option<&RpmsgAddr>,
        flags: MsgFlags,
    ) -> Result<usize, Error> {
        self.conn
            .send_msg(bufs, to, flags.contains(MsgFlags::DONTWAIT))
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize, Error> {
        self.send_msg(&[buf], None, MsgFlags::empty())
    }

    pub fn send_to(&self, buf: &[u8], to: &RpmsgAddr) -> Result<usize, Error> {
        self.send_msg(&[buf], Some(to), MsgFlags::empty())
    }

    /// Receive into `buf`, returning the byte count and the peer address.
    ///
    /// Only a single buffer is serviced per call. Streams return any buffered
    /// prefix; datagrams are delivered whole, silently truncated to `buf` if
    /// larger. A zero count with no address is end-of-stream: the peer is
    /// gone and the ring is drained.
    pub fn recv_msg(
        &self,
        buf: &mut [u8],
        flags: MsgFlags,
    ) -> Result<(usize, Option<RpmsgAddr>), Error> {
        self.conn.recv_msg(buf, flags.contains(MsgFlags::DONTWAIT))
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.recv_msg(buf, MsgFlags::empty()).map(|(n, _)| n)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.conn.set_nonblocking(nonblocking)
    }

    /// Bound for blocking receive and connect waits; `None` waits forever
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_recv_timeout(timeout)
    }

    /// Bound for blocking send waits; `None` waits forever
    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_send_timeout(timeout)
    }

    /// Socket ioctls; unknown commands fail with [`Error::UnknownIoctl`].
    ///
    /// Command numbers are crate-local; the embedding dispatcher maps its
    /// native ioctl numbers onto them.
    pub fn ioctl(&self, cmd: u32) -> Result<IoctlValue, Error> {
        match cmd {
            FIONREAD => Ok(IoctlValue::Available(self.conn.bytes_available())),
            FIONSPACE => Ok(IoctlValue::Space(self.conn.send_space())),
            FIOC_FILEPATH => Ok(IoctlValue::FilePath(self.conn.file_path())),
            _ => Err(Error::UnknownIoctl),
        }
    }

    /// Read a socket option; everything but `SO_PEERCRED` fails with
    /// [`Error::UnknownOption`]
    pub fn getsockopt(&self, level: u32, option: u32) -> Result<SockOpt, Error> {
        if level == SOL_SOCKET && option == SO_PEERCRED {
            return Ok(SockOpt::PeerCred(self.conn.peer_cred().unwrap_or_default()));
        }
        Err(Error::UnknownOption)
    }

    /// Peer credentials captured from the connection handshake
    pub fn peer_cred(&self) -> Option<UCred> {
        self.conn.peer_cred()
    }

    /// Close this handle. The connection tears down once every handle is
    /// closed, waking any blocked operation with a reset.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.conn.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for RpmsgSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RpmsgSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpmsgSocket")
            .field("type", &self.conn.socket_type())
            .field("path", &self.conn.file_path())
            .finish()
    }
}
