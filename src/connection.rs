//! The connection core: endpoint lifecycle, SYNC/DATA handling, credit-based
//! flow control, the accept pipeline and teardown.
//!
//! One `Connection` backs each open socket. Three kinds of runner touch it
//! concurrently: user threads inside socket operations, bus threads
//! delivering frames and name-service events, and whichever thread performs
//! teardown. The send half of flow control lives under `send`, the receive
//! half plus the accept queue under `recv`, and the poll table under `poll`.
//! Cross-path positions (`sendsize`, `recvpos`, `lastpos`) are atomics whose
//! writers are serialized by the owning lock, so the opposite path can read
//! them without taking it. Endpoint destruction is the only place both locks
//! are held, in `recv` → `send` order.

use std::cmp;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::address::RpmsgAddr;
use crate::bus::{Bus, BusError, BusHooks, Device, Endpoint, EndpointHandlers, ADDR_ANY};
use crate::config::Config;
use crate::error::Error;
use crate::frame::{DataHeader, Frame, SyncFrame, UCred, DATA_HEADER_SIZE, DGRAM_LEN_SIZE};
use crate::poll::{PollEvents, PollFd, PollTable};
use crate::ring::RingBuffer;
use crate::sync::WaitEvent;
use crate::{SocketType, NAME_ID_LEN, NAME_PREFIX, RPMSG_NAME_SIZE};

/// What a connection currently is to the socket layer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Role {
    /// Freshly created; no address yet
    Unbound,
    /// Connected (or connecting) to a remote named endpoint
    Client,
    /// Registered with the name service, parenting an accept queue
    Listener { backlog: usize },
    /// Listener torn down; pending accepts observe the reset
    ListenerClosed,
    /// Child of a listener, handed out by `accept`
    Accepted,
}

/// One-shot rendezvous between a blocked reader and the endpoint callback
#[derive(Debug)]
enum DirectSlot {
    /// A reader is blocked and will take up to `limit` bytes
    Armed { limit: usize },
    /// The callback delivered `data`; the reader copies it out on wake-up
    Filled { data: Bytes },
}

struct SendState {
    /// Bytes handed to the bus so far
    sendpos: u32,
    /// Bytes the peer has confirmed drained
    ackpos: u32,
}

struct RecvState {
    buf: RingBuffer,
    slot: Option<DirectSlot>,
    role: Role,
    /// Children awaiting accept; meaningful for listeners only
    queue: VecDeque<Arc<Connection>>,
    /// Peer credentials captured from SYNC
    cred: Option<UCred>,
}

struct AddrInfo {
    addr: Option<RpmsgAddr>,
    /// Client-side `:<hex>` endpoint-name suffix; empty for servers
    nameid: String,
}

struct Timeouts {
    recv: Option<Duration>,
    send: Option<Duration>,
}

pub(crate) struct Connection {
    bus: Arc<dyn Bus>,
    socket_type: SocketType,
    config: Config,
    me: Weak<Connection>,

    addr: Mutex<AddrInfo>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    poll: Mutex<PollTable>,
    ept: Mutex<Option<Arc<dyn Endpoint>>>,

    /// Peer's advertised window; zero until its SYNC arrives
    sendsize: AtomicU32,
    /// Bytes consumed from the local receive stream
    recvpos: AtomicU32,
    /// `recvpos` snapshot at the last credit refund
    lastpos: AtomicU32,
    connected: AtomicBool,
    bound: AtomicBool,
    unbind: AtomicBool,
    registered: AtomicBool,
    nonblocking: AtomicBool,
    crefs: AtomicUsize,

    sendsem: WaitEvent,
    recvsem: WaitEvent,
    timeouts: Mutex<Timeouts>,
}

impl Connection {
    pub(crate) fn new(bus: Arc<dyn Bus>, socket_type: SocketType, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|me| Connection {
            bus,
            socket_type,
            config,
            me: me.clone(),
            addr: Mutex::new(AddrInfo {
                addr: None,
                nameid: String::new(),
            }),
            send: Mutex::new(SendState {
                sendpos: 0,
                ackpos: 0,
            }),
            recv: Mutex::new(RecvState {
                buf: RingBuffer::new(),
                slot: None,
                role: Role::Unbound,
                queue: VecDeque::new(),
                cred: None,
            }),
            poll: Mutex::new(PollTable::new()),
            ept: Mutex::new(None),
            sendsize: AtomicU32::new(0),
            recvpos: AtomicU32::new(0),
            lastpos: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            unbind: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            nonblocking: AtomicBool::new(false),
            crefs: AtomicUsize::new(1),
            sendsem: WaitEvent::new(),
            recvsem: WaitEvent::new(),
            timeouts: Mutex::new(Timeouts {
                recv: None,
                send: None,
            }),
        })
    }

    pub(crate) fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub(crate) fn addref(&self) {
        self.crefs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub(crate) fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().unwrap().recv = timeout;
    }

    pub(crate) fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().unwrap().send = timeout;
    }

    fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        self.ept.lock().unwrap().clone()
    }

    /// Whether the channel can no longer carry traffic: the endpoint was
    /// never created, was destroyed, or the peer unbound its side
    fn endpoint_gone(&self) -> bool {
        self.unbind.load(Ordering::Acquire) || self.ept.lock().unwrap().is_none()
    }

    /// Available send credit; callers hold the send lock
    fn credit(&self, send: &SendState) -> u32 {
        let inflight = send.sendpos.wrapping_sub(send.ackpos);
        self.sendsize.load(Ordering::Acquire).wrapping_sub(inflight)
    }

    /// Current send credit, for readiness reporting
    pub(crate) fn send_space(&self) -> u32 {
        let send = self.send.lock().unwrap();
        self.credit(&send)
    }

    /// Bytes buffered in the receive ring, for readiness reporting
    pub(crate) fn bytes_available(&self) -> u32 {
        self.recv.lock().unwrap().buf.used() as u32
    }

    pub(crate) fn peer_cred(&self) -> Option<UCred> {
        self.recv.lock().unwrap().cred
    }

    fn poll_notify(&self, events: PollEvents) {
        self.poll.lock().unwrap().notify(events);
    }

    fn remote_addr(&self) -> Option<RpmsgAddr> {
        self.addr.lock().unwrap().addr.clone()
    }

    /// Address as reported by `getsockname`: the bound/connected name with
    /// the CPU field rewritten to the local CPU
    pub(crate) fn local_addr(&self) -> RpmsgAddr {
        let mut addr = self.remote_addr().unwrap_or_default();
        addr.set_cpu(self.bus.local_cpu());
        addr
    }

    /// Address as reported by `getpeername`
    pub(crate) fn peer_addr(&self) -> RpmsgAddr {
        self.remote_addr().unwrap_or_default()
    }

    /// Record the remote address, allocating a `:<hex>` endpoint-name suffix
    /// for stream clients so concurrent connects from one process stay
    /// distinguishable on the wire
    fn set_addr(&self, addr: &RpmsgAddr, suffix: bool) -> Result<(), Error> {
        let reserved = NAME_PREFIX.len() + if suffix { NAME_ID_LEN } else { 0 };
        if addr.name().len() + reserved > RPMSG_NAME_SIZE - 1 {
            return Err(Error::InvalidInput);
        }
        let mut info = self.addr.lock().unwrap();
        info.addr = Some(addr.clone());
        info.nameid = if suffix { alloc_nameid() } else { String::new() };
        Ok(())
    }

    /// Endpoint name announced on the bus
    fn wire_name(&self) -> String {
        let info = self.addr.lock().unwrap();
        let name = info.addr.as_ref().map(|a| a.name()).unwrap_or("");
        format!("{}{}{}", NAME_PREFIX, name, info.nameid)
    }

    /// Printable identity for the file-path ioctl
    pub(crate) fn file_path(&self) -> String {
        let (name, cpu, nameid) = {
            let info = self.addr.lock().unwrap();
            let (name, cpu) = info
                .addr
                .as_ref()
                .map(|a| (a.name().to_string(), a.cpu().to_string()))
                .unwrap_or_default();
            (name, cpu, info.nameid.clone())
        };
        let server = !matches!(
            self.recv.lock().unwrap().role,
            Role::Unbound | Role::Client
        );
        if server {
            format!(
                "rpmsg:[{}:[{}{}]<->{}]",
                self.bus.local_cpu(),
                name,
                nameid,
                cpu
            )
        } else {
            format!(
                "rpmsg:[{}<->{}:[{}{}]]",
                self.bus.local_cpu(),
                cpu,
                name,
                nameid
            )
        }
    }

    //
    // Setup: bind / listen / connect / accept
    //

    pub(crate) fn bind(&self, addr: &RpmsgAddr) -> Result<(), Error> {
        self.set_addr(addr, false)?;
        self.bound.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn listen(self: &Arc<Self>, backlog: usize) -> Result<(), Error> {
        if self.socket_type.is_dgram() {
            return Err(Error::Unsupported);
        }
        if !self.bound.load(Ordering::Acquire) || backlog == 0 {
            return Err(Error::InvalidInput);
        }
        self.recv.lock().unwrap().role = Role::Listener { backlog };
        if !self.registered.swap(true, Ordering::AcqRel) {
            self.bus.register(self.clone() as Arc<dyn BusHooks>);
        }
        debug!(name = %self.wire_name(), backlog, "listening");
        Ok(())
    }

    pub(crate) fn connect(self: &Arc<Self>, addr: &RpmsgAddr) -> Result<(), Error> {
        if self.connected.load(Ordering::Acquire) {
            return Err(Error::AlreadyConnected);
        }
        self.set_addr(addr, self.socket_type.is_stream())?;
        self.connect_internal()
    }

    /// Arm the client side: size the ring, watch for the matching device and
    /// wait for the peer's SYNC unless non-blocking
    pub(crate) fn connect_internal(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut recv = self.recv.lock().unwrap();
            if recv.role == Role::Unbound {
                recv.role = Role::Client;
            }
            if recv.buf.capacity() == 0 {
                recv.buf.resize(self.config.rx_buffer_size);
            }
        }
        if !self.registered.swap(true, Ordering::AcqRel) {
            self.bus.register(self.clone() as Arc<dyn BusHooks>);
        }
        if self.sendsize.load(Ordering::Acquire) == 0 {
            if self.nonblocking.load(Ordering::Relaxed) {
                return Err(Error::InProgress);
            }
            let timeout = self.timeouts.lock().unwrap().recv;
            let mut result = self.sendsem.wait(timeout);
            if result.is_ok() && self.endpoint_gone() {
                // woken by teardown rather than SYNC
                result = Err(Error::ConnectionReset);
            }
            if let Err(e) = result {
                if self.registered.swap(false, Ordering::AcqRel) {
                    let hooks: Arc<dyn BusHooks> = self.clone();
                    self.bus.unregister(&hooks);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn accept(self: &Arc<Self>) -> Result<(Arc<Connection>, RpmsgAddr), Error> {
        match self.recv.lock().unwrap().role {
            Role::Listener { .. } => {}
            Role::ListenerClosed => return Err(Error::ConnectionReset),
            _ => return Err(Error::InvalidInput),
        }
        loop {
            let child = self.recv.lock().unwrap().queue.pop_front();
            if let Some(child) = child {
                child.recv.lock().unwrap().role = Role::Accepted;
                if !child.registered.swap(true, Ordering::AcqRel) {
                    // so the child learns when the remote core goes away
                    self.bus.register(child.clone() as Arc<dyn BusHooks>);
                }
                if child.sendsize.load(Ordering::Acquire) == 0 {
                    // the peer's SYNC is still in flight
                    child.sendsem.wait(None)?;
                }
                let addr = child.peer_addr();
                trace!(peer = %addr, "accepted connection");
                return Ok((child, addr));
            }
            if self.nonblocking.load(Ordering::Relaxed) {
                return Err(Error::WouldBlock);
            }
            let result = self.recvsem.wait(None);
            if self.recv.lock().unwrap().role == Role::ListenerClosed {
                return Err(Error::ConnectionReset);
            }
            result?;
        }
    }

    //
    // Send path
    //

    pub(crate) fn send_msg(
        self: &Arc<Self>,
        bufs: &[&[u8]],
        to: Option<&RpmsgAddr>,
        dontwait: bool,
    ) -> Result<usize, Error> {
        if !self.connected.load(Ordering::Acquire) {
            let Some(to) = to else {
                return Err(Error::NotConnected);
            };
            self.connect(to)?;
        }
        if self.endpoint_gone() {
            return Err(Error::ConnectionReset);
        }
        let nonblock = self.nonblocking.load(Ordering::Relaxed) || dontwait;
        match self.socket_type {
            SocketType::Stream => self.send_continuous(bufs, nonblock),
            SocketType::Dgram => self.send_single(bufs, nonblock),
        }
    }

    /// Stream send: loop until every requested byte is written or an error
    /// stops progress. Partial progress is reported as a short write.
    fn send_continuous(&self, bufs: &[&[u8]], nonblock: bool) -> Result<usize, Error> {
        let len: usize = bufs.iter().map(|b| b.len()).sum();
        let mut cursor = GatherCursor::new(bufs);
        let mut written = 0usize;
        while written < len {
            let block = {
                let send = self.send.lock().unwrap();
                cmp::min((len - written) as u32, self.credit(&send))
            };
            if block == 0 {
                if nonblock {
                    return short_write(written, Error::WouldBlock);
                }
                let timeout = self.timeouts.lock().unwrap().send;
                let mut result = self.sendsem.wait(timeout);
                if self.endpoint_gone() {
                    result = Err(Error::ConnectionReset);
                }
                if let Err(e) = result {
                    return short_write(written, e);
                }
                continue;
            }
            let Some(ept) = self.endpoint() else {
                return short_write(written, Error::InvalidInput);
            };
            let mut tx = match ept.tx_buffer() {
                Ok(tx) => tx,
                Err(_) => return short_write(written, Error::InvalidInput),
            };
            let mut send = self.send.lock().unwrap();
            let block = cmp::min((len - written) as u32, self.credit(&send));
            let block = cmp::min(block, (tx.capacity() - DATA_HEADER_SIZE) as u32);
            let pos = self.recvpos.load(Ordering::Relaxed);
            DataHeader { pos, len: block }.encode(&mut *tx);
            cursor.copy_to(&mut *tx, block as usize);
            self.lastpos.store(pos, Ordering::Relaxed);
            send.sendpos = send.sendpos.wrapping_add(block);
            let result = ept.send_nocopy(tx);
            drop(send);
            if let Err(e) = result {
                return short_write(written, bus_send_error(e));
            }
            written += block as usize;
        }
        trace!(written, "stream send complete");
        Ok(written)
    }

    /// Datagram send: all-or-nothing within the peer's window
    fn send_single(&self, bufs: &[&[u8]], nonblock: bool) -> Result<usize, Error> {
        let len: usize = bufs.iter().map(|b| b.len()).sum();
        let total = (len + DATA_HEADER_SIZE + DGRAM_LEN_SIZE) as u32;
        if total > self.sendsize.load(Ordering::Acquire) {
            return Err(Error::MessageTooBig);
        }
        loop {
            let space = {
                let send = self.send.lock().unwrap();
                self.credit(&send)
            };
            if space >= total - DATA_HEADER_SIZE as u32 {
                break;
            }
            if nonblock {
                return Err(Error::WouldBlock);
            }
            let timeout = self.timeouts.lock().unwrap().send;
            let mut result = self.sendsem.wait(timeout);
            if self.endpoint_gone() {
                result = Err(Error::ConnectionReset);
            }
            result?;
        }
        let Some(ept) = self.endpoint() else {
            return Err(Error::InvalidInput);
        };
        let mut tx = ept.tx_buffer().map_err(|_| Error::InvalidInput)?;
        let mut send = self.send.lock().unwrap();
        let space = self.credit(&send);
        let total = cmp::min(total, space + DATA_HEADER_SIZE as u32);
        let total = cmp::min(total, tx.capacity() as u32);
        let len = total as usize - DATA_HEADER_SIZE - DGRAM_LEN_SIZE;
        let pos = self.recvpos.load(Ordering::Relaxed);
        DataHeader {
            pos,
            len: len as u32,
        }
        .encode(&mut *tx);
        tx.put_u32_le(len as u32);
        let mut cursor = GatherCursor::new(bufs);
        cursor.copy_to(&mut *tx, len);
        self.lastpos.store(pos, Ordering::Relaxed);
        send.sendpos = send.sendpos.wrapping_add((len + DGRAM_LEN_SIZE) as u32);
        let result = ept.send_nocopy(tx);
        drop(send);
        result.map_err(bus_send_error)?;
        trace!(len, "datagram sent");
        Ok(len)
    }

    //
    // Receive path
    //

    pub(crate) fn recv_msg(
        self: &Arc<Self>,
        buf: &mut [u8],
        dontwait: bool,
    ) -> Result<(usize, Option<RpmsgAddr>), Error> {
        if self.socket_type.is_dgram()
            && self.bound.load(Ordering::Acquire)
            && !self.connected.load(Ordering::Acquire)
        {
            // server-less datagram pattern: a bound socket connects on first
            // receive
            self.connect_internal()?;
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::AlreadyConnected);
        }
        let nonblock = self.nonblocking.load(Ordering::Relaxed) || dontwait;

        let mut recv = self.recv.lock().unwrap();
        let read = match self.socket_type {
            SocketType::Dgram => {
                if recv.buf.used() >= DGRAM_LEN_SIZE {
                    let mut prefix = [0u8; DGRAM_LEN_SIZE];
                    recv.buf.read(&mut prefix);
                    let datalen = u32::from_le_bytes(prefix) as usize;
                    let want = cmp::min(datalen, buf.len());
                    let read = recv.buf.read(&mut buf[..want]);
                    if datalen > read {
                        // silent datagram truncation
                        recv.buf.skip(datalen - read);
                    }
                    self.recvpos
                        .fetch_add((datalen + DGRAM_LEN_SIZE) as u32, Ordering::Relaxed);
                    read
                } else {
                    0
                }
            }
            SocketType::Stream => {
                let read = recv.buf.read(buf);
                self.recvpos.fetch_add(read as u32, Ordering::Relaxed);
                read
            }
        };
        if read > 0 {
            drop(recv);
            self.credit_wakeup();
            return Ok((read, self.remote_addr()));
        }
        if self.endpoint_gone() {
            // EOF once the peer is gone and the ring is drained
            return Ok((0, None));
        }
        if nonblock {
            return Err(Error::WouldBlock);
        }

        // Nothing buffered: arm the direct-copy rendezvous and wait for the
        // endpoint callback to hand us the next frame's payload.
        recv.slot = Some(DirectSlot::Armed { limit: buf.len() });
        self.recvsem.reset();
        drop(recv);
        let timeout = self.timeouts.lock().unwrap().recv;
        let result = self.recvsem.wait(timeout);
        let gone = self.endpoint_gone();
        let mut recv = self.recv.lock().unwrap();
        match recv.slot.take() {
            Some(DirectSlot::Filled { data }) => {
                drop(recv);
                buf[..data.len()].copy_from_slice(&data);
                self.credit_wakeup();
                Ok((data.len(), self.remote_addr()))
            }
            _ => {
                if gone {
                    return Err(Error::ConnectionReset);
                }
                result?;
                Ok((0, None))
            }
        }
    }

    /// Refund credit to the peer once more than half the ring has drained
    /// since the last refund. The refund is a zero-payload DATA frame.
    fn credit_wakeup(&self) {
        if self.endpoint_gone() {
            return;
        }
        let refund = {
            let recv = self.recv.lock().unwrap();
            let pos = self.recvpos.load(Ordering::Relaxed);
            let drained = pos.wrapping_sub(self.lastpos.load(Ordering::Relaxed));
            if drained as usize > recv.buf.capacity() / 2 {
                self.lastpos.store(pos, Ordering::Relaxed);
                Some(pos)
            } else {
                None
            }
        };
        if let Some(pos) = refund {
            if let Some(ept) = self.endpoint() {
                let mut frame = BytesMut::with_capacity(DATA_HEADER_SIZE);
                DataHeader { pos, len: 0 }.encode(&mut frame);
                trace!(pos, "credit refund");
                if let Err(e) = ept.send(&frame) {
                    debug!("credit refund failed: {e}");
                }
            }
        }
    }

    //
    // Poll readiness
    //

    pub(crate) fn poll_setup(&self, fd: &Arc<PollFd>) -> Result<(), Error> {
        self.poll.lock().unwrap().register(fd)?;

        // immediately report whatever is ready right now
        let mut events = PollEvents::empty();
        let recv = self.recv.lock().unwrap();
        match recv.role {
            Role::ListenerClosed => {
                // the slot stays registered; the caller tears it down
                return Err(Error::ConnectionReset);
            }
            Role::Listener { .. } => {
                if !recv.queue.is_empty() {
                    events |= PollEvents::IN;
                }
            }
            _ => {
                if self.connected.load(Ordering::Acquire) {
                    if self.endpoint_gone() {
                        events |= PollEvents::HUP;
                    }
                    {
                        let send = self.send.lock().unwrap();
                        if self.credit(&send) > 0 {
                            events |= PollEvents::OUT;
                        }
                    }
                    if !recv.buf.is_empty() {
                        events |= PollEvents::IN;
                    }
                } else if self.endpoint_gone() {
                    events |= PollEvents::HUP;
                }
            }
        }
        drop(recv);
        self.poll_notify(events);
        Ok(())
    }

    pub(crate) fn poll_remove(&self, fd: &Arc<PollFd>) {
        self.poll.lock().unwrap().deregister(fd);
    }

    //
    // Teardown
    //

    /// Drop one reference; the last one unhooks the bus and destroys the
    /// endpoint, waking every waiter so it observes the closed state
    pub(crate) fn close(self: &Arc<Self>) {
        if self.crefs.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }
        if self.registered.swap(false, Ordering::AcqRel) {
            let hooks: Arc<dyn BusHooks> = self.clone();
            self.bus.unregister(&hooks);
        }
        self.destroy_endpoint();
        // children still queued on a closing listener give their endpoints
        // back to the bus
        let orphans: Vec<_> = self.recv.lock().unwrap().queue.drain(..).collect();
        for child in orphans {
            child.destroy_endpoint();
        }
    }

    fn destroy_endpoint(&self) {
        let mut recv = self.recv.lock().unwrap();
        let _send = self.send.lock().unwrap();
        let closing_listener = matches!(recv.role, Role::Listener { .. });
        if closing_listener {
            recv.role = Role::ListenerClosed;
        }
        let ept = self.ept.lock().unwrap().take();
        if ept.is_some() || closing_listener {
            if let Some(ept) = ept {
                ept.destroy();
            }
            self.sendsem.post();
            self.recvsem.post();
            self.poll_notify(PollEvents::IN | PollEvents::OUT);
        }
    }
}

/// Frame and name-service events delivered by the endpoint.
///
/// Runs in bus context: posts waiters and fires notifications, never blocks.
impl EndpointHandlers for Connection {
    fn on_message(&self, frame: &[u8]) {
        let frame = match Frame::decode(frame) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed frame: {e}");
                return;
            }
        };
        match frame {
            Frame::Sync(sync) => {
                let mut recv = self.recv.lock().unwrap();
                self.sendsize.store(sync.size, Ordering::Release);
                recv.cred = Some(sync.cred);
                self.connected.store(true, Ordering::Release);
                self.sendsem.post();
                self.poll_notify(PollEvents::OUT);
                drop(recv);
                trace!(window = sync.size, "peer synchronized");
            }
            Frame::Data { header, payload } => {
                {
                    let mut send = self.send.lock().unwrap();
                    send.ackpos = header.pos;
                    if self.credit(&send) > 0 {
                        self.sendsem.post();
                        self.poll_notify(PollEvents::OUT);
                    }
                }
                if payload.is_empty() {
                    return;
                }
                debug_assert!(
                    payload.len() == header.len as usize
                        || payload.len() == header.len as usize + DGRAM_LEN_SIZE
                );
                let mut recv = self.recv.lock().unwrap();
                let mut rest = payload;
                if let Some(DirectSlot::Armed { limit }) = recv.slot {
                    match self.socket_type {
                        SocketType::Stream => {
                            let take = limit.min(header.len as usize).min(payload.len());
                            self.recvpos.fetch_add(take as u32, Ordering::Relaxed);
                            recv.slot = Some(DirectSlot::Filled {
                                data: Bytes::copy_from_slice(&payload[..take]),
                            });
                            rest = &payload[take..];
                        }
                        SocketType::Dgram => {
                            let body = &payload[DGRAM_LEN_SIZE.min(payload.len())..];
                            let take = limit.min(header.len as usize).min(body.len());
                            // the whole datagram leaves the stream, kept or not
                            self.recvpos
                                .fetch_add(payload.len() as u32, Ordering::Relaxed);
                            recv.slot = Some(DirectSlot::Filled {
                                data: Bytes::copy_from_slice(&body[..take]),
                            });
                            rest = &[];
                        }
                    }
                    self.recvsem.post();
                }
                if !rest.is_empty() {
                    let written = recv.buf.write(rest);
                    if written != rest.len() {
                        // flow control should make this impossible
                        error!(
                            dropped = rest.len() - written,
                            "receive ring overflow, payload dropped"
                        );
                    }
                    self.poll_notify(PollEvents::IN);
                }
            }
        }
    }

    /// The remote side bound our announced name: advertise our window
    fn on_ns_bound(&self, ept: &Arc<dyn Endpoint>) {
        let size = self.recv.lock().unwrap().buf.capacity() as u32;
        let sync = SyncFrame {
            size,
            cred: self.config.credentials,
        };
        let mut frame = BytesMut::with_capacity(crate::frame::SYNC_SIZE);
        sync.encode(&mut frame);
        trace!(window = size, "endpoint bound, sending sync");
        if let Err(e) = ept.send(&frame) {
            warn!("sync send failed: {e}");
        }
    }

    fn on_ns_unbind(&self) {
        let _recv = self.recv.lock().unwrap();
        self.unbind.store(true, Ordering::Release);
        self.sendsem.post();
        self.recvsem.post();
        self.poll_notify(PollEvents::IN | PollEvents::OUT);
        debug!("peer unbound");
    }
}

/// Bus-wide events: device lifecycle for clients and accepted children,
/// name-service announcements for listeners.
impl BusHooks for Connection {
    fn device_created(&self, device: &Arc<dyn Device>) {
        if self.recv.lock().unwrap().role != Role::Client {
            return;
        }
        if self.ept.lock().unwrap().is_some() {
            return;
        }
        let cpu = match self.remote_addr() {
            Some(addr) => addr.cpu().to_string(),
            None => return,
        };
        if cpu != device.cpu_name() {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };
        let name = self.wire_name();
        match device.create_endpoint(&name, ADDR_ANY, this) {
            Ok(ept) => {
                debug!(%name, %cpu, "client endpoint created");
                *self.ept.lock().unwrap() = Some(ept);
            }
            Err(e) => warn!(%name, "endpoint creation failed: {e}"),
        }
    }

    fn device_destroyed(&self, device: &Arc<dyn Device>) {
        let matches = self
            .remote_addr()
            .is_some_and(|addr| addr.cpu() == device.cpu_name());
        if matches {
            debug!(cpu = device.cpu_name(), "device destroyed");
            self.destroy_endpoint();
        }
    }

    fn ns_match(&self, device: &Arc<dyn Device>, name: &str, _dest: u32) -> bool {
        if !matches!(self.recv.lock().unwrap().role, Role::Listener { .. }) {
            return false;
        }
        let Some(addr) = self.remote_addr() else {
            return false;
        };
        let prefix = format!("{}{}", NAME_PREFIX, addr.name());
        if !name.starts_with(&prefix) {
            return false;
        }
        // bound to a specific CPU: only listen to that CPU
        if !addr.cpu().is_empty() && addr.cpu() != device.cpu_name() {
            return false;
        }
        true
    }

    /// A client announced a matching name: build the child connection, sync
    /// immediately, and queue it for accept unless the backlog is full
    fn ns_bind(&self, device: &Arc<dyn Device>, name: &str, dest: u32) {
        let backlog = match self.recv.lock().unwrap().role {
            Role::Listener { backlog } => backlog,
            _ => return,
        };
        let child = Connection::new(self.bus.clone(), SocketType::Stream, self.config.clone());
        child
            .recv
            .lock()
            .unwrap()
            .buf
            .resize(self.config.rx_buffer_size);
        let ept = match device.create_endpoint(name, dest, child.clone() as Arc<dyn EndpointHandlers>)
        {
            Ok(ept) => ept,
            Err(e) => {
                warn!(%name, "child endpoint creation failed: {e}");
                return;
            }
        };
        *child.ept.lock().unwrap() = Some(ept.clone());
        {
            let mut info = child.addr.lock().unwrap();
            let logical = name.strip_prefix(NAME_PREFIX).unwrap_or(name);
            info.addr = Some(RpmsgAddr::truncating(logical, device.cpu_name()));
        }
        child.on_ns_bound(&ept);

        let rejected = {
            let mut recv = self.recv.lock().unwrap();
            if recv.queue.len() >= backlog {
                true
            } else {
                recv.queue.push_back(child.clone());
                false
            }
        };
        if rejected {
            debug!(%name, backlog, "accept queue full, rejecting connection");
            child.destroy_endpoint();
            return;
        }
        trace!(%name, "connection queued for accept");
        self.recvsem.post();
        self.poll_notify(PollEvents::IN);
    }
}

/// Walks a gather list while copying into transmit buffers
struct GatherCursor<'a> {
    bufs: &'a [&'a [u8]],
    offset: usize,
}

impl<'a> GatherCursor<'a> {
    fn new(bufs: &'a [&'a [u8]]) -> Self {
        GatherCursor { bufs, offset: 0 }
    }

    fn copy_to<B: BufMut>(&mut self, out: &mut B, mut count: usize) {
        while count > 0 {
            let Some(buf) = self.bufs.first() else {
                break;
            };
            let chunk = cmp::min(count, buf.len() - self.offset);
            out.put_slice(&buf[self.offset..self.offset + chunk]);
            self.offset += chunk;
            if self.offset == buf.len() {
                self.bufs = &self.bufs[1..];
                self.offset = 0;
            }
            count -= chunk;
        }
    }
}

fn short_write(written: usize, error: Error) -> Result<usize, Error> {
    if written > 0 {
        Ok(written)
    } else {
        Err(error)
    }
}

fn bus_send_error(error: BusError) -> Error {
    match error {
        BusError::Gone => Error::ConnectionReset,
        _ => Error::InvalidInput,
    }
}

fn next_connection_id() -> u64 {
    static NEXT_ID: OnceLock<AtomicU64> = OnceLock::new();
    NEXT_ID
        .get_or_init(|| {
            // monotonically rising across restarts, so reused names stay rare
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            AtomicU64::new(seed)
        })
        .fetch_add(1, Ordering::Relaxed)
}

fn alloc_nameid() -> String {
    let mut id = format!(":{:x}", next_connection_id());
    id.truncate(NAME_ID_LEN);
    id
}

/// Snapshot of the flow-control counters, for invariant checks in tests
#[cfg(test)]
#[derive(Debug, Copy, Clone)]
pub(crate) struct FlowState {
    pub sendsize: u32,
    pub sendpos: u32,
    pub ackpos: u32,
    pub recvpos: u32,
    pub lastpos: u32,
    pub ring_capacity: usize,
}

#[cfg(test)]
impl Connection {
    pub(crate) fn flow_state(&self) -> FlowState {
        let recv = self.recv.lock().unwrap();
        let send = self.send.lock().unwrap();
        FlowState {
            sendsize: self.sendsize.load(Ordering::Acquire),
            sendpos: send.sendpos,
            ackpos: send.ackpos,
            recvpos: self.recvpos.load(Ordering::Relaxed),
            lastpos: self.lastpos.load(Ordering::Relaxed),
            ring_capacity: recv.buf.capacity(),
        }
    }
}
