//! Collaborator traits for the underlying RPMsg bus.
//!
//! The transport never talks to hardware; it consumes exactly the surface
//! below. A production integration implements these traits over its
//! platform's RPMsg stack; the test suite provides an in-memory loopback
//! fabric. Implementations must deliver frames serially per endpoint and must
//! release any internal lock before invoking a callback.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;

/// Wildcard endpoint address: let the bus pick
pub const ADDR_ANY: u32 = 0xffff_ffff;

/// Errors surfaced by bus operations
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum BusError {
    /// The endpoint or its remote counterpart no longer exists
    #[error("remote endpoint is gone")]
    Gone,
    /// No transmit buffer is currently available
    #[error("no transmit buffer available")]
    NoTxBuffer,
    /// The bus rejected the endpoint name
    #[error("endpoint name rejected by the bus")]
    BadName,
    /// The bus could not allocate resources
    #[error("bus resources exhausted")]
    OutOfMemory,
}

/// A transmit payload buffer acquired from the bus.
///
/// The caller owns the buffer until it is submitted with
/// [`Endpoint::send_nocopy`]; dropping an unsubmitted buffer returns it to
/// the bus, so error paths cannot leak one.
#[derive(Debug)]
pub struct TxBuffer {
    data: BytesMut,
    capacity: usize,
}

impl TxBuffer {
    pub fn new(capacity: usize) -> Self {
        TxBuffer {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Usable frame capacity, header included
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Deref for TxBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        &self.data
    }
}

impl DerefMut for TxBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

/// Callbacks a connection attaches to its endpoint.
///
/// Invoked from bus context; implementations post waiters and fire poll
/// notifications but never block.
pub trait EndpointHandlers: Send + Sync {
    /// A frame arrived on the endpoint
    fn on_message(&self, frame: &[u8]);
    /// The remote side bound a matching endpoint; the channel is usable.
    ///
    /// `ept` is the endpoint itself: the event may fire inside
    /// [`Device::create_endpoint`], before the caller holds the returned
    /// handle.
    fn on_ns_bound(&self, ept: &Arc<dyn Endpoint>) {
        let _ = ept;
    }
    /// The remote side unbound its endpoint
    fn on_ns_unbind(&self) {}
}

/// One half of an RPMsg channel
pub trait Endpoint: Send + Sync {
    /// Copy `frame` into a bus buffer and enqueue it
    fn send(&self, frame: &[u8]) -> Result<(), BusError>;
    /// Acquire a zero-copy transmit buffer
    fn tx_buffer(&self) -> Result<TxBuffer, BusError>;
    /// Submit a buffer previously acquired with [`Endpoint::tx_buffer`]
    fn send_nocopy(&self, buf: TxBuffer) -> Result<(), BusError>;
    /// Tear the endpoint down, announcing the unbind to the remote side
    fn destroy(&self);
}

/// A remote-processor device on the bus
pub trait Device: Send + Sync {
    /// Name of the CPU this device reaches
    fn cpu_name(&self) -> &str;
    /// Create an endpoint toward this device.
    ///
    /// `dest` is the remote endpoint address to bind to, or [`ADDR_ANY`] to
    /// announce the name and wait for the remote side to bind.
    fn create_endpoint(
        &self,
        name: &str,
        dest: u32,
        handlers: Arc<dyn EndpointHandlers>,
    ) -> Result<Arc<dyn Endpoint>, BusError>;
}

/// Bus-wide callbacks registered per connection role.
///
/// Clients react to device lifecycle, listeners to name-service
/// announcements. The default implementations ignore everything, so each
/// role overrides only what it consumes.
pub trait BusHooks: Send + Sync {
    /// A device appeared (also replayed at registration for existing devices)
    fn device_created(&self, _device: &Arc<dyn Device>) {}
    /// A device disappeared
    fn device_destroyed(&self, _device: &Arc<dyn Device>) {}
    /// Does this registrant want the announced name?
    fn ns_match(&self, _device: &Arc<dyn Device>, _name: &str, _dest: u32) -> bool {
        false
    }
    /// Claim an announced name previously accepted by `ns_match`
    fn ns_bind(&self, _device: &Arc<dyn Device>, _name: &str, _dest: u32) {}
}

/// The RPMsg bus itself
pub trait Bus: Send + Sync {
    /// Name of the CPU this bus instance runs on
    fn local_cpu(&self) -> &str;
    /// Attach hooks; `device_created` is replayed for already-present devices
    fn register(&self, hooks: Arc<dyn BusHooks>);
    /// Detach hooks previously attached with [`Bus::register`], identified by
    /// pointer identity
    fn unregister(&self, hooks: &Arc<dyn BusHooks>);
}
