//! `AF_RPMSG` socket addresses.
//!
//! The wire layout is bit-exact with the dispatcher's `sockaddr` form:
//!
//! ```text
//! rp_family : u16       (= AF_RPMSG)
//! rp_name   : [u8; 32]  (logical endpoint name, NUL-terminated)
//! rp_cpu    : [u8; 16]  (remote CPU name, NUL-terminated; empty = any)
//! ```

use std::fmt;

use bytes::BufMut;

use crate::coding::BufMutExt;
use crate::error::Error;

/// Address family of RPMsg sockets
pub const AF_RPMSG: u16 = 45;

/// Capacity of the logical endpoint name field, including the terminator
pub const NAME_SIZE: usize = 32;

/// Capacity of the CPU name field, including the terminator
pub const CPU_SIZE: usize = 16;

/// Encoded size of an [`RpmsgAddr`]
pub const WIRE_SIZE: usize = 2 + NAME_SIZE + CPU_SIZE;

/// Address of an RPMsg socket: a logical endpoint name plus a CPU filter
#[derive(Clone, Default, Eq, PartialEq)]
pub struct RpmsgAddr {
    name: [u8; NAME_SIZE],
    cpu: [u8; CPU_SIZE],
}

impl RpmsgAddr {
    /// Build an address from a logical name and a remote CPU name
    ///
    /// An empty `cpu` means "any CPU"; a listener bound to it accepts
    /// connections from every core. Either component longer than its
    /// NUL-terminated field fails with [`Error::InvalidInput`].
    pub fn new(name: &str, cpu: &str) -> Result<Self, Error> {
        if name.len() >= NAME_SIZE || cpu.len() >= CPU_SIZE {
            return Err(Error::InvalidInput);
        }
        let mut addr = RpmsgAddr::default();
        addr.name[..name.len()].copy_from_slice(name.as_bytes());
        addr.cpu[..cpu.len()].copy_from_slice(cpu.as_bytes());
        Ok(addr)
    }

    /// Like [`RpmsgAddr::new`], truncating oversized components to fit
    pub(crate) fn truncating(name: &str, cpu: &str) -> Self {
        let mut addr = RpmsgAddr::default();
        let n = name.len().min(NAME_SIZE - 1);
        addr.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        let n = cpu.len().min(CPU_SIZE - 1);
        addr.cpu[..n].copy_from_slice(&cpu.as_bytes()[..n]);
        addr
    }

    /// The logical endpoint name
    pub fn name(&self) -> &str {
        Self::field(&self.name)
    }

    /// The CPU name; empty means any CPU
    pub fn cpu(&self) -> &str {
        Self::field(&self.cpu)
    }

    pub(crate) fn set_cpu(&mut self, cpu: &str) {
        self.cpu = [0; CPU_SIZE];
        let n = cpu.len().min(CPU_SIZE - 1);
        self.cpu[..n].copy_from_slice(&cpu.as_bytes()[..n]);
    }

    /// Decode the bit-exact `sockaddr` form
    pub fn from_wire(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < WIRE_SIZE {
            return Err(Error::InvalidInput);
        }
        let family = u16::from_le_bytes([buf[0], buf[1]]);
        if family != AF_RPMSG {
            return Err(Error::InvalidInput);
        }
        let mut addr = RpmsgAddr::default();
        addr.name.copy_from_slice(&buf[2..2 + NAME_SIZE]);
        addr.cpu.copy_from_slice(&buf[2 + NAME_SIZE..WIRE_SIZE]);
        Ok(addr)
    }

    /// Encode the bit-exact `sockaddr` form
    pub fn to_wire(&self) -> [u8; WIRE_SIZE] {
        let mut out = [0; WIRE_SIZE];
        let mut buf = &mut out[..];
        buf.write(AF_RPMSG);
        buf.put_slice(&self.name);
        buf.put_slice(&self.cpu);
        out
    }

    fn field(bytes: &[u8]) -> &str {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).unwrap_or("")
    }
}

impl fmt::Debug for RpmsgAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpmsgAddr")
            .field("name", &self.name())
            .field("cpu", &self.cpu())
            .finish()
    }
}

impl fmt::Display for RpmsgAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cpu().is_empty() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "{}@{}", self.name(), self.cpu())
        }
    }
}
