//! Wire frames exchanged over a connection's endpoint.
//!
//! Two frame kinds share the endpoint, discriminated by a leading 32-bit
//! command word. SYNC is sent exactly once in each direction right after the
//! endpoint binds and carries the sender's RX ring capacity plus its
//! credentials. DATA carries payload bytes and, in its `pos` field, a
//! cumulative acknowledgement of bytes the sender has drained locally; a DATA
//! frame with no payload is a pure credit update.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, Codec, UnexpectedEnd};

pub(crate) const CMD_SYNC: u32 = 1;
pub(crate) const CMD_DATA: u32 = 2;

/// Size of an encoded SYNC frame
pub(crate) const SYNC_SIZE: usize = 20;
/// Size of the DATA frame header preceding any payload
pub(crate) const DATA_HEADER_SIZE: usize = 12;
/// Size of the datagram length prefix inside a DATA payload
pub(crate) const DGRAM_LEN_SIZE: usize = 4;

/// Credentials of a connection's peer, captured from its SYNC frame
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct UCred {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Codec for UCred {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        Ok(UCred {
            pid: buf.get()?,
            uid: buf.get()?,
            gid: buf.get()?,
        })
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.pid);
        buf.write(self.uid);
        buf.write(self.gid);
    }
}

/// Connection handshake announcing ring capacity and credentials
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct SyncFrame {
    /// Sender's RX ring capacity, i.e. the receiver's send window
    pub size: u32,
    pub cred: UCred,
}

impl SyncFrame {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(CMD_SYNC);
        buf.write(self.size);
        self.cred.encode(buf);
    }
}

/// Header of a DATA frame; `len` counts useful payload bytes and excludes the
/// datagram length prefix
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct DataHeader {
    /// Sender's current receive position, refunding credit to the remote
    pub pos: u32,
    pub len: u32,
}

impl DataHeader {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(CMD_DATA);
        buf.write(self.pos);
        buf.write(self.len);
    }
}

/// A decoded inbound frame, borrowing its payload from the bus buffer
#[derive(Debug, PartialEq)]
pub(crate) enum Frame<'a> {
    Sync(SyncFrame),
    Data {
        header: DataHeader,
        payload: &'a [u8],
    },
}

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DecodeError {
    #[error(transparent)]
    UnexpectedEnd(#[from] UnexpectedEnd),
    #[error("unknown frame command {0}")]
    UnknownCommand(u32),
}

impl<'a> Frame<'a> {
    pub fn decode(mut frame: &'a [u8]) -> Result<Self, DecodeError> {
        let buf = &mut frame;
        let cmd: u32 = buf.get()?;
        match cmd {
            CMD_SYNC => Ok(Frame::Sync(SyncFrame {
                size: buf.get()?,
                cred: UCred::decode(buf)?,
            })),
            CMD_DATA => {
                let header = DataHeader {
                    pos: buf.get()?,
                    len: buf.get()?,
                };
                Ok(Frame::Data {
                    header,
                    payload: frame,
                })
            }
            other => Err(DecodeError::UnknownCommand(other)),
        }
    }
}
