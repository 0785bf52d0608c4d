use thiserror::Error;

/// Errors reported by socket operations
///
/// Each variant corresponds to one POSIX error category of the socket layer;
/// the embedding dispatcher maps variants onto its native `errno` values.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// Bad address or length, `listen` without `bind`, zero backlog (`EINVAL`)
    #[error("invalid argument")]
    InvalidInput,
    /// The bus could not allocate resources (`ENOMEM`)
    #[error("out of memory")]
    OutOfMemory,
    /// `connect` on a connected socket, or `recv` before the connection is
    /// established (`EISCONN`)
    #[error("socket is already connected")]
    AlreadyConnected,
    /// `send` without a destination on an unconnected socket (`ENOTCONN`)
    #[error("socket is not connected")]
    NotConnected,
    /// Non-blocking `connect` is armed and will complete on SYNC
    /// (`EINPROGRESS`)
    #[error("connection establishment in progress")]
    InProgress,
    /// Non-blocking operation found no data, no credit, or an empty accept
    /// queue (`EAGAIN`)
    #[error("operation would block")]
    WouldBlock,
    /// Listener closed during `accept`, or the peer vanished while an
    /// operation was in flight (`ECONNRESET`)
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Datagram larger than the peer's advertised window (`EFBIG`)
    #[error("datagram exceeds peer window")]
    MessageTooBig,
    /// `listen` on a datagram socket (`ENOSYS`)
    #[error("operation not supported")]
    Unsupported,
    /// Unknown ioctl command (`ENOTTY`)
    #[error("unknown ioctl command")]
    UnknownIoctl,
    /// Unknown socket option (`ENOPROTOOPT`)
    #[error("unknown socket option")]
    UnknownOption,
    /// All poll waiter slots are occupied (`EBUSY`)
    #[error("no free poll slot")]
    Busy,
    /// A blocking wait exceeded the socket's timeout (`ETIMEDOUT`)
    #[error("operation timed out")]
    TimedOut,
}
