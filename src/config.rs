use std::fmt;

use crate::frame::UCred;

/// Parameters governing RPMsg socket connections
///
/// One `Config` is shared by a socket and every connection it spawns; a
/// listener's children inherit its ring capacity. Defaults suit typical
/// virtio-backed RPMsg links.
#[derive(Clone)]
pub struct Config {
    pub(crate) rx_buffer_size: usize,
    pub(crate) credentials: UCred,
}

impl Config {
    /// Capacity of the receive ring, which is also the window advertised to
    /// the peer in SYNC.
    ///
    /// Larger rings let the remote sender burst more data between credit
    /// refunds at the cost of memory held per connection.
    pub fn rx_buffer_size(&mut self, value: usize) -> &mut Self {
        self.rx_buffer_size = value;
        self
    }

    /// Credentials advertised to peers in SYNC, readable there via the
    /// peer-credentials socket option.
    pub fn credentials(&mut self, value: UCred) -> &mut Self {
        self.credentials = value;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rx_buffer_size: 4096,
            credentials: process_credentials(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("rx_buffer_size", &self.rx_buffer_size)
            .field("credentials", &self.credentials)
            .finish()
    }
}

#[cfg(unix)]
fn process_credentials() -> UCred {
    UCred {
        pid: std::process::id(),
        // SAFETY: getuid/getgid cannot fail and touch no memory
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
    }
}

#[cfg(not(unix))]
fn process_credentials() -> UCred {
    UCred {
        pid: std::process::id(),
        uid: 0,
        gid: 0,
    }
}
