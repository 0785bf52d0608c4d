//! Poll readiness: waiter registration and event notification.
//!
//! Each connection carries a small fixed table of poll waiters, mirroring the
//! dispatcher's `pollfd` slots. Registration fails with [`Error::Busy`] once
//! every slot is taken. Event producers (endpoint callback, credit updates,
//! teardown) notify the table; each waiter accumulates the events it is
//! interested in plus hang-up, which is always delivered.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::sync::WaitEvent;

/// Number of poll waiter slots per connection
pub(crate) const NPOLLWAITERS: usize = 4;

/// Readiness event set
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PollEvents(u32);

impl PollEvents {
    /// Data readable, or accept queue non-empty on a listener
    pub const IN: PollEvents = PollEvents(0x001);
    /// Send credit available
    pub const OUT: PollEvents = PollEvents(0x004);
    /// Endpoint gone or peer unbound; set once and never cleared
    pub const HUP: PollEvents = PollEvents(0x010);

    pub const fn empty() -> Self {
        PollEvents(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: PollEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: PollEvents) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for PollEvents {
    type Output = PollEvents;
    fn bitor(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: PollEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollEvents {
    type Output = PollEvents;
    fn bitand(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 & rhs.0)
    }
}

impl fmt::Debug for PollEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for (bit, name) in [
            (PollEvents::IN, "IN"),
            (PollEvents::OUT, "OUT"),
            (PollEvents::HUP, "HUP"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A registered poll waiter
///
/// Holds the caller's interest set and accumulates delivered events until
/// they are consumed with [`PollFd::take_revents`]. Hang-up is delivered
/// regardless of interest.
#[derive(Debug)]
pub struct PollFd {
    interest: PollEvents,
    revents: Mutex<PollEvents>,
    ready: WaitEvent,
}

impl PollFd {
    pub fn new(interest: PollEvents) -> Arc<Self> {
        Arc::new(PollFd {
            interest,
            revents: Mutex::new(PollEvents::empty()),
            ready: WaitEvent::new(),
        })
    }

    pub fn interest(&self) -> PollEvents {
        self.interest
    }

    /// Events delivered so far
    pub fn revents(&self) -> PollEvents {
        *self.revents.lock().unwrap()
    }

    /// Consume and return the delivered events
    pub fn take_revents(&self) -> PollEvents {
        std::mem::take(&mut *self.revents.lock().unwrap())
    }

    /// Block until at least one event is delivered
    pub fn wait(&self, timeout: Option<Duration>) -> Result<PollEvents, Error> {
        loop {
            let events = self.revents();
            if !events.is_empty() {
                return Ok(events);
            }
            self.ready.wait(timeout)?;
        }
    }

    pub(crate) fn notify(&self, events: PollEvents) {
        let delivered = events & (self.interest | PollEvents::HUP);
        if delivered.is_empty() {
            return;
        }
        *self.revents.lock().unwrap() |= delivered;
        self.ready.post();
    }
}

/// Fixed-slot table of poll waiters attached to one connection
pub(crate) struct PollTable {
    slots: [Option<Arc<PollFd>>; NPOLLWAITERS],
}

impl PollTable {
    pub fn new() -> Self {
        PollTable {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn register(&mut self, fd: &Arc<PollFd>) -> Result<(), Error> {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(fd.clone());
                return Ok(());
            }
        }
        Err(Error::Busy)
    }

    pub fn deregister(&mut self, fd: &Arc<PollFd>) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, fd)) {
                *slot = None;
            }
        }
    }

    pub fn notify(&self, events: PollEvents) {
        for slot in self.slots.iter().flatten() {
            slot.notify(events);
        }
    }
}
