//! Blocking wait primitive used at the transport's suspension points.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Error;

/// A binary wake-up event.
///
/// `post` marks the event signaled and wakes one waiter; posting an
/// already-signaled event is a no-op, so redundant wake-ups collapse instead
/// of accumulating. `wait` consumes the signal. This replaces the counted
/// semaphores of classic socket stacks: every use site treats the semaphore
/// as "something changed, re-check state", never as a resource count.
#[derive(Debug, Default)]
pub(crate) struct WaitEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking one waiter; idempotent while unconsumed
    pub fn post(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        if !*signaled {
            *signaled = true;
            self.cond.notify_one();
        }
    }

    /// Clear any pending signal
    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    /// Block until the event is signaled, consuming the signal.
    ///
    /// With a timeout, expiry yields [`Error::TimedOut`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let mut signaled = self.signaled.lock().unwrap();
        match timeout {
            None => {
                while !*signaled {
                    signaled = self.cond.wait(signaled).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::TimedOut);
                    }
                    let (guard, _) = self.cond.wait_timeout(signaled, deadline - now).unwrap();
                    signaled = guard;
                }
            }
        }
        *signaled = false;
        Ok(())
    }
}
