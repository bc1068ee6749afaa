//! Change notification primitives
//!
//! A subscription arms a one-shot event on a key. Mutation walks signal the
//! event at most once; the record stays in the key's list until it is
//! replaced by the same (session, handle) pair or the handle closes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::session::{HandleId, SessionId};

/// A one-shot signalable event.
///
/// `signal` latches the state; waiters observe it until the next `reset`.
/// parking_lot primitives are used so a panicking signaler cannot poison
/// every waiter.
#[derive(Debug, Default)]
pub struct NotifyEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl NotifyEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(NotifyEvent::default())
    }

    pub fn signal(&self) {
        let mut signaled = self.state.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.state.lock()
    }

    /// Wait until signaled or the timeout elapses; returns the final state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.state.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        *signaled
    }
}

/// A subscription stored on a key.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Session the subscribing handle belongs to.
    pub session: SessionId,
    /// The key handle the subscriber armed; identifies the record for
    /// replacement and close.
    pub hkey: HandleId,
    /// Change kinds to observe.
    pub filter: u32,
    /// Observe the whole subtree, not just this key.
    pub subtree: bool,
    /// Armed event; taken on the first matching change.
    pub event: Option<Arc<NotifyEvent>>,
}

impl Notification {
    /// Signal the armed event, if any, exactly once.
    pub fn fire(&mut self) {
        if let Some(event) = self.event.take() {
            event.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_signal_and_reset() {
        let ev = NotifyEvent::new();
        assert!(!ev.is_signaled());
        ev.signal();
        assert!(ev.is_signaled());
        ev.reset();
        assert!(!ev.is_signaled());
    }

    #[test]
    fn test_wait_observes_prior_signal() {
        let ev = NotifyEvent::new();
        ev.signal();
        assert!(ev.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_times_out_unsignaled() {
        let ev = NotifyEvent::new();
        assert!(!ev.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_fire_is_one_shot() {
        let ev = NotifyEvent::new();
        let mut n = Notification {
            session: SessionId(1),
            hkey: HandleId(1),
            filter: 0xF,
            subtree: false,
            event: Some(ev.clone()),
        };
        n.fire();
        assert!(ev.is_signaled());
        ev.reset();
        n.fire();
        assert!(!ev.is_signaled());
    }
}
