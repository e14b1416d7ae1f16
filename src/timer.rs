//! Deadline-ordered timer list driven off the poll timeout
//!
//! The engine creates timers through its callback handle and arms them
//! with absolute millisecond deadlines. The NAT thread walks the list
//! twice per poll round: once before the wait to clamp the poll timeout
//! to the earliest deadline, and once after to fire expired handlers.
//! Handlers run on the NAT thread and may create, rearm or free timers
//! from within their own invocation.

use std::sync::{Arc, Mutex};

/// Handler invoked on the NAT thread when a timer expires.
pub type TimerHandler = Arc<dyn Fn() + Send + Sync>;

/// Opaque handle identifying a timer in a [`TimerList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    id: TimerId,
    /// Absolute deadline in milliseconds. 0 means disarmed.
    expires_ms: i64,
    handler: TimerHandler,
}

#[derive(Default)]
struct Timers {
    next_id: u64,
    entries: Vec<TimerEntry>,
}

/// List of engine timers, few in number and walked linearly.
#[derive(Default)]
pub struct TimerList {
    inner: Mutex<Timers>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a disarmed timer and returns its handle.
    pub fn create(&self, handler: TimerHandler) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = TimerId(inner.next_id);
        inner.entries.push(TimerEntry {
            id,
            expires_ms: 0,
            handler,
        });
        id
    }

    /// Sets the absolute deadline of a timer without relinking it.
    pub fn modify(&self, id: TimerId, expires_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.iter_mut().filter(|e| e.id == id) {
            entry.expires_ms = expires_ms;
        }
    }

    /// Unlinks every entry carrying the given handle.
    pub fn free(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.id != id);
    }

    /// Lowers `timeout_ms` to the time remaining until the earliest
    /// armed deadline, leaving it untouched when no timer is due sooner.
    pub fn clamp_timeout(&self, now_ms: i64, timeout_ms: &mut u32) {
        let inner = self.inner.lock().unwrap();
        for entry in inner.entries.iter().filter(|e| e.expires_ms != 0) {
            let diff = (entry.expires_ms - now_ms).max(0);
            if (diff as u64) < u64::from(*timeout_ms) {
                *timeout_ms = diff as u32;
            }
        }
    }

    /// Fires every armed timer whose deadline has passed.
    ///
    /// Expired entries are disarmed before their handlers run, and the
    /// handlers are invoked with the list unlocked so they can mutate it.
    /// Returns the number of handlers fired.
    pub fn fire_expired(&self, now_ms: i64) -> usize {
        let due: Vec<TimerHandler> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .entries
                .iter_mut()
                .filter(|e| e.expires_ms != 0 && e.expires_ms <= now_ms)
                .map(|e| {
                    e.expires_ms = 0;
                    Arc::clone(&e.handler)
                })
                .collect()
        };
        for handler in &due {
            handler();
        }
        due.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}
