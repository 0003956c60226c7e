/*******************************************************************************
* SPDX-License-Identifier: Apache-2.0
*******************************************************************************/

//! Timer index: maps per-connection deadlines to connections. Answers "what
//! is the next deadline" (for the reactor's blocking timeout) and "expire
//! everything due" (the sweep the main loop runs after draining reactor
//! events).

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::arena::ConnId;
use crate::ordmap::OrderedMap;

/// Default idle timeout for a connection waiting on the reactor: 300
/// seconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

/// Sentinel returned by [`TimerIndex::next_deadline_ms`] when the index is
/// empty: "block indefinitely" for the reactor's `wait()` call.
pub const INFINITE_TIMEOUT: Option<u64> = None;

struct Inner {
    map: OrderedMap<u64, ConnId>,
}

/// The timer index. A single mutex guards both the ordered map and, by
/// convention rather than by the type system (see
/// [`crate::conn::Connection`]), the `timerset` flag of every connection it
/// references: all modifications and minimum reads take this lock together.
pub struct TimerIndex {
    inner: Mutex<Inner>,
}

impl TimerIndex {
    pub fn new() -> Self {
        TimerIndex {
            inner: Mutex::new(Inner { map: OrderedMap::new() }),
        }
    }

    /// Adds a timer for `conn` expiring `delay_ms` from now. Returns the
    /// absolute deadline so the caller can stash it on the connection and
    /// flip `timerset` while still holding whatever lock serializes that
    /// flag (the arena mutex, in this crate).
    pub fn add(&self, conn: ConnId, delay_ms: u64) -> u64 {
        let deadline = now_ms() + delay_ms;
        let mut inner = self.inner.lock().unwrap();
        inner.map.insert(deadline, conn);
        deadline
    }

    /// Removes the timer for `conn` at `deadline`, if still present.
    /// Idempotent: removing a timer that already fired or was already
    /// removed is a no-op.
    pub fn del(&self, conn: ConnId, deadline: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(deadline, conn)
    }

    /// Milliseconds until the next deadline, clamped to zero, or
    /// `INFINITE_TIMEOUT` if no connection is waiting. This is passed
    /// straight into the reactor's blocking `wait()` call.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        let (min_key, _) = inner.map.peek_min()?;
        let now = now_ms();
        Some(min_key.saturating_sub(now))
    }

    /// Pops every connection whose deadline is `<= now_ms()`, returning their
    /// ids so the caller (outside the lock) can deregister them from the
    /// reactor and close them. The reactor call is made without holding the
    /// timer mutex.
    pub fn expire_due(&self) -> Vec<ConnId> {
        let mut expired = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        loop {
            match inner.map.peek_min() {
                Some((deadline, conn)) if deadline <= now => {
                    inner.map.remove(deadline, conn);
                    expired.push(conn);
                }
                _ => break,
            }
        }
        expired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }
}

impl Default for TimerIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn add_then_del_leaves_index_empty() {
        let mut arena = Arena::new();
        let id = arena.insert(());
        let timers = TimerIndex::new();
        let deadline = timers.add(id, 1_000);
        assert_eq!(timers.len(), 1);
        assert!(timers.del(id, deadline));
        assert_eq!(timers.len(), 0);
        // idempotent
        assert!(!timers.del(id, deadline));
    }

    #[test]
    fn next_deadline_ms_is_never_an_overestimate() {
        let mut arena = Arena::new();
        let id = arena.insert(());
        let timers = TimerIndex::new();
        timers.add(id, 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let reported = timers.next_deadline_ms().unwrap();
        // the real deadline has already passed; reported time-to-wait must
        // not be a positive overestimate relative to actual expiry.
        assert_eq!(reported, 0);
    }

    #[test]
    fn expire_pops_only_due_entries_and_is_fifo_within_a_tie() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        let c = arena.insert("c");
        let timers = TimerIndex::new();
        let now = now_ms();
        // Insert two entries already due and one far in the future, bypassing
        // add() so we control the exact deadline for a deterministic test.
        {
            let mut inner = timers.inner.lock().unwrap();
            inner.map.insert(now, a);
            inner.map.insert(now, b);
            inner.map.insert(now + 60_000, c);
        }
        let expired = timers.expire_due();
        assert_eq!(expired, vec![a, b]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn empty_index_reports_infinite_timeout() {
        let timers = TimerIndex::new();
        assert_eq!(timers.next_deadline_ms(), None);
    }
}
