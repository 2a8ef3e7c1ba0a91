//! Deadline queue for probe, timeout and route-retry timers
//!
//! Every timer is identified by a [`TimerKey`]; arming a key that is already
//! armed moves it to the new deadline, so a key is pending at most once.

use crate::types::{HostId, IfaceId};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// Identity of a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKey {
    /// Next probe of a host is due
    Probe(HostId),
    /// Outstanding probe of a host expires
    Timeout(HostId),
    /// Retry a failed route request of an interface
    RouteRetry(IfaceId),
}

/// Ordered set of pending deadlines
#[derive(Debug, Default)]
pub struct TimerQueue {
    queue: BTreeSet<(Instant, TimerKey)>,
    armed: HashMap<TimerKey, Instant>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` at `deadline`, replacing any earlier arming
    pub fn arm(&mut self, key: TimerKey, deadline: Instant) {
        if let Some(old) = self.armed.insert(key, deadline) {
            self.queue.remove(&(old, key));
        }
        self.queue.insert((deadline, key));
    }

    /// Disarm `key`; returns whether it was pending
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        match self.armed.remove(&key) {
            Some(deadline) => {
                self.queue.remove(&(deadline, key));
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    /// Deadline of `key`, if armed
    pub fn deadline(&self, key: TimerKey) -> Option<Instant> {
        self.armed.get(&key).copied()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at or before `now`, earliest first
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut expired = Vec::new();
        while let Some(&(deadline, key)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.pop_first();
            self.armed.remove(&key);
            expired.push(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
