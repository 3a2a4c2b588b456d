//! One-shot timer facility shared by every state machine.
//!
//! Timers are entries in a process-wide schedule drained by the daemon's
//! event loop. A [`TimerHandle`] stays valid until the timer fires or is
//! cancelled; cancelling before every state transition is an invariant the
//! method state machines rely on, not best-effort cleanup.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::service::ServiceKey;

/// Payload delivered when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Per-service timer owned by a method state machine.
    Service { key: ServiceKey, kind: TimerKind },
    /// Daemon-wide kernel poll tick.
    Poll,
}

/// Which per-service timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Link-inactive grace period expired.
    LinkInactive,
    /// Next router solicitation is due.
    Solicit,
}

/// Handle for a pending timer. Cancelling an already-fired timer is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Process-wide one-shot timer schedule.
///
/// The event loop asks for [`Timers::next_deadline`], sleeps until it, then
/// drains everything due with [`Timers::pop_due`]. Cancelled entries stay in
/// the heap but are skipped on drain, so cancellation is O(1).
pub struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, TimerEvent>,
    next_id: u64,
}

impl Timers {
    pub fn new() -> Self {
        Timers {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `event` to fire `delay` from now.
    pub fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle {
        self.schedule_at(Instant::now() + delay, event)
    }

    /// Schedule `event` to fire at `deadline`.
    pub fn schedule_at(&mut self, deadline: Instant, event: TimerEvent) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.pending.insert(id, event);
        TimerHandle(id)
    }

    /// Cancel a pending timer. Returns true if it had not yet fired.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.pending.remove(&handle.0).is_some()
    }

    /// Whether the timer behind `handle` is still pending.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.pending.contains_key(&handle.0)
    }

    /// Deadline of the earliest live timer, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Prune cancelled entries off the top first.
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.pending.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Drain every timer whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(event) = self.pending.remove(&id) {
                fired.push(event);
            }
        }
        fired
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServiceKey {
        ServiceKey::link_local("en0")
    }

    #[test]
    fn test_fire_order() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.schedule_at(
            now + Duration::from_secs(2),
            TimerEvent::Service {
                key: key(),
                kind: TimerKind::Solicit,
            },
        );
        timers.schedule_at(now + Duration::from_secs(1), TimerEvent::Poll);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));

        let fired = timers.pop_due(now + Duration::from_secs(1));
        assert_eq!(fired, vec![TimerEvent::Poll]);
        assert_eq!(timers.len(), 1);

        let fired = timers.pop_due(now + Duration::from_secs(3));
        assert_eq!(
            fired,
            vec![TimerEvent::Service {
                key: key(),
                kind: TimerKind::Solicit,
            }]
        );
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel_suppresses_fire() {
        let mut timers = Timers::new();
        let now = Instant::now();
        let handle = timers.schedule_at(now, TimerEvent::Poll);

        assert!(timers.is_pending(handle));
        assert!(timers.cancel(handle));
        assert!(!timers.is_pending(handle));
        // Cancelling twice is a no-op.
        assert!(!timers.cancel(handle));

        assert!(timers.pop_due(now + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_not_due_yet() {
        let mut timers = Timers::new();
        let now = Instant::now();
        timers.schedule_at(now + Duration::from_secs(5), TimerEvent::Poll);
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(timers.len(), 1);
    }
}
