//! Tracks the events that were handed to the destination but whose completion (success or
//! failure) has not been observed yet. The oldest tracked event bounds the watermark: every event
//! strictly older than it has already completed, one way or the other.
//!
//! ```text
//! (replay loop) --add--> [ in-flight set ] <--remove-- (completion tasks)
//!                               |
//!                            oldest
//!                               v
//!                       (watermark emitter)
//! ```
//!
//! A single coarse lock around an ordered set keeps every operation linearizable; completions
//! arrive from many tasks but each critical section is a single `BTreeSet` operation.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{Event, EventKey};

/// Cloneable handle over the shared in-flight set.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    entries: Arc<Mutex<BTreeSet<EventKey>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking the event. Adding an already tracked event is a no-op.
    pub fn add(&self, event: &Event) {
        self.entries.lock().insert(event.key());
    }

    /// Stops tracking the event. Removing an absent event is a no-op, so a duplicate completion
    /// signal leaves the set untouched.
    pub fn remove(&self, key: &EventKey) {
        self.entries.lock().remove(key);
    }

    /// Returns the oldest in-flight event, if any.
    pub fn peek_oldest(&self) -> Option<EventKey> {
        self.entries.lock().first().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Removes its event from the tracker exactly once, when dropped. The dispatcher moves the guard
/// into the completion task so the removal runs whether the send succeeds, fails, panics or the
/// task is aborted.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    tracker: InFlightTracker,
    key: EventKey,
}

impl InFlightGuard {
    /// Registers the event with the tracker and returns the guard owning its removal.
    pub(crate) fn register(tracker: &InFlightTracker, event: &Event) -> Self {
        tracker.add(event);
        InFlightGuard {
            tracker: tracker.clone(),
            key: event.key(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(timestamp: i64, sequence: u64) -> Event {
        Event::new(timestamp, format!("payload-{sequence}"), sequence)
    }

    #[test]
    fn test_empty_tracker() {
        let tracker = InFlightTracker::new();
        assert!(tracker.peek_oldest().is_none());
        assert!(tracker.is_empty());
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_oldest_follows_removals() {
        let tracker = InFlightTracker::new();
        let (e1, e2, e3) = (event(300, 3), event(100, 1), event(200, 2));
        tracker.add(&e1);
        tracker.add(&e2);
        tracker.add(&e3);
        assert_eq!(tracker.peek_oldest().map(|k| k.timestamp), Some(100));

        // out of order completion
        tracker.remove(&e3.key());
        assert_eq!(tracker.peek_oldest().map(|k| k.timestamp), Some(100));
        tracker.remove(&e2.key());
        assert_eq!(tracker.peek_oldest().map(|k| k.timestamp), Some(300));
        tracker.remove(&e1.key());
        assert!(tracker.peek_oldest().is_none());
    }

    #[test]
    fn test_same_timestamp_events_are_distinct() {
        let tracker = InFlightTracker::new();
        let (a, b) = (event(100, 1), event(100, 2));
        tracker.add(&a);
        tracker.add(&b);
        assert_eq!(tracker.len(), 2);
        tracker.remove(&a.key());
        assert_eq!(tracker.peek_oldest(), Some(b.key()));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tracker = InFlightTracker::new();
        let (a, b) = (event(100, 1), event(200, 2));
        tracker.add(&a);
        tracker.add(&b);

        tracker.remove(&a.key());
        let after_once = (tracker.len(), tracker.peek_oldest());
        tracker.remove(&a.key());
        assert_eq!((tracker.len(), tracker.peek_oldest()), after_once);

        // removing something never added is also fine
        tracker.remove(&event(50, 99).key());
        assert_eq!((tracker.len(), tracker.peek_oldest()), after_once);
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let tracker = InFlightTracker::new();
        let e = event(100, 1);
        let guard = InFlightGuard::register(&tracker, &e);
        assert_eq!(tracker.peek_oldest(), Some(e.key()));
        drop(guard);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let tracker = InFlightTracker::new();
        let events: Vec<Event> = (0..1000).map(|i| event(i as i64, i)).collect();
        for e in &events {
            tracker.add(e);
        }

        let handles: Vec<_> = events
            .chunks(100)
            .map(|chunk| {
                let tracker = tracker.clone();
                let keys: Vec<EventKey> = chunk.iter().map(Event::key).collect();
                std::thread::spawn(move || {
                    for key in keys.iter().rev() {
                        tracker.remove(key);
                        // a removed key must never be reported as the oldest
                        assert_ne!(tracker.peek_oldest(), Some(*key));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(tracker.is_empty());
    }
}
