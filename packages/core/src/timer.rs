//! Time source and scheduled retries.
//!
//! Retries are explicit entries in a [`TimerQueue`] rather than callbacks
//! that re-arm themselves. Deadlines are offsets from the [`Clock`] origin,
//! so tests can drive the whole daemon with a fake clock.

use std::thread;
use std::time::{Duration, Instant};

pub trait Clock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Blocks the calling thread.
    fn sleep(&self, duration: Duration);
}

/// Monotonic wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct Entry<E> {
    id: TimerId,
    deadline: Duration,
    event: E,
}

/// Pending timers, fired in deadline order.
#[derive(Debug)]
pub struct TimerQueue<E> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_at(&mut self, deadline: Duration, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            deadline,
            event,
        });
        id
    }

    /// Removes a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Takes the earliest timer whose deadline is not after `now`.
    ///
    /// Timers with equal deadlines fire in scheduling order.
    pub fn pop_due(&mut self, now: Duration) -> Option<(TimerId, E)> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| (e.deadline, e.id.0))
            .map(|(i, _)| i)?;
        let entry = self.entries.remove(index);
        Some((entry.id, entry.event))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule_at(secs(3), "late");
        queue.schedule_at(secs(1), "early");
        queue.schedule_at(secs(1), "early-second");

        assert_eq!(queue.next_deadline(), Some(secs(1)));
        assert_eq!(queue.pop_due(secs(0)), None);
        assert_eq!(queue.pop_due(secs(2)).map(|(_, e)| e), Some("early"));
        assert_eq!(queue.pop_due(secs(2)).map(|(_, e)| e), Some("early-second"));
        assert_eq!(queue.pop_due(secs(2)), None);
        assert_eq!(queue.pop_due(secs(3)).map(|(_, e)| e), Some("late"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut queue = TimerQueue::new();
        let a = queue.schedule_at(secs(1), 'a');
        let b = queue.schedule_at(secs(2), 'b');

        assert!(queue.cancel(a));
        assert!(!queue.cancel(a));
        assert!(!queue.is_armed(a));
        assert!(queue.is_armed(b));
        assert_eq!(queue.pop_due(secs(5)), Some((b, 'b')));
    }

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_millis(2));
        assert!(clock.now() > start);
    }
}
