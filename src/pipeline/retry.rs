//! In-memory failure counters with expiry.
//!
//! Counters are never persisted; a ban lifts when its entry expires or the
//! process restarts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    count: u32,
    last_failure: Instant,
}

/// Per-event failure counter. Once an event reaches `max_attempts` failures
/// it is banned from the pipeline until the entry expires.
pub struct RetryCounter {
    ttl: Duration,
    max_attempts: u32,
    inner: Mutex<HashMap<String, Entry>>,
}

impl RetryCounter {
    pub fn new(ttl: Duration, max_attempts: u32) -> Self {
        RetryCounter {
            ttl,
            max_attempts,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failure and return the updated count.
    pub fn record_failure(&self, event_id: &str) -> u32 {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, entry| now.duration_since(entry.last_failure) < self.ttl);

        let entry = inner.entry(event_id.to_string()).or_insert(Entry {
            count: 0,
            last_failure: now,
        });
        entry.count += 1;
        entry.last_failure = now;
        entry.count
    }

    /// Number of recorded failures for an event.
    pub fn attempts(&self, event_id: &str) -> u32 {
        let inner = self.inner.lock().unwrap();
        match inner.get(event_id) {
            Some(entry) if entry.last_failure.elapsed() < self.ttl => entry.count,
            _ => 0,
        }
    }

    /// Whether the event has exhausted its attempts.
    pub fn is_banned(&self, event_id: &str) -> bool {
        self.attempts(event_id) >= self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_failures() {
        let counter = RetryCounter::new(Duration::from_secs(60), 3);
        assert_eq!(counter.attempts("e1"), 0);
        assert_eq!(counter.record_failure("e1"), 1);
        assert_eq!(counter.record_failure("e1"), 2);
        assert_eq!(counter.attempts("e1"), 2);
        assert!(!counter.is_banned("e1"));
    }

    #[test]
    fn bans_after_max_attempts() {
        let counter = RetryCounter::new(Duration::from_secs(60), 3);
        for _ in 0..3 {
            counter.record_failure("e1");
        }
        assert!(counter.is_banned("e1"));
        assert!(!counter.is_banned("e2"));
    }

    #[test]
    fn entries_expire() {
        let counter = RetryCounter::new(Duration::from_millis(10), 2);
        counter.record_failure("e1");
        counter.record_failure("e1");
        assert!(counter.is_banned("e1"));

        std::thread::sleep(Duration::from_millis(20));
        assert!(!counter.is_banned("e1"));
        assert_eq!(counter.attempts("e1"), 0);

        // A new failure starts the count over.
        assert_eq!(counter.record_failure("e1"), 1);
    }
}
