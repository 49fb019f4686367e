//! Duplicate and replay suppression for inbound events.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Message ids seen within a sliding window.
#[derive(Debug)]
pub(crate) struct SeenMessages {
    window: Duration,
    seen: HashMap<String, Instant>,
    last_purge: Instant,
}

impl SeenMessages {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            last_purge: Instant::now(),
        }
    }

    /// Record `id`. Returns `false` if it was already seen inside the window.
    pub fn insert(&mut self, id: &str) -> bool {
        self.insert_at(id, Instant::now())
    }

    pub fn insert_at(&mut self, id: &str, now: Instant) -> bool {
        if now.duration_since(self.last_purge) >= self.window.min(Duration::from_secs(60)) {
            let window = self.window;
            self.seen.retain(|_, at| now.duration_since(*at) < window);
            self.last_purge = now;
        }

        match self.seen.get(id) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                self.seen.insert(id.to_string(), now);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Whether an event is old enough to be history replay.
pub(crate) fn is_stale(timestamp: DateTime<Utc>, now: DateTime<Utc>, max_age_secs: u64) -> bool {
    let age = now.signed_duration_since(timestamp).num_seconds();
    age > i64::try_from(max_age_secs).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window() {
        let mut seen = SeenMessages::new(Duration::from_secs(3600));
        let t0 = Instant::now();
        assert!(seen.insert_at("1", t0));
        assert!(!seen.insert_at("1", t0 + Duration::from_secs(10)));
        assert!(seen.insert_at("2", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_expired_id_accepted_again() {
        let mut seen = SeenMessages::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(seen.insert_at("1", t0));
        assert!(seen.insert_at("1", t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_purge_drops_expired() {
        let mut seen = SeenMessages::new(Duration::from_secs(5));
        let t0 = Instant::now();
        seen.insert_at("a", t0);
        seen.insert_at("b", t0);
        seen.insert_at("c", t0 + Duration::from_secs(10));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        assert!(!is_stale(now - chrono::Duration::seconds(30), now, 60));
        assert!(is_stale(now - chrono::Duration::seconds(61), now, 60));
        // Clock skew into the future is not stale.
        assert!(!is_stale(now + chrono::Duration::seconds(5), now, 60));
    }
}
