//! Duplicate-reply suppression.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Entries kept before stale keys are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Identity of a reply for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Sending tenant alias.
    pub alias: String,
    /// Target room.
    pub room: String,
    /// Reply text.
    pub message: String,
}

/// Drops identical replies sent within `interval` of each other.
#[derive(Debug)]
pub struct ReplyRateLimiter {
    interval: Duration,
    last_sent: Mutex<HashMap<RateLimitKey, Instant>>,
}

impl ReplyRateLimiter {
    /// Limiter enforcing `interval` between identical replies.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a reply with `key` may be sent now.
    pub fn allow(&self, key: RateLimitKey) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Whether a reply with `key` may be sent at `now`. An allowed reply
    /// starts a new interval.
    pub fn allow_at(&self, key: RateLimitKey, now: Instant) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        if last_sent
            .get(&key)
            .is_some_and(|sent| now.saturating_duration_since(*sent) < self.interval)
        {
            return false;
        }
        if last_sent.len() >= PRUNE_THRESHOLD {
            let interval = self.interval;
            last_sent.retain(|_, sent| now.saturating_duration_since(*sent) < interval);
        }
        last_sent.insert(key, now);
        true
    }
}
