use std::{
    collections::{HashMap, VecDeque},
    hash::Hash,
    sync::Mutex,
    time::Duration,
};

use tokio::time::Instant;
use uuid::Uuid;

/// Counters describing one sender's window for one resource.
///
/// A window opens at the sender's first request and lasts `window_ms`.
/// When it rolls over, its count becomes the carry, which fades out over
/// one window measured from the last request it allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowKeys {
    pub start: String,
    pub count: String,
    pub last: String,
    pub carry: String,
    pub carry_last: String,
}

impl WindowKeys {
    pub fn new(identity: Uuid, resource: &str) -> Self {
        let prefix = format!("rate:{identity}:{resource}");
        Self {
            start: format!("{prefix}:start"),
            count: format!("{prefix}:count"),
            last: format!("{prefix}:last"),
            carry: format!("{prefix}:carry"),
            carry_last: format!("{prefix}:carry-last"),
        }
    }
}

/// Whether a window opened at `start_ms` still covers `now_ms`.
pub fn window_open(start_ms: i64, now_ms: i64, window_ms: u64) -> bool {
    now_ms.saturating_sub(start_ms) < window_ms as i64
}

/// Sliding estimate: the carried count decays linearly with its age and
/// reaches zero one full window after its last request.
pub fn effective_count(carry: i64, carry_age_ms: i64, current: i64, window_ms: u64) -> f64 {
    let window_ms = window_ms.max(1) as f64;
    let remaining = (window_ms - carry_age_ms.max(0) as f64).max(0.0);
    carry.max(0) as f64 * remaining / window_ms + current.max(0) as f64
}

pub fn violations_key(identity: Uuid, resource: &str) -> String {
    format!("rate-violations:{identity}:{resource}")
}

/// Backoff applies to every resource of an identity.
pub fn backoff_key(identity: Uuid) -> String {
    format!("rate-backoff:{identity}")
}

/// In-process sliding log limiter for per-user limits that never leave
/// this node.
#[derive(Debug)]
pub struct SlidingWindowLimiter<K> {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<K, VecDeque<Instant>>>,
}

impl<K: Eq + Hash + Clone> SlidingWindowLimiter<K> {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests: max_requests.max(1), window, requests: Mutex::new(HashMap::new()) }
    }

    /// Records a request for `key`, or returns how long until one is allowed.
    pub fn check_at(&self, key: &K, now: Instant) -> Result<(), Duration> {
        let mut guard = self.requests.lock().expect("rate limiter lock poisoned");
        let entries = guard.entry(key.clone()).or_default();
        prune_old_requests(entries, now, self.window);

        if entries.len() >= self.max_requests {
            let retry_after = entries
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        entries.push_back(now);
        Ok(())
    }

    pub fn forget(&self, key: &K) {
        self.requests.lock().expect("rate limiter lock poisoned").remove(key);
    }

    #[cfg(test)]
    pub(crate) fn tracked_keys(&self) -> usize {
        self.requests.lock().expect("rate limiter lock poisoned").len()
    }
}

fn prune_old_requests(requests: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while requests.front().map(|entry| now.duration_since(*entry) >= window).unwrap_or(false) {
        requests.pop_front();
    }
}
