use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;

const PURGE_THRESHOLD: usize = 4_096;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CounterStoreError {
    #[error("counter store unreachable: {0}")]
    Unavailable(String),
    #[error("counter store circuit open")]
    CircuitOpen,
}

pub type CounterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CounterStoreError>> + Send + 'a>>;

/// Shared counters backing admission and rate-limit state.
///
/// Keys expire after their TTL. `increment` only sets the TTL when it
/// creates the key.
pub trait CounterStore: Send + Sync {
    fn increment<'a>(&'a self, key: &'a str, delta: i64, ttl: Duration) -> CounterFuture<'a, i64>;
    fn get<'a>(&'a self, key: &'a str) -> CounterFuture<'a, Option<i64>>;
    fn set<'a>(&'a self, key: &'a str, value: i64, ttl: Duration) -> CounterFuture<'a, ()>;
    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> CounterFuture<'a, ()>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Instant,
}

/// Single-node counter store. `set_available(false)` simulates an outage.
#[derive(Debug)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()), available: AtomicBool::new(true) }
    }
}

impl MemoryCounterStore {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("counter store lock poisoned")
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    fn ensure_available(&self) -> Result<(), CounterStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CounterStoreError::Unavailable("memory store switched off".to_string()))
        }
    }

    fn increment_now(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CounterStoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("counter store lock poisoned");
        if entries.len() >= PURGE_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at <= now {
                    *entry = Entry { value: 0, expires_at: now + ttl };
                }
            })
            .or_insert(Entry { value: 0, expires_at: now + ttl });
        entry.value = entry.value.saturating_add(delta);
        Ok(entry.value)
    }

    fn get_now(&self, key: &str) -> Result<Option<i64>, CounterStoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("counter store lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_now(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterStoreError> {
        self.ensure_available()?;
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .expect("counter store lock poisoned")
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn expire_now(&self, key: &str, ttl: Duration) -> Result<(), CounterStoreError> {
        self.ensure_available()?;
        let expires_at = Instant::now() + ttl;
        if let Some(entry) = self.entries.lock().expect("counter store lock poisoned").get_mut(key) {
            entry.expires_at = expires_at;
        }
        Ok(())
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment<'a>(&'a self, key: &'a str, delta: i64, ttl: Duration) -> CounterFuture<'a, i64> {
        Box::pin(async move { self.increment_now(key, delta, ttl) })
    }

    fn get<'a>(&'a self, key: &'a str) -> CounterFuture<'a, Option<i64>> {
        Box::pin(async move { self.get_now(key) })
    }

    fn set<'a>(&'a self, key: &'a str, value: i64, ttl: Duration) -> CounterFuture<'a, ()> {
        Box::pin(async move { self.set_now(key, value, ttl) })
    }

    fn expire<'a>(&'a self, key: &'a str, ttl: Duration) -> CounterFuture<'a, ()> {
        Box::pin(async move { self.expire_now(key, ttl) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn increment_creates_and_accumulates() {
        let store = MemoryCounterStore::default();
        assert_eq!(store.increment("a", 1, TTL).await, Ok(1));
        assert_eq!(store.increment("a", 2, TTL).await, Ok(3));
        assert_eq!(store.increment("a", -1, TTL).await, Ok(2));
        assert_eq!(store.get("a").await, Ok(Some(2)));
        assert_eq!(store.get("missing").await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryCounterStore::default();
        store.set("k", 7, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(store.get("k").await, Ok(Some(7)));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(store.get("k").await, Ok(None));

        store.increment("k", 1, Duration::from_secs(1)).await.unwrap();
        store.expire("k", Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryCounterStore::default();
        store.set_available(false);
        assert!(matches!(store.increment("a", 1, TTL).await, Err(CounterStoreError::Unavailable(_))));
        assert!(store.get("a").await.is_err());
        assert!(store.set("a", 1, TTL).await.is_err());
        assert!(store.expire("a", TTL).await.is_err());

        store.set_available(true);
        assert_eq!(store.increment("a", 1, TTL).await, Ok(1));
    }
}
