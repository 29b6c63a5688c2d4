// Admission control: per-workspace connection caps and per-sender rate
// limits, both backed by a shared counter store.

pub mod breaker;
pub mod counter_store;
pub mod rate_limit;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::RateLimitConfig, error::CollabError, metrics::RelayMetrics};

use self::{
    breaker::CircuitBreaker,
    counter_store::{CounterFuture, CounterStore, CounterStoreError},
    rate_limit::{backoff_key, effective_count, violations_key, window_open, WindowKeys},
};

/// Safety net for capacity counters leaked by a crashed node.
const CAPACITY_KEY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedPolicy {
    /// Admit and log when the counter store is down.
    FailOpen,
    /// Refuse with `StorageUnavailable` when the counter store is down.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

/// Local view of one workspace's slots.
#[derive(Debug, Default)]
struct WorkspaceSlots {
    /// Connection id to user id.
    members: HashMap<Uuid, Uuid>,
    /// Admissions minus releases the shared counter has not recorded yet.
    unsynced: i64,
}

impl WorkspaceSlots {
    fn is_idle(&self) -> bool {
        self.members.is_empty() && self.unsynced == 0
    }
}

pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    breaker: CircuitBreaker,
    metrics: Arc<RelayMetrics>,
    max_clients_per_workspace: usize,
    rate: RateLimitConfig,
    policy: DegradedPolicy,
    workspaces: Mutex<HashMap<Uuid, WorkspaceSlots>>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn CounterStore>,
        metrics: Arc<RelayMetrics>,
        max_clients_per_workspace: usize,
        rate: RateLimitConfig,
        policy: DegradedPolicy,
    ) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::default(),
            metrics,
            max_clients_per_workspace,
            rate,
            policy,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn max_clients_per_workspace(&self) -> usize {
        self.max_clients_per_workspace
    }

    /// Reserve a slot for `connection_id` in the workspace.
    ///
    /// Re-checking an already admitted connection is a no-op. The cap holds
    /// against both the shared counter and this node's own members, so
    /// admissions made while the store was down still count after it recovers.
    pub async fn check_workspace_capacity(
        &self,
        workspace_id: Uuid,
        connection_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), CollabError> {
        if self.is_admitted(workspace_id, connection_id) {
            return Ok(());
        }

        let limit = self.max_clients_per_workspace;
        let key = capacity_key(workspace_id);
        self.settle(workspace_id).await;

        match self.guarded(self.store.increment(&key, 1, CAPACITY_KEY_TTL)).await {
            Ok(count) => {
                let (members, unsynced) = self.local_slots(workspace_id);
                let local = members as i64 + 1;
                if count.max(local) > limit as i64 {
                    self.rollback(workspace_id, &key).await;
                    self.metrics.record_admission_rejection("capacity");
                    return Err(CollabError::CapacityExceeded { workspace_id, limit });
                }
                if count < local && unsynced == 0 {
                    self.reseed(workspace_id, &key, local - count).await;
                }

                let mut workspaces = self.workspaces.lock().expect("admission lock poisoned");
                workspaces.entry(workspace_id).or_default().members.insert(connection_id, user_id);
                Ok(())
            }
            Err(error) => {
                if let Err(refusal) = self.degraded("capacity", &error) {
                    self.metrics.record_admission_rejection("storage");
                    return Err(refusal);
                }

                let mut workspaces = self.workspaces.lock().expect("admission lock poisoned");
                let slots = workspaces.entry(workspace_id).or_default();
                if slots.members.len() >= limit {
                    if slots.is_idle() {
                        workspaces.remove(&workspace_id);
                    }
                    self.metrics.record_admission_rejection("capacity");
                    return Err(CollabError::CapacityExceeded { workspace_id, limit });
                }
                slots.members.insert(connection_id, user_id);
                slots.unsynced += 1;
                Ok(())
            }
        }
    }

    /// Give back the slot held by `connection_id`. Safe to call repeatedly.
    ///
    /// A decrement the store refuses is remembered and replayed by the next
    /// admission into the workspace.
    pub async fn release(&self, workspace_id: Uuid, connection_id: Uuid) {
        {
            let mut workspaces = self.workspaces.lock().expect("admission lock poisoned");
            let Some(slots) = workspaces.get_mut(&workspace_id) else {
                return;
            };
            if slots.members.remove(&connection_id).is_none() {
                return;
            }
            if slots.unsynced > 0 {
                // The store never saw this admission.
                slots.unsynced -= 1;
                if slots.is_idle() {
                    workspaces.remove(&workspace_id);
                }
                return;
            }
        }

        let key = capacity_key(workspace_id);
        match self.guarded(self.store.increment(&key, -1, CAPACITY_KEY_TTL)).await {
            Ok(count) if count < 0 => self.clamp(workspace_id, &key).await,
            Ok(_) => {}
            Err(error) => {
                warn!(
                    workspace_id = %workspace_id,
                    connection_id = %connection_id,
                    error = %error,
                    "failed to release capacity slot; will retry on next admission"
                );
                self.adjust_unsynced(workspace_id, -1);
            }
        }

        let mut workspaces = self.workspaces.lock().expect("admission lock poisoned");
        if workspaces.get(&workspace_id).is_some_and(WorkspaceSlots::is_idle) {
            workspaces.remove(&workspace_id);
        }
    }

    pub fn is_admitted(&self, workspace_id: Uuid, connection_id: Uuid) -> bool {
        self.workspaces
            .lock()
            .expect("admission lock poisoned")
            .get(&workspace_id)
            .is_some_and(|slots| slots.members.contains_key(&connection_id))
    }

    pub fn workspace_connection_count(&self, workspace_id: Uuid) -> usize {
        self.workspaces
            .lock()
            .expect("admission lock poisoned")
            .get(&workspace_id)
            .map_or(0, |slots| slots.members.len())
    }

    /// Distinct users holding a slot in the workspace.
    pub fn workspace_members(&self, workspace_id: Uuid) -> Vec<Uuid> {
        let workspaces = self.workspaces.lock().expect("admission lock poisoned");
        let mut users: Vec<Uuid> = workspaces
            .get(&workspace_id)
            .map(|slots| slots.members.values().copied().collect())
            .unwrap_or_default();
        users.sort();
        users.dedup();
        users
    }

    fn local_slots(&self, workspace_id: Uuid) -> (usize, i64) {
        self.workspaces
            .lock()
            .expect("admission lock poisoned")
            .get(&workspace_id)
            .map_or((0, 0), |slots| (slots.members.len(), slots.unsynced))
    }

    /// Replay admissions and releases the store missed while it was down.
    async fn settle(&self, workspace_id: Uuid) {
        let pending = self
            .workspaces
            .lock()
            .expect("admission lock poisoned")
            .get(&workspace_id)
            .map_or(0, |slots| slots.unsynced);
        if pending == 0 {
            return;
        }

        let key = capacity_key(workspace_id);
        match self.guarded(self.store.increment(&key, pending, CAPACITY_KEY_TTL)).await {
            Ok(count) => {
                self.adjust_unsynced(workspace_id, -pending);
                if count < 0 {
                    self.clamp(workspace_id, &key).await;
                } else if let Err(error) = self.guarded(self.store.expire(&key, CAPACITY_KEY_TTL)).await {
                    debug!(workspace_id = %workspace_id, error = %error, "failed to refresh capacity ttl");
                }
                debug!(workspace_id = %workspace_id, pending, count, "capacity counter reconciled");
            }
            Err(error) => {
                debug!(workspace_id = %workspace_id, pending, error = %error, "capacity counter still unreachable");
            }
        }
    }

    /// Undo a reservation that went over the cap.
    async fn rollback(&self, workspace_id: Uuid, key: &str) {
        if let Err(error) = self.guarded(self.store.increment(key, -1, CAPACITY_KEY_TTL)).await {
            warn!(workspace_id = %workspace_id, error = %error, "failed to roll back capacity reservation");
            self.adjust_unsynced(workspace_id, -1);
        }
    }

    /// The counter holds fewer slots than this node alone, e.g. after the
    /// key expired under live connections.
    async fn reseed(&self, workspace_id: Uuid, key: &str, missing: i64) {
        match self.guarded(self.store.increment(key, missing, CAPACITY_KEY_TTL)).await {
            Ok(count) => {
                debug!(workspace_id = %workspace_id, missing, count, "capacity counter reseeded");
                if let Err(error) = self.guarded(self.store.expire(key, CAPACITY_KEY_TTL)).await {
                    debug!(workspace_id = %workspace_id, error = %error, "failed to refresh capacity ttl");
                }
            }
            Err(error) => {
                debug!(workspace_id = %workspace_id, error = %error, "failed to reseed capacity counter");
                self.adjust_unsynced(workspace_id, missing);
            }
        }
    }

    async fn clamp(&self, workspace_id: Uuid, key: &str) {
        if let Err(error) = self.guarded(self.store.set(key, 0, CAPACITY_KEY_TTL)).await {
            debug!(workspace_id = %workspace_id, error = %error, "failed to clamp capacity counter");
        }
    }

    fn adjust_unsynced(&self, workspace_id: Uuid, delta: i64) {
        let mut workspaces = self.workspaces.lock().expect("admission lock poisoned");
        let slots = workspaces.entry(workspace_id).or_default();
        slots.unsynced += delta;
        if slots.is_idle() {
            workspaces.remove(&workspace_id);
        }
    }

    pub async fn check_rate(&self, identity: Uuid, resource: &str) -> Result<(), CollabError> {
        self.check_rate_at(identity, resource, crate::now_ms()).await
    }

    pub async fn check_rate_at(
        &self,
        identity: Uuid,
        resource: &str,
        now_ms: u64,
    ) -> Result<(), CollabError> {
        match self.rate_decision(identity, resource, now_ms).await {
            Ok(RateDecision::Allowed) => Ok(()),
            Ok(RateDecision::Limited { retry_after_ms }) => {
                self.metrics.record_admission_rejection("rate");
                Err(CollabError::RateLimitExceeded { resource: resource.to_string(), retry_after_ms })
            }
            Err(error) => self.degraded("rate", &error).inspect_err(|_| {
                self.metrics.record_admission_rejection("storage");
            }),
        }
    }

    async fn rate_decision(
        &self,
        identity: Uuid,
        resource: &str,
        now_ms: u64,
    ) -> Result<RateDecision, CounterStoreError> {
        let window_ms = self.rate.window.as_millis() as u64;
        let backoff_ms = window_ms.saturating_mul(u64::from(self.rate.backoff_multiplier));

        let backoff = backoff_key(identity);
        if let Some(until) = self.guarded(self.store.get(&backoff)).await? {
            let until = until.max(0) as u64;
            if until > now_ms {
                return Ok(RateDecision::Limited { retry_after_ms: until - now_ms });
            }
        }

        let now = i64::try_from(now_ms).unwrap_or(i64::MAX);
        let window_ttl = self.rate.window * 2;
        let keys = WindowKeys::new(identity, resource);

        let start = match self.guarded(self.store.get(&keys.start)).await? {
            Some(start) if window_open(start, now, window_ms) => start,
            expired => {
                if let Some(start) = expired {
                    let count = self.guarded(self.store.get(&keys.count)).await?.unwrap_or(0);
                    let last = self.guarded(self.store.get(&keys.last)).await?.unwrap_or(start);
                    self.guarded(self.store.set(&keys.carry, count, window_ttl)).await?;
                    self.guarded(self.store.set(&keys.carry_last, last, window_ttl)).await?;
                }
                self.guarded(self.store.set(&keys.start, now, window_ttl)).await?;
                self.guarded(self.store.set(&keys.count, 0, window_ttl)).await?;
                now
            }
        };

        let current = self.guarded(self.store.increment(&keys.count, 1, window_ttl)).await?;
        let carry = self.guarded(self.store.get(&keys.carry)).await?.unwrap_or(0);
        let carry_age = if carry > 0 {
            match self.guarded(self.store.get(&keys.carry_last)).await? {
                Some(last) => now.saturating_sub(last),
                None => window_ms as i64,
            }
        } else {
            0
        };

        let effective = effective_count(carry, carry_age, current - 1, window_ms);
        if effective < self.rate.max_requests as f64 {
            self.guarded(self.store.set(&keys.last, now, window_ttl)).await?;
            return Ok(RateDecision::Allowed);
        }

        self.guarded(self.store.increment(&keys.count, -1, window_ttl)).await?;
        let violations_key = violations_key(identity, resource);
        let violations = self
            .guarded(self.store.increment(&violations_key, 1, Duration::from_millis(backoff_ms.max(1))))
            .await?;

        if violations >= i64::from(self.rate.error_threshold) {
            let until = now_ms.saturating_add(backoff_ms);
            self.guarded(self.store.set(&backoff, until as i64, Duration::from_millis(backoff_ms.max(1))))
                .await?;
            self.guarded(self.store.set(&violations_key, 0, self.rate.window)).await?;
            warn!(
                identity = %identity,
                resource,
                violations,
                backoff_ms,
                "rate limit backoff engaged"
            );
            return Ok(RateDecision::Limited { retry_after_ms: backoff_ms });
        }

        let elapsed = now.saturating_sub(start).clamp(0, window_ms as i64) as u64;
        Ok(RateDecision::Limited { retry_after_ms: (window_ms - elapsed).max(1) })
    }

    async fn guarded<T>(&self, call: CounterFuture<'_, T>) -> Result<T, CounterStoreError> {
        if !self.breaker.allow() {
            return Err(CounterStoreError::CircuitOpen);
        }
        match call.await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(error) => {
                self.breaker.record_failure();
                Err(error)
            }
        }
    }

    fn degraded(&self, check: &'static str, error: &CounterStoreError) -> Result<(), CollabError> {
        match self.policy {
            DegradedPolicy::FailOpen => {
                self.metrics.record_degraded_decision(true);
                warn!(check, error = %error, "counter store unavailable; admitting in degraded mode");
                Ok(())
            }
            DegradedPolicy::FailClosed => {
                self.metrics.record_degraded_decision(false);
                warn!(check, error = %error, "counter store unavailable; refusing");
                Err(CollabError::StorageUnavailable(error.to_string()))
            }
        }
    }
}

fn capacity_key(workspace_id: Uuid) -> String {
    format!("workspace-connections:{workspace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::counter_store::MemoryCounterStore;

    const WINDOW_START: u64 = 1_700_000_010_000;

    fn controller(
        store: Arc<MemoryCounterStore>,
        max_clients: usize,
        rate: RateLimitConfig,
        policy: DegradedPolicy,
    ) -> AdmissionController {
        AdmissionController::new(store, Arc::new(RelayMetrics::default()), max_clients, rate, policy)
    }

    fn rate(max_requests: u64) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests,
            backoff_multiplier: 2,
            error_threshold: 5,
        }
    }

    #[tokio::test]
    async fn twenty_sixth_connection_is_rejected_until_one_leaves() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(store, 25, rate(1_000), DegradedPolicy::FailClosed);
        let workspace_id = Uuid::new_v4();
        let connections: Vec<Uuid> = (0..25).map(|_| Uuid::new_v4()).collect();

        for connection_id in &connections {
            admission
                .check_workspace_capacity(workspace_id, *connection_id, Uuid::new_v4())
                .await
                .expect("connection within cap should be admitted");
        }

        let extra = Uuid::new_v4();
        let error = admission
            .check_workspace_capacity(workspace_id, extra, Uuid::new_v4())
            .await
            .expect_err("26th connection should be rejected");
        assert_eq!(error, CollabError::CapacityExceeded { workspace_id, limit: 25 });

        admission.release(workspace_id, connections[0]).await;
        admission
            .check_workspace_capacity(workspace_id, extra, Uuid::new_v4())
            .await
            .expect("slot freed by a closed connection should be reusable");
        assert_eq!(admission.workspace_connection_count(workspace_id), 25);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(Arc::clone(&store), 2, rate(1_000), DegradedPolicy::FailClosed);
        let workspace_id = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        admission.check_workspace_capacity(workspace_id, first, Uuid::new_v4()).await.unwrap();
        admission.check_workspace_capacity(workspace_id, second, Uuid::new_v4()).await.unwrap();

        admission.release(workspace_id, first).await;
        admission.release(workspace_id, first).await;
        admission.release(workspace_id, first).await;

        assert_eq!(store.get(&capacity_key(workspace_id)).await, Ok(Some(1)));
        assert_eq!(admission.workspace_connection_count(workspace_id), 1);
    }

    #[tokio::test]
    async fn readmitting_same_connection_does_not_double_count() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(Arc::clone(&store), 5, rate(1_000), DegradedPolicy::FailClosed);
        let workspace_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        admission.check_workspace_capacity(workspace_id, connection_id, user_id).await.unwrap();
        admission.check_workspace_capacity(workspace_id, connection_id, user_id).await.unwrap();

        assert_eq!(store.get(&capacity_key(workspace_id)).await, Ok(Some(1)));
        assert_eq!(admission.workspace_members(workspace_id), vec![user_id]);
    }

    #[tokio::test]
    async fn hundred_messages_pass_and_the_next_is_rejected_until_the_window_elapses() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(store, 25, rate(100), DegradedPolicy::FailClosed);
        let user = Uuid::new_v4();

        for offset in 0..100 {
            admission
                .check_rate_at(user, "update", WINDOW_START + offset)
                .await
                .expect("messages within the limit should pass");
        }

        let error = admission
            .check_rate_at(user, "update", WINDOW_START + 100)
            .await
            .expect_err("101st message should be rejected");
        assert!(matches!(error, CollabError::RateLimitExceeded { ref resource, .. } if resource == "update"));

        admission
            .check_rate_at(user, "cursor", WINDOW_START + 100)
            .await
            .expect("other resources keep their own window");

        admission
            .check_rate_at(user, "update", WINDOW_START + 60_000)
            .await
            .expect("message after the window elapses should pass");
    }

    #[tokio::test]
    async fn burst_at_window_start_clears_one_window_later() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(store, 25, rate(100), DegradedPolicy::FailClosed);
        let user = Uuid::new_v4();
        let aligned = 1_700_000_040_000;

        for _ in 0..100 {
            admission.check_rate_at(user, "update", aligned).await.unwrap();
        }
        let error = admission.check_rate_at(user, "update", aligned).await.unwrap_err();
        assert_eq!(
            error,
            CollabError::RateLimitExceeded { resource: "update".to_string(), retry_after_ms: 60_000 }
        );

        admission
            .check_rate_at(user, "update", aligned + 59_999)
            .await
            .expect_err("still inside the window");
        admission
            .check_rate_at(user, "update", aligned + 60_000)
            .await
            .expect("a full window after the burst the sender is clear");
    }

    #[tokio::test]
    async fn burst_late_in_a_window_still_counts_against_the_next() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(store, 25, rate(100), DegradedPolicy::FailClosed);
        let user = Uuid::new_v4();

        admission.check_rate_at(user, "update", WINDOW_START).await.unwrap();
        for _ in 0..99 {
            admission.check_rate_at(user, "update", WINDOW_START + 59_000).await.unwrap();
        }

        let mut admitted = 0;
        for _ in 0..3 {
            if admission.check_rate_at(user, "update", WINDOW_START + 60_000).await.is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2, "a burst 1s old leaves room for two more");

        admission
            .check_rate_at(user, "update", WINDOW_START + 59_000 + 60_000)
            .await
            .expect("the burst has fully decayed");
    }

    #[tokio::test]
    async fn repeated_violations_trigger_backoff_across_resources() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(store, 25, rate(1), DegradedPolicy::FailClosed);
        let user = Uuid::new_v4();
        let now = WINDOW_START;

        admission.check_rate_at(user, "presence", now).await.unwrap();
        for attempt in 0..4 {
            let error = admission.check_rate_at(user, "presence", now + attempt).await.unwrap_err();
            assert!(matches!(error, CollabError::RateLimitExceeded { .. }));
        }

        let error = admission.check_rate_at(user, "presence", now + 10).await.unwrap_err();
        assert_eq!(
            error,
            CollabError::RateLimitExceeded { resource: "presence".to_string(), retry_after_ms: 120_000 }
        );

        // Window state has recovered but backoff still holds, for any resource.
        let during_backoff = now + 60_000 * 2;
        assert!(admission.check_rate_at(user, "cursor", during_backoff).await.is_err());

        let after_backoff = now + 10 + 120_000;
        admission
            .check_rate_at(user, "presence", after_backoff)
            .await
            .expect("backoff should lift at its deadline");
    }

    #[tokio::test]
    async fn unavailable_store_fails_open_outside_production() {
        let store = Arc::new(MemoryCounterStore::default());
        store.set_available(false);
        let admission = controller(Arc::clone(&store), 1, rate(1), DegradedPolicy::FailOpen);
        let workspace_id = Uuid::new_v4();

        admission
            .check_workspace_capacity(workspace_id, Uuid::new_v4(), Uuid::new_v4())
            .await
            .expect("degraded mode should admit");
        admission.check_rate(Uuid::new_v4(), "update").await.expect("degraded mode should allow");

        let error = admission
            .check_workspace_capacity(workspace_id, Uuid::new_v4(), Uuid::new_v4())
            .await
            .expect_err("local cap still applies in degraded mode");
        assert!(matches!(error, CollabError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn degraded_admissions_count_once_the_store_recovers() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(Arc::clone(&store), 2, rate(1_000), DegradedPolicy::FailOpen)
            .with_breaker(CircuitBreaker::new(100, Duration::from_secs(30)));
        let workspace_id = Uuid::new_v4();

        store.set_available(false);
        for _ in 0..2 {
            admission
                .check_workspace_capacity(workspace_id, Uuid::new_v4(), Uuid::new_v4())
                .await
                .expect("degraded mode admits within the local cap");
        }
        store.set_available(true);

        for attempt in ["third", "fourth"] {
            let error = admission
                .check_workspace_capacity(workspace_id, Uuid::new_v4(), Uuid::new_v4())
                .await
                .expect_err(attempt);
            assert_eq!(error, CollabError::CapacityExceeded { workspace_id, limit: 2 });
        }
        assert_eq!(admission.workspace_connection_count(workspace_id), 2);
        assert_eq!(store.get(&capacity_key(workspace_id)).await, Ok(Some(2)));
    }

    #[tokio::test]
    async fn release_lost_during_outage_is_replayed() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(Arc::clone(&store), 2, rate(1_000), DegradedPolicy::FailOpen);
        let workspace_id = Uuid::new_v4();
        let first = Uuid::new_v4();

        admission.check_workspace_capacity(workspace_id, first, Uuid::new_v4()).await.unwrap();
        store.set_available(false);
        admission.release(workspace_id, first).await;
        store.set_available(true);
        assert_eq!(store.get(&capacity_key(workspace_id)).await, Ok(Some(1)));

        for _ in 0..2 {
            admission
                .check_workspace_capacity(workspace_id, Uuid::new_v4(), Uuid::new_v4())
                .await
                .expect("the leaked slot is given back");
        }
        assert_eq!(store.get(&capacity_key(workspace_id)).await, Ok(Some(2)));
        assert!(!admission.is_admitted(workspace_id, first));
    }

    #[tokio::test]
    async fn releasing_degraded_admissions_leaves_no_debt() {
        let store = Arc::new(MemoryCounterStore::default());
        let admission = controller(Arc::clone(&store), 2, rate(1_000), DegradedPolicy::FailOpen);
        let workspace_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();

        store.set_available(false);
        admission.check_workspace_capacity(workspace_id, connection_id, Uuid::new_v4()).await.unwrap();
        admission.release(workspace_id, connection_id).await;
        store.set_available(true);

        admission.check_workspace_capacity(workspace_id, Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        assert_eq!(store.get(&capacity_key(workspace_id)).await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_closed_in_production() {
        let store = Arc::new(MemoryCounterStore::default());
        store.set_available(false);
        let admission = controller(store, 25, rate(100), DegradedPolicy::FailClosed);

        let error = admission
            .check_workspace_capacity(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await
            .expect_err("production policy should refuse");
        assert!(matches!(error, CollabError::StorageUnavailable(_)));
        assert!(matches!(
            admission.check_rate(Uuid::new_v4(), "cursor").await,
            Err(CollabError::StorageUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn open_breaker_skips_the_store() {
        let store = Arc::new(MemoryCounterStore::default());
        store.set_available(false);
        let admission = controller(Arc::clone(&store), 25, rate(100), DegradedPolicy::FailOpen)
            .with_breaker(CircuitBreaker::new(3, Duration::from_secs(30)));
        let user = Uuid::new_v4();

        for _ in 0..3 {
            admission.check_rate_at(user, "update", WINDOW_START).await.unwrap();
        }
        store.set_available(true);

        admission.check_rate_at(user, "update", WINDOW_START).await.unwrap();
        assert_eq!(
            store.get(&WindowKeys::new(user, "update").start).await,
            Ok(None),
            "breaker should short-circuit while open"
        );
    }
}
