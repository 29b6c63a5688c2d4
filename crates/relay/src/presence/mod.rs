// Workspace presence: who is online, what they are doing, and TTL expiry for
// users whose sockets vanished without a clean close.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use erdsync_common::{
    protocol::ws::ServerMessage,
    types::{PresenceRecord, PresenceStatus},
};
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;
use uuid::Uuid;

use crate::{
    admission::rate_limit::SlidingWindowLimiter,
    config::PresenceConfig,
    error::CollabError,
    peer::{broadcast, Peer},
};

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    /// Latest client timestamp applied for this user, epoch millis.
    last_timestamp: i64,
}

#[derive(Debug, Default)]
struct WorkspacePresence {
    members: HashMap<Uuid, Peer>,
    records: HashMap<Uuid, PresenceEntry>,
}

impl WorkspacePresence {
    fn user_connected(&self, user_id: Uuid) -> bool {
        self.members.values().any(|peer| peer.user_id == user_id)
    }

    /// Drop stale records and tell everyone they left.
    fn expire_stale(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|(_, entry)| entry.record.is_stale(now, ttl))
            .map(|(user_id, _)| *user_id)
            .collect();

        for user_id in &stale {
            if let Some(entry) = self.records.remove(user_id) {
                debug!(user_id = %user_id, workspace_id = %entry.record.workspace_id, "presence expired");
                broadcast(self.members.values(), &ServerMessage::Leave(entry.record), None);
            }
        }
        stale.len()
    }

    fn roster(&self) -> Vec<PresenceRecord> {
        let mut roster: Vec<PresenceRecord> =
            self.records.values().map(|entry| entry.record.clone()).collect();
        roster.sort_by_key(|record| record.user_id);
        roster
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.records.is_empty()
    }
}

/// Result of joining a workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOutcome {
    pub record: PresenceRecord,
    /// Every fresh record in the workspace, the joiner included.
    pub roster: Vec<PresenceRecord>,
}

pub struct PresenceStore {
    ttl: chrono::Duration,
    limiter: SlidingWindowLimiter<(Uuid, Uuid)>,
    workspaces: RwLock<HashMap<Uuid, WorkspacePresence>>,
}

impl PresenceStore {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            ttl: chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::minutes(5)),
            limiter: SlidingWindowLimiter::new(config.update_max as usize, config.update_window),
            workspaces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn join(&self, workspace_id: Uuid, peer: Peer) -> JoinOutcome {
        self.join_at(workspace_id, peer, Utc::now()).await
    }

    /// Register `peer`, mark its user ONLINE and announce it to the others.
    ///
    /// Stale records are expired first so the joiner never sees them.
    pub async fn join_at(&self, workspace_id: Uuid, peer: Peer, now: DateTime<Utc>) -> JoinOutcome {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces.entry(workspace_id).or_default();
        workspace.expire_stale(now, self.ttl);

        let user_id = peer.user_id;
        let connection_id = peer.connection_id;
        let record = PresenceRecord::online(workspace_id, user_id, now);
        let last_timestamp = workspace
            .records
            .get(&user_id)
            .map_or(now.timestamp_millis(), |entry| entry.last_timestamp.max(now.timestamp_millis()));
        workspace
            .records
            .insert(user_id, PresenceEntry { record: record.clone(), last_timestamp });
        workspace.members.insert(connection_id, peer);

        broadcast(
            workspace.members.values(),
            &ServerMessage::Join(record.clone()),
            Some(connection_id),
        );

        JoinOutcome { record, roster: workspace.roster() }
    }

    pub async fn update_status(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        status: PresenceStatus,
        timestamp: Option<i64>,
    ) -> Result<(), CollabError> {
        self.update_status_at(workspace_id, user_id, status, timestamp, Utc::now()).await
    }

    /// Apply an explicit status change.
    ///
    /// Changes stamped earlier than the last applied one are dropped so peers
    /// observe a user's statuses in timestamp order.
    pub async fn update_status_at(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        status: PresenceStatus,
        timestamp: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), CollabError> {
        let mut workspaces = self.workspaces.write().await;
        let Some(workspace) = workspaces.get_mut(&workspace_id) else {
            return Ok(());
        };
        if !workspace.user_connected(user_id) {
            return Ok(());
        }

        if let Err(retry_after) = self.limiter.check_at(&(workspace_id, user_id), Instant::now()) {
            return Err(CollabError::RateLimitExceeded {
                resource: "presence".to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        let stamp = timestamp.unwrap_or_else(|| now.timestamp_millis());
        let entry = workspace.records.entry(user_id).or_insert_with(|| PresenceEntry {
            record: PresenceRecord::online(workspace_id, user_id, now),
            last_timestamp: i64::MIN,
        });
        if stamp < entry.last_timestamp {
            debug!(user_id = %user_id, stamp, last = entry.last_timestamp, "dropping out-of-order presence");
            return Ok(());
        }

        entry.last_timestamp = stamp;
        entry.record.status = status;
        entry.record.last_active_at = now;
        let message = ServerMessage::Presence(entry.record.clone());
        broadcast(workspace.members.values(), &message, None);
        Ok(())
    }

    /// Refresh a user's activity without announcing it.
    pub async fn touch(&self, workspace_id: Uuid, user_id: Uuid) {
        self.touch_at(workspace_id, user_id, Utc::now()).await;
    }

    pub async fn touch_at(&self, workspace_id: Uuid, user_id: Uuid, now: DateTime<Utc>) {
        let mut workspaces = self.workspaces.write().await;
        if let Some(entry) = workspaces
            .get_mut(&workspace_id)
            .and_then(|workspace| workspace.records.get_mut(&user_id))
        {
            if now > entry.record.last_active_at {
                entry.record.last_active_at = now;
            }
        }
    }

    /// Deregister one connection. The user's record is removed, and LEAVE
    /// broadcast, only when that was their last connection.
    pub async fn leave(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Option<PresenceRecord> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = workspaces.get_mut(&workspace_id)?;
        workspace.members.remove(&connection_id)?;

        let mut departed = None;
        if !workspace.user_connected(user_id) {
            if let Some(entry) = workspace.records.remove(&user_id) {
                broadcast(workspace.members.values(), &ServerMessage::Leave(entry.record.clone()), None);
                departed = Some(entry.record);
            }
            self.limiter.forget(&(workspace_id, user_id));
        }

        if workspace.is_empty() {
            workspaces.remove(&workspace_id);
        }
        departed
    }

    pub async fn roster(&self, workspace_id: Uuid) -> Vec<PresenceRecord> {
        self.roster_at(workspace_id, Utc::now()).await
    }

    /// Fresh records only; stale ones are withheld until the next sweep.
    pub async fn roster_at(&self, workspace_id: Uuid, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        let workspaces = self.workspaces.read().await;
        workspaces
            .get(&workspace_id)
            .map(|workspace| {
                workspace
                    .roster()
                    .into_iter()
                    .filter(|record| !record.is_stale(now, self.ttl))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Utc::now()).await
    }

    /// Expire stale records across all workspaces; returns how many left.
    pub async fn sweep_stale_at(&self, now: DateTime<Utc>) -> usize {
        let mut workspaces = self.workspaces.write().await;
        let mut expired = 0;
        for workspace in workspaces.values_mut() {
            expired += workspace.expire_stale(now, self.ttl);
        }
        workspaces.retain(|_, workspace| !workspace.is_empty());
        expired
    }

    pub async fn member_count(&self, workspace_id: Uuid) -> usize {
        self.workspaces.read().await.get(&workspace_id).map_or(0, |workspace| workspace.members.len())
    }
}
