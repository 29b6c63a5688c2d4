// Cursor relay: throttled, last-write-wins pointer broadcast scoped to a
// workspace. Nothing here is persisted.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Duration,
};

use erdsync_common::{
    protocol::ws::{CursorBroadcast, CursorLeave, ServerMessage},
    types::CursorPosition,
};
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    config::CursorConfig,
    error::CollabError,
    peer::{broadcast, Peer},
};

#[derive(Debug, Clone)]
struct CursorState {
    user_id: Uuid,
    position: CursorPosition,
    timestamp: i64,
    last_active: Instant,
    /// A trailing flush is scheduled for this cursor.
    flush_pending: bool,
}

#[derive(Debug, Default)]
struct WorkspaceCursors {
    members: HashMap<Uuid, Peer>,
    cursors: HashMap<Uuid, CursorState>,
}

struct CursorInner {
    throttle: Duration,
    timeout: Duration,
    max_cursors: usize,
    workspaces: RwLock<HashMap<Uuid, WorkspaceCursors>>,
    token: CancellationToken,
}

/// Broadcasts at most one position per connection per throttle window.
///
/// The first move of a window schedules a flush at the end of it; moves
/// arriving meanwhile only replace the pending position.
#[derive(Clone)]
pub struct CursorRelay {
    inner: Arc<CursorInner>,
}

impl CursorRelay {
    pub fn new(config: &CursorConfig, max_cursors: usize, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(CursorInner {
                throttle: config.throttle_window,
                timeout: config.timeout,
                max_cursors,
                workspaces: RwLock::new(HashMap::new()),
                token,
            }),
        }
    }

    pub async fn register(&self, workspace_id: Uuid, peer: Peer) -> Result<(), CollabError> {
        let mut workspaces = self.inner.workspaces.write().await;
        let workspace = workspaces.entry(workspace_id).or_default();
        if workspace.members.len() >= self.inner.max_cursors
            && !workspace.members.contains_key(&peer.connection_id)
        {
            if workspace.members.is_empty() {
                workspaces.remove(&workspace_id);
            }
            return Err(CollabError::CapacityExceeded { workspace_id, limit: self.inner.max_cursors });
        }
        workspace.members.insert(peer.connection_id, peer);
        Ok(())
    }

    pub async fn unregister(&self, workspace_id: Uuid, connection_id: Uuid) {
        let mut workspaces = self.inner.workspaces.write().await;
        let Some(workspace) = workspaces.get_mut(&workspace_id) else {
            return;
        };
        workspace.members.remove(&connection_id);
        if let Some(cursor) = workspace.cursors.remove(&connection_id) {
            let leave = ServerMessage::CursorLeave(CursorLeave { workspace_id, user_id: cursor.user_id });
            broadcast(workspace.members.values(), &leave, None);
        }
        if workspace.members.is_empty() {
            workspaces.remove(&workspace_id);
        }
    }

    pub async fn move_cursor(
        &self,
        workspace_id: Uuid,
        connection_id: Uuid,
        user_id: Uuid,
        position: CursorPosition,
        timestamp: i64,
    ) -> Result<(), CollabError> {
        {
            let mut workspaces = self.inner.workspaces.write().await;
            let Some(workspace) = workspaces.get_mut(&workspace_id) else {
                return Ok(());
            };
            let Some(peer) = workspace.members.get(&connection_id) else {
                return Ok(());
            };
            if peer.user_id != user_id {
                return Err(CollabError::MalformedMessage(
                    "cursor user does not match the connection".to_string(),
                ));
            }

            let now = Instant::now();
            let state = match workspace.cursors.entry(connection_id) {
                Entry::Occupied(entry) => {
                    let state = entry.into_mut();
                    if timestamp < state.timestamp {
                        debug!(connection_id = %connection_id, timestamp, last = state.timestamp, "dropping out-of-order cursor");
                        return Ok(());
                    }
                    state.position = position;
                    state.timestamp = timestamp;
                    state.last_active = now;
                    state
                }
                Entry::Vacant(entry) => entry.insert(CursorState {
                    user_id,
                    position,
                    timestamp,
                    last_active: now,
                    flush_pending: false,
                }),
            };

            if state.flush_pending {
                return Ok(());
            }
            state.flush_pending = true;
        }

        let relay = self.clone();
        let token = self.inner.token.clone();
        let throttle = self.inner.throttle;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(throttle) => relay.flush(workspace_id, connection_id).await,
            }
        });
        Ok(())
    }

    async fn flush(&self, workspace_id: Uuid, connection_id: Uuid) {
        let mut workspaces = self.inner.workspaces.write().await;
        let Some(workspace) = workspaces.get_mut(&workspace_id) else {
            return;
        };
        let Some(state) = workspace.cursors.get_mut(&connection_id) else {
            return;
        };
        state.flush_pending = false;
        let message = ServerMessage::Cursor(CursorBroadcast {
            workspace_id,
            user_id: state.user_id,
            position: state.position,
            timestamp: state.timestamp,
        });
        broadcast(workspace.members.values(), &message, Some(connection_id));
    }

    pub async fn sweep_inactive(&self) -> usize {
        self.sweep_inactive_at(Instant::now()).await
    }

    /// Drop cursors idle longer than the timeout and tell peers to hide them.
    pub async fn sweep_inactive_at(&self, now: Instant) -> usize {
        let mut workspaces = self.inner.workspaces.write().await;
        let mut removed = 0;
        for (workspace_id, workspace) in workspaces.iter_mut() {
            let idle: Vec<Uuid> = workspace
                .cursors
                .iter()
                .filter(|(_, state)| now.saturating_duration_since(state.last_active) > self.inner.timeout)
                .map(|(connection_id, _)| *connection_id)
                .collect();

            for connection_id in idle {
                if let Some(state) = workspace.cursors.remove(&connection_id) {
                    let leave = ServerMessage::CursorLeave(CursorLeave {
                        workspace_id: *workspace_id,
                        user_id: state.user_id,
                    });
                    broadcast(workspace.members.values(), &leave, Some(connection_id));
                    removed += 1;
                }
            }
        }
        removed
    }

    pub async fn cursor_count(&self, workspace_id: Uuid) -> usize {
        self.inner.workspaces.read().await.get(&workspace_id).map_or(0, |workspace| workspace.cursors.len())
    }
}
