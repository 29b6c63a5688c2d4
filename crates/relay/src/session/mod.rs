// Collaboration sessions: one shared CRDT document per diagram with at
// least one attached connection.

pub mod doc;
pub mod inspect;
pub mod persistence;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use erdsync_common::{
    protocol::ws::{close_code, encode_bytes, ServerMessage, SyncSnapshot, UpdateBroadcast},
    types::EditorSummary,
};
use tokio::{
    sync::{watch, Mutex, Notify, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::{
    doc::{DiagramDoc, DocError},
    persistence::{DiagramService, PersistenceError},
};
use crate::{
    config::SessionConfig,
    error::CollabError,
    metrics::RelayMetrics,
    peer::{broadcast, Peer},
};

const FINAL_FLUSH_ATTEMPTS: u32 = 3;
const FINAL_FLUSH_BACKOFF: Duration = Duration::from_millis(200);

type PendingSync = watch::Receiver<Option<SyncSnapshot>>;

struct SessionState {
    doc: DiagramDoc,
    members: HashMap<Uuid, Peer>,
    editors: HashMap<Uuid, EditorSummary>,
    /// Bumped on every applied update.
    version: u64,
    persisted_version: u64,
    last_update_at: Instant,
    pending_sync: Option<PendingSync>,
    /// Set once the last member left; no new members are accepted.
    closing: bool,
    /// Set after a merge failure; the state is never persisted again.
    poisoned: bool,
}

impl SessionState {
    fn editor_summaries(&self) -> Vec<EditorSummary> {
        let mut editors: Vec<EditorSummary> = self.editors.values().cloned().collect();
        editors.sort_by_key(|editor| (editor.joined_at, editor.user_id));
        editors
    }
}

pub struct CollabSession {
    diagram_id: Uuid,
    state: Mutex<SessionState>,
    persist_signal: Notify,
    sync_encodes: AtomicU64,
    config: SessionConfig,
    service: Arc<dyn DiagramService>,
    metrics: Arc<RelayMetrics>,
    /// Stops the background tasks of this session.
    tasks: CancellationToken,
    /// Fires after teardown finished.
    closed: CancellationToken,
}

impl CollabSession {
    fn new(
        diagram_id: Uuid,
        doc: DiagramDoc,
        config: SessionConfig,
        service: Arc<dyn DiagramService>,
        metrics: Arc<RelayMetrics>,
        tasks: CancellationToken,
    ) -> Self {
        Self {
            diagram_id,
            state: Mutex::new(SessionState {
                doc,
                members: HashMap::new(),
                editors: HashMap::new(),
                version: 0,
                persisted_version: 0,
                last_update_at: Instant::now(),
                pending_sync: None,
                closing: false,
                poisoned: false,
            }),
            persist_signal: Notify::new(),
            sync_encodes: AtomicU64::new(0),
            config,
            service,
            metrics,
            tasks,
            closed: CancellationToken::new(),
        }
    }

    pub fn diagram_id(&self) -> Uuid {
        self.diagram_id
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn encode_state(&self) -> Vec<u8> {
        self.state.lock().await.doc.encode_state()
    }

    pub async fn editors(&self) -> Vec<EditorSummary> {
        self.state.lock().await.editor_summaries()
    }

    /// Full-state encodes performed for sync requests.
    pub fn sync_encode_count(&self) -> u64 {
        self.sync_encodes.load(Ordering::Relaxed)
    }

    /// Returns false when the session is shutting down.
    async fn add_member(&self, peer: Peer) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closing {
            return false;
        }
        let editor = state.editors.entry(peer.user_id).or_insert_with(|| EditorSummary {
            user_id: peer.user_id,
            connection_count: 0,
            joined_at: Utc::now(),
            last_edit_at: None,
        });
        if !state.members.contains_key(&peer.connection_id) {
            editor.connection_count += 1;
        }
        state.members.insert(peer.connection_id, peer);
        true
    }

    /// Returns true when this removal emptied the session.
    async fn remove_member(&self, connection_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        let Some(peer) = state.members.remove(&connection_id) else {
            return false;
        };
        if let Some(editor) = state.editors.get_mut(&peer.user_id) {
            editor.connection_count = editor.connection_count.saturating_sub(1);
            if editor.connection_count == 0 {
                state.editors.remove(&peer.user_id);
            }
        }
        if state.members.is_empty() && !state.closing {
            state.closing = true;
            return true;
        }
        false
    }

    /// Merge a client delta and relay it, unchanged, to every other member.
    pub async fn apply_update(&self, connection_id: Uuid, update: &[u8]) -> Result<(), CollabError> {
        let mut state = self.state.lock().await;
        let Some(sender) = state.members.get(&connection_id) else {
            debug!(diagram_id = %self.diagram_id, connection_id = %connection_id, "update from detached connection ignored");
            return Ok(());
        };
        let user_id = sender.user_id;
        if state.poisoned {
            return Err(CollabError::SyncConflict("session is being reset".to_string()));
        }

        match state.doc.apply_update(update) {
            Ok(()) => {}
            Err(DocError::Decode(reason)) => return Err(CollabError::MalformedMessage(reason)),
            Err(DocError::Apply(reason)) => {
                error!(diagram_id = %self.diagram_id, connection_id = %connection_id, reason = %reason, "CRDT merge failed, evicting session members");
                state.poisoned = true;
                let conflict = CollabError::SyncConflict(reason);
                let frame = ServerMessage::Error(conflict.to_frame());
                for peer in state.members.values().filter(|peer| peer.connection_id != connection_id) {
                    peer.outbound.send(frame.clone());
                    peer.outbound.close(close_code::SYNC_CONFLICT, "document diverged, resync required");
                }
                return Err(conflict);
            }
        }

        let now = Instant::now();
        state.version += 1;
        state.last_update_at = now;
        if let Some(editor) = state.editors.get_mut(&user_id) {
            editor.last_edit_at = Some(Utc::now());
        }

        let message = ServerMessage::Update(UpdateBroadcast {
            diagram_id: self.diagram_id,
            user_id,
            update: encode_bytes(update),
        });
        broadcast(state.members.values(), &message, Some(connection_id));
        drop(state);

        self.persist_signal.notify_one();
        Ok(())
    }

    /// Current document for `connection_id`, or `None` once it detached.
    ///
    /// With a state vector only the missing part is returned right away.
    /// Without one, requests arriving within the debounce window share a
    /// single full-state encode.
    pub async fn request_sync(
        &self,
        connection_id: Uuid,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<SyncSnapshot>, CollabError> {
        let mut state = self.state.lock().await;
        if !state.members.contains_key(&connection_id) {
            return Ok(None);
        }
        if state.poisoned {
            return Err(CollabError::SyncConflict("session is being reset".to_string()));
        }

        if let Some(state_vector) = state_vector {
            let diff = state
                .doc
                .encode_diff(state_vector)
                .map_err(|error| CollabError::MalformedMessage(error.to_string()))?;
            return Ok(Some(SyncSnapshot {
                diagram_id: self.diagram_id,
                state: encode_bytes(&diff),
                state_vector: encode_bytes(&state.doc.encode_state_vector()),
                diff: true,
                editors: state.editor_summaries(),
            }));
        }

        if let Some(mut pending) = state.pending_sync.clone() {
            drop(state);
            if let Ok(snapshot) = pending.wait_for(Option::is_some).await {
                return Ok(snapshot.clone());
            }
            return Ok(Some(self.encode_snapshot(&*self.state.lock().await)));
        }

        let (tx, rx) = watch::channel(None);
        state.pending_sync = Some(rx);
        drop(state);

        if !self.config.sync_debounce.is_zero() {
            tokio::select! {
                _ = self.tasks.cancelled() => {}
                _ = tokio::time::sleep(self.config.sync_debounce) => {}
            }
        }

        let mut state = self.state.lock().await;
        state.pending_sync = None;
        let snapshot = self.encode_snapshot(&state);
        drop(state);

        let _ = tx.send(Some(snapshot.clone()));
        Ok(Some(snapshot))
    }

    fn encode_snapshot(&self, state: &SessionState) -> SyncSnapshot {
        self.sync_encodes.fetch_add(1, Ordering::Relaxed);
        SyncSnapshot {
            diagram_id: self.diagram_id,
            state: encode_bytes(&state.doc.encode_state()),
            state_vector: encode_bytes(&state.doc.encode_state_vector()),
            diff: false,
            editors: state.editor_summaries(),
        }
    }

    /// Roll the document forward to `snapshot` and relay the resulting
    /// delta to every member, attributed to `actor`.
    pub async fn restore(&self, snapshot: &[u8], actor: Uuid) -> Result<(), CollabError> {
        let mut state = self.state.lock().await;
        if state.poisoned {
            return Err(CollabError::SyncConflict("session is being reset".to_string()));
        }
        let delta = state.doc.restore_from(snapshot).map_err(|error| match error {
            DocError::Decode(reason) => CollabError::MalformedMessage(reason),
            DocError::Apply(reason) => CollabError::SyncConflict(reason),
        })?;
        state.version += 1;
        state.last_update_at = Instant::now();

        let message = ServerMessage::Update(UpdateBroadcast {
            diagram_id: self.diagram_id,
            user_id: actor,
            update: encode_bytes(&delta),
        });
        let delivered = broadcast(state.members.values(), &message, None);
        drop(state);

        info!(diagram_id = %self.diagram_id, actor = %actor, delivered, "diagram restored from snapshot");
        self.persist_signal.notify_one();
        Ok(())
    }

    /// Persist the current state if it changed since the last success.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let (version, payload) = {
            let state = self.state.lock().await;
            if state.poisoned || state.version == state.persisted_version {
                return Ok(());
            }
            (state.version, state.doc.encode_state())
        };

        match self.service.persist(self.diagram_id, &payload).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.persisted_version = state.persisted_version.max(version);
                self.metrics.record_persist(true);
                debug!(diagram_id = %self.diagram_id, version, bytes = payload.len(), "diagram persisted");
                Ok(())
            }
            Err(error) => {
                self.metrics.record_persist(false);
                warn!(diagram_id = %self.diagram_id, version, error = %error, "diagram persist failed, retrying on next update");
                Err(error)
            }
        }
    }

    fn spawn_persistence(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_persistence().await });
    }

    /// Flush-on-idle: wait for an update, then for `persist_debounce` of
    /// quiet after the latest one.
    async fn run_persistence(&self) {
        loop {
            tokio::select! {
                biased;
                _ = self.tasks.cancelled() => return,
                _ = self.persist_signal.notified() => {}
            }

            loop {
                let deadline = self.state.lock().await.last_update_at + self.config.persist_debounce;
                if Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = self.tasks.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }

            let _ = self.flush().await;
        }
    }

    async fn final_flush(&self) {
        for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
            match self.flush().await {
                Ok(()) => return,
                Err(error) if attempt < FINAL_FLUSH_ATTEMPTS => {
                    warn!(diagram_id = %self.diagram_id, attempt, error = %error, "final flush failed");
                    tokio::time::sleep(FINAL_FLUSH_BACKOFF * attempt).await;
                }
                Err(error) => {
                    error!(diagram_id = %self.diagram_id, error = %error, "final flush failed, unsaved changes dropped");
                }
            }
        }
    }

    async fn destroy(&self) {
        let mut state = self.state.lock().await;
        state.doc = DiagramDoc::new();
        state.editors.clear();
        state.members.clear();
        state.pending_sync = None;
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Live sessions keyed by diagram.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<CollabSession>>>,
    service: Arc<dyn DiagramService>,
    config: SessionConfig,
    metrics: Arc<RelayMetrics>,
    token: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        service: Arc<dyn DiagramService>,
        config: SessionConfig,
        metrics: Arc<RelayMetrics>,
        token: CancellationToken,
    ) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), service, config, metrics, token }
    }

    pub async fn session(&self, diagram_id: Uuid) -> Option<Arc<CollabSession>> {
        self.sessions.read().await.get(&diagram_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Attach a connection, creating the session on first use.
    pub async fn attach(&self, diagram_id: Uuid, peer: Peer) -> Result<Arc<CollabSession>, CollabError> {
        loop {
            let existing = self.session(diagram_id).await;
            let session = match existing {
                Some(session) => session,
                None => self.open(diagram_id).await?,
            };
            if session.add_member(peer.clone()).await {
                return Ok(session);
            }
            session.closed().await;
        }
    }

    async fn open(&self, diagram_id: Uuid) -> Result<Arc<CollabSession>, CollabError> {
        let initial = self
            .service
            .initial_state(diagram_id)
            .await
            .map_err(|error| CollabError::StorageUnavailable(error.to_string()))?;
        let doc = match initial {
            Some(state) => DiagramDoc::from_state(&state).map_err(|error| {
                CollabError::StorageUnavailable(format!("stored state of diagram {diagram_id} is unreadable: {error}"))
            })?,
            None => DiagramDoc::new(),
        };

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&diagram_id) {
            return Ok(Arc::clone(existing));
        }
        let session = Arc::new(CollabSession::new(
            diagram_id,
            doc,
            self.config.clone(),
            Arc::clone(&self.service),
            Arc::clone(&self.metrics),
            self.token.child_token(),
        ));
        sessions.insert(diagram_id, Arc::clone(&session));
        drop(sessions);

        session.spawn_persistence();
        self.metrics.session_opened();
        info!(diagram_id = %diagram_id, "collaboration session opened");
        Ok(session)
    }

    /// Detach a connection; the last one out tears the session down.
    pub async fn detach(&self, diagram_id: Uuid, connection_id: Uuid) {
        let Some(session) = self.session(diagram_id).await else {
            return;
        };
        if session.remove_member(connection_id).await {
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, session: Arc<CollabSession>) {
        session.tasks.cancel();
        session.final_flush().await;
        session.destroy().await;

        {
            let mut sessions = self.sessions.write().await;
            if sessions.get(&session.diagram_id).is_some_and(|current| Arc::ptr_eq(current, &session)) {
                sessions.remove(&session.diagram_id);
            }
        }
        session.closed.cancel();
        self.metrics.session_closed();
        info!(diagram_id = %session.diagram_id, "collaboration session closed");
    }

    /// Restore a diagram to `snapshot`. A live session relays the change to
    /// its members; otherwise the stored state is rewritten directly.
    pub async fn restore(&self, diagram_id: Uuid, snapshot: &[u8], actor: Uuid) -> Result<(), CollabError> {
        if let Some(session) = self.session(diagram_id).await {
            return session.restore(snapshot, actor).await;
        }

        let stored = self
            .service
            .initial_state(diagram_id)
            .await
            .map_err(|error| CollabError::StorageUnavailable(error.to_string()))?;
        let doc = match stored {
            Some(state) => DiagramDoc::from_state(&state)
                .map_err(|error| CollabError::StorageUnavailable(error.to_string()))?,
            None => DiagramDoc::new(),
        };
        doc.restore_from(snapshot).map_err(|error| CollabError::MalformedMessage(error.to_string()))?;
        self.service
            .persist(diagram_id, &doc.encode_state())
            .await
            .map_err(|error| CollabError::StorageUnavailable(error.to_string()))
    }

    /// Flush every live session; used on shutdown.
    pub async fn flush_all(&self) {
        let sessions: Vec<Arc<CollabSession>> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.final_flush().await;
        }
    }
}
