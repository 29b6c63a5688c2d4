// Connection Manager: owns live connections and routes their messages to
// the admission controller, session, presence store and cursor relay.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use erdsync_common::protocol::ws::{
    close_code, decode_client_message, ClientEnvelope, ClientMessage, MessageKind, ServerMessage,
};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    admission::AdmissionController,
    auth::{AuthError, TokenVerifier, VerifiedClaims, WorkspaceRole},
    cursor::CursorRelay,
    error::CollabError,
    metrics::RelayMetrics,
    peer::{OutboundSender, Peer},
    presence::PresenceStore,
    session::{CollabSession, SessionRegistry},
};

/// One live socket.
pub struct Connection {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub diagram_id: Uuid,
    pub role: WorkspaceRole,
    pub connected_at: DateTime<Utc>,
    last_heartbeat_at: Mutex<Instant>,
    malformed: AtomicU32,
    disconnected: AtomicBool,
    outbound: OutboundSender,
    session: Arc<CollabSession>,
}

impl Connection {
    pub fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }

    pub fn last_heartbeat_at(&self) -> Instant {
        *self.last_heartbeat_at.lock().expect("heartbeat lock poisoned")
    }

    fn touch(&self) {
        *self.last_heartbeat_at.lock().expect("heartbeat lock poisoned") = Instant::now();
    }

    pub fn heartbeat_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat_at()) > timeout
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

pub struct ConnectionManager {
    verifier: Arc<dyn TokenVerifier>,
    admission: Arc<AdmissionController>,
    sessions: Arc<SessionRegistry>,
    presence: Arc<PresenceStore>,
    cursors: CursorRelay,
    metrics: Arc<RelayMetrics>,
    auth_timeout: Duration,
    malformed_limit: u32,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        admission: Arc<AdmissionController>,
        sessions: Arc<SessionRegistry>,
        presence: Arc<PresenceStore>,
        cursors: CursorRelay,
        metrics: Arc<RelayMetrics>,
        auth_timeout: Duration,
        malformed_limit: u32,
    ) -> Self {
        Self {
            verifier,
            admission,
            sessions,
            presence,
            cursors,
            metrics,
            auth_timeout,
            malformed_limit,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Authenticate, admit and register a new socket for `diagram_id`.
    ///
    /// On failure nothing stays registered anywhere.
    pub async fn accept(
        &self,
        token: Option<String>,
        diagram_id: Uuid,
        outbound: OutboundSender,
    ) -> Result<Arc<Connection>, CollabError> {
        let claims = match self.authenticate(token.as_deref(), diagram_id).await {
            Ok(claims) => claims,
            Err(error) => {
                self.metrics.record_admission_rejection("auth");
                return Err(CollabError::Authentication(error.to_string()));
            }
        };

        let connection_id = Uuid::new_v4();
        let (user_id, workspace_id) = (claims.user_id, claims.workspace_id);
        self.admission.check_workspace_capacity(workspace_id, connection_id, user_id).await?;

        let peer = Peer::new(connection_id, user_id, outbound.clone());
        let session = match self.sessions.attach(diagram_id, peer.clone()).await {
            Ok(session) => session,
            Err(error) => {
                self.admission.release(workspace_id, connection_id).await;
                return Err(error);
            }
        };
        if let Err(error) = self.cursors.register(workspace_id, peer.clone()).await {
            self.sessions.detach(diagram_id, connection_id).await;
            self.admission.release(workspace_id, connection_id).await;
            return Err(error);
        }
        let joined = self.presence.join(workspace_id, peer).await;
        outbound.send(ServerMessage::Roster(joined.roster));

        let connection = Arc::new(Connection {
            connection_id,
            user_id,
            workspace_id,
            diagram_id,
            role: claims.role,
            connected_at: Utc::now(),
            last_heartbeat_at: Mutex::new(Instant::now()),
            malformed: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            outbound,
            session,
        });
        self.connections.write().await.insert(connection_id, Arc::clone(&connection));
        self.metrics.connection_opened();
        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            workspace_id = %workspace_id,
            diagram_id = %diagram_id,
            role = claims.role.as_str(),
            "connection accepted"
        );
        Ok(connection)
    }

    async fn authenticate(
        &self,
        token: Option<&str>,
        diagram_id: Uuid,
    ) -> Result<VerifiedClaims, AuthError> {
        let token = token.filter(|token| !token.is_empty()).ok_or(AuthError::MissingToken)?;
        let claims = tokio::time::timeout(self.auth_timeout, self.verifier.verify(token))
            .await
            .map_err(|_| AuthError::Unavailable("token verification timed out".to_string()))??;
        if claims.diagram_id.is_some_and(|scoped| scoped != diagram_id) {
            return Err(AuthError::WrongDiagram(diagram_id));
        }
        Ok(claims)
    }

    /// Any inbound frame counts as a liveness signal.
    pub async fn record_heartbeat(&self, connection: &Connection) {
        connection.touch();
        self.presence.touch(connection.workspace_id, connection.user_id).await;
    }

    /// Decode, admit and dispatch one text frame. Errors go back to the
    /// client as error frames; fatal ones also close the socket.
    pub async fn handle_text(&self, connection: &Connection, raw: &str) {
        if connection.is_disconnected() {
            return;
        }
        self.record_heartbeat(connection).await;

        let envelope = match decode_client_message(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.metrics.record_ws_message("invalid", true);
                debug!(connection_id = %connection.connection_id, error = %error, "malformed frame");
                self.report(connection, CollabError::MalformedMessage(error.to_string()));
                return;
            }
        };

        let kind = envelope.message.kind();
        let result = self.dispatch(connection, envelope).await;
        self.metrics.record_ws_message(kind.as_str(), result.is_err());
        if let Err(error) = result {
            self.report(connection, error);
        }
    }

    /// Binary frames are not part of the protocol.
    pub fn handle_binary(&self, connection: &Connection) {
        self.metrics.record_ws_message("invalid", true);
        self.report(connection, CollabError::MalformedMessage("binary frames are not supported".to_string()));
    }

    async fn dispatch(&self, connection: &Connection, envelope: ClientEnvelope) -> Result<(), CollabError> {
        let kind = envelope.message.kind();
        if kind != MessageKind::Error {
            self.admission.check_rate(connection.user_id, kind.as_str()).await?;
        }

        match envelope.message {
            ClientMessage::Sync { state_vector } => {
                let snapshot = connection
                    .session
                    .request_sync(connection.connection_id, state_vector.as_deref())
                    .await?;
                if let Some(snapshot) = snapshot {
                    connection.outbound.send(ServerMessage::Sync(snapshot));
                }
                Ok(())
            }
            ClientMessage::Update { diagram_id, update } => {
                if !connection.role.can_edit() {
                    return Err(CollabError::Forbidden(format!(
                        "{} role cannot edit diagrams",
                        connection.role.as_str()
                    )));
                }
                if diagram_id != connection.diagram_id {
                    return Err(CollabError::MalformedMessage(format!(
                        "update targets diagram {diagram_id} but the connection is attached to {}",
                        connection.diagram_id
                    )));
                }
                connection.session.apply_update(connection.connection_id, &update).await
            }
            ClientMessage::Cursor { user_id, position } => {
                let timestamp = envelope.timestamp.unwrap_or_else(|| crate::now_ms() as i64);
                self.cursors
                    .move_cursor(connection.workspace_id, connection.connection_id, user_id, position, timestamp)
                    .await
            }
            ClientMessage::Presence { status } => {
                self.presence
                    .update_status(connection.workspace_id, connection.user_id, status, envelope.timestamp)
                    .await
            }
            ClientMessage::Error { code, message } => {
                warn!(
                    connection_id = %connection.connection_id,
                    code = %code,
                    message = %message,
                    "client reported error"
                );
                Ok(())
            }
        }
    }

    fn report(&self, connection: &Connection, error: CollabError) {
        if matches!(error, CollabError::MalformedMessage(_)) {
            let count = connection.malformed.fetch_add(1, Ordering::SeqCst) + 1;
            connection.outbound.send(ServerMessage::Error(error.to_frame()));
            if count >= self.malformed_limit {
                warn!(connection_id = %connection.connection_id, count, "malformed message limit reached");
                connection.outbound.close(close_code::MALFORMED_LIMIT, "too many malformed messages");
            }
            return;
        }

        connection.outbound.send(ServerMessage::Error(error.to_frame()));
        if let Some(code) = error.close_code() {
            warn!(connection_id = %connection.connection_id, error = %error, "closing connection");
            connection.outbound.close(code, error.code().as_str());
        }
    }

    /// Deregister a connection from every component. Idempotent.
    pub async fn disconnect(&self, connection_id: Uuid) {
        let Some(connection) = self.connections.write().await.remove(&connection_id) else {
            return;
        };
        connection.disconnected.store(true, Ordering::SeqCst);

        self.presence.leave(connection.workspace_id, connection.user_id, connection_id).await;
        self.cursors.unregister(connection.workspace_id, connection_id).await;
        self.sessions.detach(connection.diagram_id, connection_id).await;
        self.admission.release(connection.workspace_id, connection_id).await;
        self.metrics.connection_closed();

        info!(
            connection_id = %connection_id,
            user_id = %connection.user_id,
            workspace_id = %connection.workspace_id,
            diagram_id = %connection.diagram_id,
            connected_for_ms = (Utc::now() - connection.connected_at).num_milliseconds(),
            "connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admission::{counter_store::MemoryCounterStore, DegradedPolicy},
        auth::jwt::JwtAccessTokenService,
        config::{CursorConfig, PresenceConfig, RateLimitConfig, SessionConfig},
        session::{doc::DiagramDoc, persistence::MemoryDiagramStore},
    };
    use erdsync_common::{
        protocol::ws::{encode_client_message, ErrorFrame},
        types::{CursorPosition, PresenceStatus},
    };
    use tokio::sync::mpsc::Receiver;
    use tokio_util::sync::CancellationToken;

    const TEST_SECRET: &str = "erdsync_test_secret_that_is_definitely_long_enough";

    struct Harness {
        manager: Arc<ConnectionManager>,
        jwt: JwtAccessTokenService,
        admission: Arc<AdmissionController>,
        sessions: Arc<SessionRegistry>,
        presence: Arc<PresenceStore>,
    }

    fn harness_with(max_clients: usize, rate: RateLimitConfig) -> Harness {
        let metrics = Arc::new(RelayMetrics::default());
        let jwt = JwtAccessTokenService::new(TEST_SECRET).unwrap();
        let admission = Arc::new(AdmissionController::new(
            Arc::new(MemoryCounterStore::default()),
            metrics.clone(),
            max_clients,
            rate,
            DegradedPolicy::FailClosed,
        ));
        let sessions = Arc::new(SessionRegistry::new(
            Arc::new(MemoryDiagramStore::default()),
            SessionConfig::default(),
            metrics.clone(),
            CancellationToken::new(),
        ));
        let presence = Arc::new(PresenceStore::new(&PresenceConfig::default()));
        let cursors = CursorRelay::new(&CursorConfig::default(), max_clients, CancellationToken::new());
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).unwrap()),
            admission.clone(),
            sessions.clone(),
            presence.clone(),
            cursors,
            metrics,
            Duration::from_secs(5),
            3,
        ));
        Harness { manager, jwt, admission, sessions, presence }
    }

    fn harness() -> Harness {
        harness_with(25, RateLimitConfig::default())
    }

    fn outbound() -> (OutboundSender, Receiver<ServerMessage>) {
        OutboundSender::channel(CancellationToken::new())
    }

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn error_codes(frames: &[ServerMessage]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                ServerMessage::Error(ErrorFrame { code, .. }) => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    impl Harness {
        fn token(&self, user_id: Uuid, workspace_id: Uuid, role: WorkspaceRole) -> String {
            self.jwt.issue_token(user_id, workspace_id, role, None).unwrap()
        }

        async fn connect(
            &self,
            workspace_id: Uuid,
            diagram_id: Uuid,
            role: WorkspaceRole,
        ) -> (Arc<Connection>, Receiver<ServerMessage>) {
            let (outbound, rx) = outbound();
            let token = self.token(Uuid::new_v4(), workspace_id, role);
            let connection = self.manager.accept(Some(token), diagram_id, outbound).await.unwrap();
            (connection, rx)
        }
    }

    #[tokio::test]
    async fn accept_registers_everywhere_and_sends_roster() {
        let h = harness();
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (connection, mut rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;

        assert_eq!(h.manager.connection_count().await, 1);
        assert_eq!(h.admission.workspace_connection_count(workspace_id), 1);
        assert_eq!(h.presence.member_count(workspace_id).await, 1);
        assert_eq!(h.sessions.session(diagram_id).await.unwrap().member_count().await, 1);

        let frames = drain(&mut rx);
        let ServerMessage::Roster(roster) = &frames[0] else {
            panic!("expected roster, got {frames:?}");
        };
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].user_id, connection.user_id);
    }

    #[tokio::test]
    async fn missing_expired_or_foreign_tokens_fail_closed() {
        let h = harness();
        let diagram_id = Uuid::new_v4();

        let error = h.manager.accept(None, diagram_id, outbound().0).await.err().unwrap();
        assert!(matches!(error, CollabError::Authentication(_)));

        let error = h
            .manager
            .accept(Some("garbage".to_string()), diagram_id, outbound().0)
            .await
            .err()
            .unwrap();
        assert!(matches!(error, CollabError::Authentication(_)));

        let scoped = h
            .jwt
            .issue_token(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Editor, Some(Uuid::new_v4()))
            .unwrap();
        let error = h.manager.accept(Some(scoped), diagram_id, outbound().0).await.err().unwrap();
        assert_eq!(error.close_code(), Some(close_code::AUTHENTICATION_FAILED));
        assert_eq!(h.manager.connection_count().await, 0);
    }

    #[tokio::test]
    async fn capacity_refusal_leaves_nothing_behind() {
        let h = harness_with(1, RateLimitConfig::default());
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (first, _rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;

        let token = h.token(Uuid::new_v4(), workspace_id, WorkspaceRole::Editor);
        let error = h.manager.accept(Some(token.clone()), diagram_id, outbound().0).await.err().unwrap();
        assert_eq!(error.close_code(), Some(close_code::CAPACITY_EXCEEDED));
        assert_eq!(h.presence.member_count(workspace_id).await, 1);

        h.manager.disconnect(first.connection_id).await;
        assert!(h.manager.accept(Some(token), diagram_id, outbound().0).await.is_ok());
    }

    #[tokio::test]
    async fn update_reaches_peers_and_viewers_are_refused() {
        let h = harness();
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (editor, mut editor_rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;
        let (viewer, mut viewer_rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Viewer).await;
        drain(&mut editor_rx);
        drain(&mut viewer_rx);

        let client = DiagramDoc::with_client_id(1);
        let before = client.encode_state_vector();
        client.set_entry("nodes", "users", "table");
        let update = client.encode_diff(&before).unwrap();
        let frame = encode_client_message(&ClientMessage::Update { diagram_id, update: update.clone() }, 1);

        h.manager.handle_text(&editor, &frame).await;
        let received = drain(&mut viewer_rx);
        assert!(matches!(&received[..], [ServerMessage::Update(broadcast)] if broadcast.user_id == editor.user_id));

        h.manager.handle_text(&viewer, &frame).await;
        assert_eq!(error_codes(&drain(&mut viewer_rx)), vec!["AUTH_FORBIDDEN".to_string()]);
        assert!(!viewer.outbound().closer().is_closed());
        assert!(drain(&mut editor_rx).is_empty());
    }

    #[tokio::test]
    async fn sync_request_returns_snapshot_to_requester() {
        let h = harness();
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (connection, mut rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;
        drain(&mut rx);

        let frame = encode_client_message(&ClientMessage::Sync { state_vector: None }, 1);
        h.manager.handle_text(&connection, &frame).await;

        let frames = drain(&mut rx);
        assert!(matches!(&frames[..], [ServerMessage::Sync(snapshot)] if snapshot.diagram_id == diagram_id));
    }

    #[tokio::test]
    async fn repeated_malformed_frames_close_the_connection() {
        let h = harness();
        let (connection, mut rx) = h.connect(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Editor).await;
        drain(&mut rx);

        h.manager.handle_text(&connection, "not json").await;
        h.manager.handle_text(&connection, r#"{"type":"teleport"}"#).await;
        assert!(!connection.outbound().closer().is_closed());
        assert_eq!(error_codes(&drain(&mut rx)).len(), 2);

        h.manager.handle_text(&connection, "{").await;
        assert!(connection.outbound().closer().is_closed());
        assert_eq!(connection.outbound().closer().reason().code, close_code::MALFORMED_LIMIT);
    }

    #[tokio::test]
    async fn rate_limited_messages_are_dropped_but_connection_stays() {
        let rate = RateLimitConfig { max_requests: 2, ..RateLimitConfig::default() };
        let h = harness_with(25, rate);
        let (connection, mut rx) = h.connect(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Editor).await;
        drain(&mut rx);

        let frame = encode_client_message(&ClientMessage::Presence { status: PresenceStatus::Editing }, 1);
        for _ in 0..3 {
            h.manager.handle_text(&connection, &frame).await;
        }

        let codes = error_codes(&drain(&mut rx));
        assert_eq!(codes, vec!["RATE_LIMITED".to_string()]);
        assert!(!connection.outbound().closer().is_closed());
    }

    #[tokio::test]
    async fn cursor_for_another_user_is_malformed() {
        let h = harness();
        let (connection, mut rx) = h.connect(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Editor).await;
        drain(&mut rx);

        let frame = encode_client_message(
            &ClientMessage::Cursor { user_id: Uuid::new_v4(), position: CursorPosition::new(1.0, 2.0) },
            1,
        );
        h.manager.handle_text(&connection, &frame).await;
        assert_eq!(error_codes(&drain(&mut rx)), vec!["MALFORMED_MESSAGE".to_string()]);
    }

    #[tokio::test]
    async fn undecodable_update_is_malformed_and_connection_survives() {
        let h = harness();
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (connection, mut rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;
        drain(&mut rx);

        let update = vec![1, 2, 1, 250, 255, 255, 255, 15, 0, 10, 0, 10, 0, 0];
        let frame = encode_client_message(&ClientMessage::Update { diagram_id, update }, 1);
        h.manager.handle_text(&connection, &frame).await;

        assert_eq!(error_codes(&drain(&mut rx)), vec!["MALFORMED_MESSAGE".to_string()]);
        assert!(!connection.outbound().closer().is_closed());
        assert_eq!(h.manager.connection_count().await, 1);
        assert_eq!(h.admission.workspace_connection_count(workspace_id), 1);
        assert_eq!(h.sessions.session(diagram_id).await.unwrap().member_count().await, 1);

        let client = DiagramDoc::with_client_id(1);
        client.set_entry("nodes", "users", "table");
        let update = client.encode_diff(&[0]).unwrap();
        let frame = encode_client_message(&ClientMessage::Update { diagram_id, update }, 1);
        h.manager.handle_text(&connection, &frame).await;
        assert!(error_codes(&drain(&mut rx)).is_empty());

        h.manager.disconnect(connection.connection_id).await;
        assert_eq!(h.admission.workspace_connection_count(workspace_id), 0);
        assert_eq!(h.presence.member_count(workspace_id).await, 0);
        assert_eq!(h.sessions.len().await, 0);
    }

    #[tokio::test]
    async fn socket_task_that_panics_still_releases_its_connection() {
        let h = harness();
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (connection, _rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;

        let guard = super::super::DisconnectGuard::new(Arc::clone(&h.manager), connection.connection_id);
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("socket task failed");
        });
        assert!(task.await.unwrap_err().is_panic());

        for _ in 0..100 {
            if h.manager.connection_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.manager.connection_count().await, 0);
        assert_eq!(h.admission.workspace_connection_count(workspace_id), 0);
        assert_eq!(h.presence.member_count(workspace_id).await, 0);
        assert_eq!(h.sessions.len().await, 0);
        assert!(connection.is_disconnected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_late_frames_are_ignored() {
        let h = harness();
        let (workspace_id, diagram_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (connection, mut rx) = h.connect(workspace_id, diagram_id, WorkspaceRole::Editor).await;
        drain(&mut rx);

        h.manager.disconnect(connection.connection_id).await;
        h.manager.disconnect(connection.connection_id).await;
        assert_eq!(h.admission.workspace_connection_count(workspace_id), 0);
        assert_eq!(h.presence.member_count(workspace_id).await, 0);
        assert_eq!(h.sessions.len().await, 0);
        assert!(connection.is_disconnected());

        let frame = encode_client_message(&ClientMessage::Sync { state_vector: None }, 1);
        h.manager.handle_text(&connection, &frame).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_expires_after_twice_the_interval() {
        let h = harness();
        let (connection, _rx) = h.connect(Uuid::new_v4(), Uuid::new_v4(), WorkspaceRole::Editor).await;
        let timeout = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!connection.heartbeat_expired(Instant::now(), timeout));

        h.manager.record_heartbeat(&connection).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(connection.heartbeat_expired(Instant::now(), timeout));
    }
}
