// Process wiring: builds every component once, hands them to each other
// explicitly, and exposes them over HTTP.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, State},
    http::{header::CONTENT_TYPE, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    admission::{counter_store::CounterStore, AdmissionController, DegradedPolicy},
    auth::TokenVerifier,
    config::RelayConfig,
    cors::cors_layer,
    cursor::CursorRelay,
    error::{attach_request_id_header, request_id_from_headers_or_generate, REQUEST_ID_HEADER},
    metrics::RelayMetrics,
    presence::PresenceStore,
    scheduler::spawn_periodic,
    session::{persistence::DiagramService, SessionRegistry},
    ws::{self, manager::ConnectionManager, WsState},
};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Every long-lived component of a relay process.
pub struct RelayServices {
    pub config: Arc<RelayConfig>,
    pub metrics: Arc<RelayMetrics>,
    pub admission: Arc<AdmissionController>,
    pub sessions: Arc<SessionRegistry>,
    pub presence: Arc<PresenceStore>,
    pub cursors: CursorRelay,
    pub manager: Arc<ConnectionManager>,
    pub token: CancellationToken,
}

impl RelayServices {
    pub fn build(
        config: RelayConfig,
        verifier: Arc<dyn TokenVerifier>,
        counter_store: Arc<dyn CounterStore>,
        diagram_service: Arc<dyn DiagramService>,
    ) -> Self {
        let token = CancellationToken::new();
        let metrics = Arc::new(RelayMetrics::default());
        let policy = if config.environment.is_production() {
            DegradedPolicy::FailClosed
        } else {
            DegradedPolicy::FailOpen
        };

        let admission = Arc::new(AdmissionController::new(
            counter_store,
            Arc::clone(&metrics),
            config.max_clients_per_workspace,
            config.rate_limit.clone(),
            policy,
        ));
        let sessions = Arc::new(SessionRegistry::new(
            diagram_service,
            config.session.clone(),
            Arc::clone(&metrics),
            token.child_token(),
        ));
        let presence = Arc::new(PresenceStore::new(&config.presence));
        let cursors =
            CursorRelay::new(&config.cursor, config.max_clients_per_workspace, token.child_token());
        let manager = Arc::new(ConnectionManager::new(
            verifier,
            Arc::clone(&admission),
            Arc::clone(&sessions),
            Arc::clone(&presence),
            cursors.clone(),
            Arc::clone(&metrics),
            config.ping_timeout,
            config.malformed_message_limit,
        ));

        Self {
            config: Arc::new(config),
            metrics,
            admission,
            sessions,
            presence,
            cursors,
            manager,
            token,
        }
    }

    /// Start the presence and cursor sweeps; they stop with the root token.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let presence = Arc::clone(&self.presence);
        let presence_sweep = spawn_periodic(
            "presence-sweep",
            self.config.presence.sweep_interval,
            self.token.child_token(),
            move || {
                let presence = Arc::clone(&presence);
                async move {
                    let expired = presence.sweep_stale().await;
                    if expired > 0 {
                        info!(expired, "expired stale presence records");
                    }
                }
            },
        );

        let cursors = self.cursors.clone();
        let cursor_sweep = spawn_periodic(
            "cursor-sweep",
            self.config.cursor.sweep_interval,
            self.token.child_token(),
            move || {
                let cursors = cursors.clone();
                async move {
                    let removed = cursors.sweep_inactive().await;
                    if removed > 0 {
                        info!(removed, "removed inactive cursors");
                    }
                }
            },
        );

        vec![presence_sweep, cursor_sweep]
    }

    /// Close every connection with 1001, stop background work and flush
    /// every live session.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.sessions.flush_all().await;
    }

    fn ws_state(&self) -> WsState {
        WsState {
            manager: Arc::clone(&self.manager),
            max_frame_bytes: self.config.max_frame_bytes,
            heartbeat_interval: self.config.heartbeat_interval,
            ping_timeout: self.config.ping_timeout,
            token: self.token.clone(),
        }
    }
}

pub fn build_router(services: &RelayServices) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler).with_state(Arc::clone(&services.metrics)))
        .merge(ws::router(services.ws_state()))
        .layer(cors_layer(services.config.cors_origins.as_deref()));

    apply_middleware(router, Arc::clone(&services.metrics))
}

fn apply_middleware(router: Router, metrics: Arc<RelayMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render_prometheus(),
    )
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<RelayMetrics>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let method = request.method().clone();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let started_at = Instant::now();

    let mut response = next.run(request).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics.record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
