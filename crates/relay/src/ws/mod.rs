pub mod manager;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        rejection::PathRejection,
        ws::{
            close_code as ws_close, rejection::WebSocketUpgradeRejection, CloseFrame, Message,
            WebSocket, WebSocketUpgrade,
        },
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use erdsync_common::protocol::ws::{close_code, encode_server_message, ServerMessage};
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use self::manager::ConnectionManager;
use crate::{
    auth::middleware::extract_upgrade_token,
    error::{
        current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
        RelayError,
    },
    peer::{ConnectionCloser, OutboundSender, OUTBOUND_BUFFER},
};

/// Close reasons are limited to 123 bytes by the WebSocket protocol.
const MAX_CLOSE_REASON_BYTES: usize = 123;

#[derive(Clone)]
pub struct WsState {
    pub manager: Arc<ConnectionManager>,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub ping_timeout: Duration,
    pub token: CancellationToken,
}

impl WsState {
    fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    token: Option<String>,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/v1/diagrams/{diagram_id}/ws", get(ws_upgrade)).with_state(state)
}

/// Authentication and admission run after the upgrade so refusals can be
/// reported with an error frame and a close code. Only requests that cannot
/// be upgraded at all get an HTTP error body.
pub async fn ws_upgrade(
    diagram_id: Result<Path<Uuid>, PathRejection>,
    Query(query): Query<UpgradeQuery>,
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let request_id = request_id_from_headers_or_generate(&headers);
    let Ok(Path(diagram_id)) = diagram_id else {
        return RelayError::new(ErrorCode::MalformedMessage, "diagram id must be a UUID")
            .with_request_id(request_id)
            .into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return RelayError::new(ErrorCode::MalformedMessage, rejection.body_text())
                .with_request_id(request_id)
                .into_response();
        }
    };
    let token = extract_upgrade_token(&headers, query.token.as_deref());
    let max_frame_bytes = state.max_frame_bytes;

    ws.max_frame_size(max_frame_bytes).max_message_size(max_frame_bytes).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, diagram_id, token, socket)).await;
        },
    )
}

async fn handle_socket(state: WsState, diagram_id: Uuid, token: Option<String>, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let closer = ConnectionCloser::new(state.token.child_token());
    let (tx, mut outbound_receiver) = mpsc::channel(OUTBOUND_BUFFER);
    let outbound = OutboundSender::new(tx, closer.clone());

    let connection = match state.manager.accept(token, diagram_id, outbound).await {
        Ok(connection) => connection,
        Err(error) => {
            warn!(request_id = %request_id, diagram_id = %diagram_id, error = %error, "connection refused");
            let _ = send_frame(&mut socket, &ServerMessage::Error(error.to_frame()), state.ping_timeout).await;
            let code = error.close_code().unwrap_or(ws_close::POLICY);
            let _ = send_close(&mut socket, code, error.code().as_str(), state.ping_timeout).await;
            return;
        }
    };
    let connection_id = connection.connection_id;
    let guard = DisconnectGuard::new(Arc::clone(&state.manager), connection_id);
    debug!(request_id = %request_id, connection_id = %connection_id, "socket loop started");

    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    loop {
        tokio::select! {
            biased;
            _ = closer.closed() => break,
            _ = heartbeat.tick() => {
                if connection.heartbeat_expired(Instant::now(), state.heartbeat_timeout()) {
                    warn!(request_id = %request_id, connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    closer.close(close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout");
                    continue;
                }
                if send_message(&mut socket, Message::Ping(vec![].into()), state.ping_timeout).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(frame) = maybe_outbound else {
                    break;
                };
                if send_frame(&mut socket, &frame, state.ping_timeout).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };
                match message {
                    Ok(Message::Text(raw)) => state.manager.handle_text(&connection, raw.as_str()).await,
                    Ok(Message::Binary(_)) => state.manager.handle_binary(&connection),
                    Ok(Message::Ping(_) | Message::Pong(_)) => state.manager.record_heartbeat(&connection).await,
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            closer.close(ws_close::SIZE, frame_size_exceeded_reason(state.max_frame_bytes));
                        } else {
                            debug!(connection_id = %connection_id, error = %error, "socket read failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    if closer.is_closed() {
        while let Ok(frame) = outbound_receiver.try_recv() {
            if send_frame(&mut socket, &frame, state.ping_timeout).await.is_err() {
                break;
            }
        }
        let reason = closer.reason();
        let _ = send_close(&mut socket, reason.code, &reason.reason, state.ping_timeout).await;
    }

    guard.disconnect().await;
}

/// Deregisters a connection when its socket task ends without reaching the
/// orderly disconnect, including by panic or cancellation.
pub(crate) struct DisconnectGuard {
    manager: Arc<ConnectionManager>,
    connection_id: Uuid,
    armed: bool,
}

impl DisconnectGuard {
    pub(crate) fn new(manager: Arc<ConnectionManager>, connection_id: Uuid) -> Self {
        Self { manager, connection_id, armed: true }
    }

    pub(crate) async fn disconnect(mut self) {
        self.manager.disconnect(self.connection_id).await;
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(connection_id = %self.connection_id, "no runtime to release abandoned connection");
            return;
        };
        warn!(connection_id = %self.connection_id, "socket task ended abruptly, releasing connection");
        let manager = Arc::clone(&self.manager);
        let connection_id = self.connection_id;
        runtime.spawn(async move { manager.disconnect(connection_id).await });
    }
}

async fn send_message(socket: &mut WebSocket, message: Message, limit: Duration) -> Result<(), ()> {
    match tokio::time::timeout(limit, socket.send(message)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerMessage, limit: Duration) -> Result<(), ()> {
    let encoded = encode_server_message(frame, Utc::now().timestamp_millis()).map_err(|_| ())?;
    send_message(socket, Message::Text(encoded.into()), limit).await
}

async fn send_close(socket: &mut WebSocket, code: u16, reason: &str, limit: Duration) -> Result<(), ()> {
    let frame = CloseFrame { code, reason: truncate_reason(reason).into() };
    send_message(socket, Message::Close(Some(frame)), limit).await
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

fn frame_size_exceeded_reason(max_frame_bytes: usize) -> String {
    format!("frame exceeds {max_frame_bytes} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}
