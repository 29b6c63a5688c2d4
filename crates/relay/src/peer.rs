// Outbound side of a live connection as seen by the components that
// broadcast to it.

use std::sync::{Arc, OnceLock};

use erdsync_common::protocol::ws::{close_code, ServerMessage};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Frames queued per connection before it is treated as a slow consumer.
pub const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

/// Requests termination of one connection. The first reason wins.
#[derive(Debug, Clone)]
pub struct ConnectionCloser {
    token: CancellationToken,
    reason: Arc<OnceLock<CloseReason>>,
}

impl ConnectionCloser {
    pub fn new(token: CancellationToken) -> Self {
        Self { token, reason: Arc::new(OnceLock::new()) }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.reason.set(CloseReason { code, reason: reason.into() });
        self.token.cancel();
    }

    /// Close reason, defaulting to "going away" when the root token fired.
    pub fn reason(&self) -> CloseReason {
        self.reason.get().cloned().unwrap_or_else(|| CloseReason {
            code: close_code::GOING_AWAY,
            reason: "server shutting down".to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

/// Bounded sender for one connection.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<ServerMessage>,
    closer: ConnectionCloser,
}

impl OutboundSender {
    pub fn new(tx: mpsc::Sender<ServerMessage>, closer: ConnectionCloser) -> Self {
        Self { tx, closer }
    }

    /// Channel-backed sender for tests and embedders.
    pub fn channel(token: CancellationToken) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self::new(tx, ConnectionCloser::new(token)), rx)
    }

    /// Queue a frame without waiting. A full queue closes the connection.
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.closer.is_closed() {
            return false;
        }
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                warn!(frame = message.kind(), "outbound buffer full, closing slow consumer");
                self.closer.close(close_code::SLOW_CONSUMER, "outbound buffer full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.closer.close(code, reason);
    }

    pub fn closer(&self) -> &ConnectionCloser {
        &self.closer
    }
}

/// A connection registered with a broadcasting component.
#[derive(Debug, Clone)]
pub struct Peer {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub outbound: OutboundSender,
}

impl Peer {
    pub fn new(connection_id: Uuid, user_id: Uuid, outbound: OutboundSender) -> Self {
        Self { connection_id, user_id, outbound }
    }
}

/// Send `message` to every peer except `exclude`; returns how many accepted it.
pub fn broadcast<'a>(
    peers: impl IntoIterator<Item = &'a Peer>,
    message: &ServerMessage,
    exclude: Option<Uuid>,
) -> usize {
    peers
        .into_iter()
        .filter(|peer| Some(peer.connection_id) != exclude)
        .filter(|peer| peer.outbound.send(message.clone()))
        .count()
}
