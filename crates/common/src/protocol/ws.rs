// WebSocket envelope types for the erdsync collaboration protocol.
//
// Every frame is a JSON object `{ "type": ..., "data": ..., "timestamp": ... }`.
// Inbound frames are decoded into the closed `ClientMessage` union; anything
// that does not fit is a `DecodeError` and never reaches the engine.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CursorPosition, EditorSummary, PresenceRecord, PresenceStatus};

/// WebSocket close codes sent by the relay.
pub mod close_code {
    pub const GOING_AWAY: u16 = 1001;
    pub const AUTHENTICATION_FAILED: u16 = 4001;
    pub const CAPACITY_EXCEEDED: u16 = 4002;
    pub const STORAGE_UNAVAILABLE: u16 = 4003;
    pub const SYNC_CONFLICT: u16 = 4004;
    pub const HEARTBEAT_TIMEOUT: u16 = 4008;
    pub const MALFORMED_LIMIT: u16 = 4009;
    pub const SLOW_CONSUMER: u16 = 4010;
}

/// Inbound message kinds, also used as rate-limit resource names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Sync,
    Update,
    Cursor,
    Presence,
    Error,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Update => "update",
            Self::Cursor => "cursor",
            Self::Presence => "presence",
            Self::Error => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "sync" => Some(Self::Sync),
            "update" => Some(Self::Update),
            "cursor" => Some(Self::Cursor),
            "presence" => Some(Self::Presence),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Request the current document state, or only the part missing from
    /// `state_vector` when the client sends one.
    Sync { state_vector: Option<Vec<u8>> },
    /// An opaque CRDT delta for `diagram_id`.
    Update { diagram_id: Uuid, update: Vec<u8> },
    Cursor { user_id: Uuid, position: CursorPosition },
    Presence { status: PresenceStatus },
    /// Client-side failure report. Logged, never rebroadcast.
    Error { code: String, message: String },
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sync { .. } => MessageKind::Sync,
            Self::Update { .. } => MessageKind::Update,
            Self::Cursor { .. } => MessageKind::Cursor,
            Self::Presence { .. } => MessageKind::Presence,
            Self::Error { .. } => MessageKind::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub message: ClientMessage,
    /// Epoch milliseconds as stamped by the client, if any.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is not a JSON envelope: {0}")]
    InvalidJson(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPayload {
    #[serde(default)]
    state_vector: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    diagram_id: Uuid,
    update: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload {
    user_id: Uuid,
    position: CursorPosition,
}

#[derive(Debug, Deserialize)]
struct PresencePayload {
    status: PresenceStatus,
}

#[derive(Debug, Deserialize)]
struct ClientErrorPayload {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub fn decode_client_message(raw: &str) -> Result<ClientEnvelope, DecodeError> {
    let envelope = serde_json::from_str::<RawEnvelope>(raw)
        .map_err(|error| DecodeError::InvalidJson(error.to_string()))?;
    let kind = MessageKind::parse(&envelope.kind)
        .ok_or_else(|| DecodeError::UnknownType(envelope.kind.clone()))?;

    let message = match kind {
        MessageKind::Sync => {
            let payload: SyncPayload =
                if envelope.data.is_null() { SyncPayload::default() } else { payload(kind, envelope.data)? };
            let state_vector = payload
                .state_vector
                .map(|encoded| decode_bytes(&encoded))
                .transpose()
                .map_err(|reason| invalid(kind, reason))?;
            ClientMessage::Sync { state_vector }
        }
        MessageKind::Update => {
            let payload: UpdatePayload = payload(kind, envelope.data)?;
            let update = decode_bytes(&payload.update).map_err(|reason| invalid(kind, reason))?;
            if update.is_empty() {
                return Err(invalid(kind, "update must not be empty".to_string()));
            }
            ClientMessage::Update { diagram_id: payload.diagram_id, update }
        }
        MessageKind::Cursor => {
            let payload: CursorPayload = payload(kind, envelope.data)?;
            if !payload.position.is_finite() {
                return Err(invalid(kind, "position must be finite".to_string()));
            }
            ClientMessage::Cursor { user_id: payload.user_id, position: payload.position }
        }
        MessageKind::Presence => {
            let payload: PresencePayload = payload(kind, envelope.data)?;
            ClientMessage::Presence { status: payload.status }
        }
        MessageKind::Error => {
            let payload: ClientErrorPayload = payload(kind, envelope.data)?;
            ClientMessage::Error { code: payload.code, message: payload.message }
        }
    };

    Ok(ClientEnvelope { message, timestamp: envelope.timestamp })
}

/// Encode a client message; used by clients and tests.
pub fn encode_client_message(message: &ClientMessage, timestamp: i64) -> String {
    let (kind, data) = match message {
        ClientMessage::Sync { state_vector } => (
            MessageKind::Sync,
            match state_vector {
                Some(vector) => serde_json::json!({ "stateVector": encode_bytes(vector) }),
                None => Value::Null,
            },
        ),
        ClientMessage::Update { diagram_id, update } => (
            MessageKind::Update,
            serde_json::json!({ "diagramId": diagram_id, "update": encode_bytes(update) }),
        ),
        ClientMessage::Cursor { user_id, position } => (
            MessageKind::Cursor,
            serde_json::json!({ "userId": user_id, "position": position }),
        ),
        ClientMessage::Presence { status } => {
            (MessageKind::Presence, serde_json::json!({ "status": status }))
        }
        ClientMessage::Error { code, message } => {
            (MessageKind::Error, serde_json::json!({ "code": code, "message": message }))
        }
    };

    serde_json::json!({ "type": kind.as_str(), "data": data, "timestamp": timestamp }).to_string()
}

fn payload<T: serde::de::DeserializeOwned>(kind: MessageKind, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|error| invalid(kind, error.to_string()))
}

fn invalid(kind: MessageKind, reason: String) -> DecodeError {
    DecodeError::InvalidPayload { kind: kind.as_str(), reason }
}

/// Server -> client messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Sync(SyncSnapshot),
    Update(UpdateBroadcast),
    Cursor(CursorBroadcast),
    /// Cursor removed after inactivity.
    CursorLeave(CursorLeave),
    Presence(PresenceRecord),
    /// Full roster sent to a joining connection.
    Roster(Vec<PresenceRecord>),
    Join(PresenceRecord),
    Leave(PresenceRecord),
    Error(ErrorFrame),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Update(_) => "update",
            Self::Cursor(_) => "cursor",
            Self::CursorLeave(_) => "cursor_leave",
            Self::Presence(_) => "presence",
            Self::Roster(_) => "roster",
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub diagram_id: Uuid,
    /// Base64 encoded CRDT update; the full state unless `diff` is set.
    pub state: String,
    pub state_vector: String,
    #[serde(default)]
    pub diff: bool,
    #[serde(default)]
    pub editors: Vec<EditorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBroadcast {
    pub diagram_id: Uuid,
    pub user_id: Uuid,
    /// Base64 of the delta exactly as received.
    pub update: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CursorBroadcast {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub position: CursorPosition,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorLeave {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorFrame {
    pub message: String,
    pub code: String,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerEnvelope {
    pub message: ServerMessage,
    pub timestamp: i64,
}

pub fn encode_server_message(
    message: &ServerMessage,
    timestamp: i64,
) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(message)?;
    if let Value::Object(fields) = &mut value {
        fields.insert("timestamp".to_string(), Value::from(timestamp));
    }
    serde_json::to_string(&value)
}

pub fn decode_server_message(raw: &str) -> Result<ServerEnvelope, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let timestamp = value.get("timestamp").and_then(Value::as_i64).unwrap_or_default();
    let message = serde_json::from_value::<ServerMessage>(value)?;
    Ok(ServerEnvelope { message, timestamp })
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, String> {
    STANDARD.decode(encoded.trim()).map_err(|error| format!("invalid base64: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_accepts_missing_or_empty_data() {
        let bare = decode_client_message(r#"{"type":"sync","timestamp":1}"#).unwrap();
        assert_eq!(bare.message, ClientMessage::Sync { state_vector: None });
        assert_eq!(bare.timestamp, Some(1));

        let empty = decode_client_message(r#"{"type":"sync","data":{}}"#).unwrap();
        assert_eq!(empty.message, ClientMessage::Sync { state_vector: None });
        assert_eq!(empty.timestamp, None);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let error = decode_client_message(r#"{"type":"teleport","data":{}}"#).unwrap_err();
        assert_eq!(error, DecodeError::UnknownType("teleport".to_string()));
    }

    #[test]
    fn update_requires_valid_base64_payload() {
        let diagram_id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"update","data":{{"diagramId":"{diagram_id}","update":"%%%"}}}}"#);
        assert!(matches!(
            decode_client_message(&raw),
            Err(DecodeError::InvalidPayload { kind: "update", .. })
        ));
    }

    #[test]
    fn update_decodes_bytes() {
        let diagram_id = Uuid::new_v4();
        let raw = encode_client_message(
            &ClientMessage::Update { diagram_id, update: vec![1, 2, 3] },
            42,
        );
        let decoded = decode_client_message(&raw).unwrap();
        assert_eq!(decoded.message, ClientMessage::Update { diagram_id, update: vec![1, 2, 3] });
        assert_eq!(decoded.timestamp, Some(42));
    }

    #[test]
    fn presence_rejects_unknown_status() {
        let error =
            decode_client_message(r#"{"type":"presence","data":{"status":"AWAY"}}"#).unwrap_err();
        assert!(matches!(error, DecodeError::InvalidPayload { kind: "presence", .. }));
    }

    #[test]
    fn cursor_rejects_non_numeric_position() {
        let user_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"cursor","data":{{"userId":"{user_id}","position":{{"x":"a","y":1}}}}}}"#
        );
        assert!(decode_client_message(&raw).is_err());
    }

    #[test]
    fn garbage_is_invalid_json() {
        assert!(matches!(decode_client_message("not json"), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(decode_client_message("[1,2]"), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn server_message_carries_type_data_and_timestamp() {
        let frame = ServerMessage::Error(ErrorFrame {
            message: "slow down".to_string(),
            code: "RATE_LIMITED".to_string(),
            retryable: true,
        });
        let raw = encode_server_message(&frame, 99).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "RATE_LIMITED");
        assert_eq!(value["timestamp"], 99);

        let decoded = decode_server_message(&raw).unwrap();
        assert_eq!(decoded.message, frame);
        assert_eq!(decoded.timestamp, 99);
    }
}
