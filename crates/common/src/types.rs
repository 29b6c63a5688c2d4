// Core domain types shared by the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live status of a user inside a workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceStatus {
    Online,
    Idle,
    Editing,
    Viewing,
}

impl PresenceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Idle => "IDLE",
            Self::Editing => "EDITING",
            Self::Viewing => "VIEWING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ONLINE" => Some(Self::Online),
            "IDLE" => Some(Self::Idle),
            "EDITING" => Some(Self::Editing),
            "VIEWING" => Some(Self::Viewing),
            _ => None,
        }
    }
}

/// Pointer coordinates in diagram space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// NaN and infinities are rejected at the protocol boundary.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Presence of one user in one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<CursorPosition>,
}

impl PresenceRecord {
    pub fn online(workspace_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            workspace_id,
            user_id,
            status: PresenceStatus::Online,
            last_active_at: now,
            cursor_position: None,
        }
    }

    /// A record is stale once it has gone `ttl` without activity.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_active_at) > ttl
    }
}

/// Collaborator that placed an edit into a diagram session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EditorSummary {
    pub user_id: Uuid,
    pub connection_count: usize,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edit_at: Option<DateTime<Utc>>,
}
