pub mod jwt;
pub mod middleware;

use std::{future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceRole {
    Owner,
    Editor,
    Commenter,
    Viewer,
}

impl WorkspaceRole {
    /// Whether the role may submit document updates.
    pub const fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Commenter => "commenter",
            Self::Viewer => "viewer",
        }
    }
}

/// Identity extracted from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub role: WorkspaceRole,
    /// Set when the token is scoped to a single diagram.
    pub diagram_id: Option<Uuid>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing access token")]
    MissingToken,
    #[error("access token expired")]
    Expired,
    #[error("invalid access token: {0}")]
    Invalid(String),
    #[error("token is not valid for diagram {0}")]
    WrongDiagram(Uuid),
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

/// Boxed future returned by [`TokenVerifier`] so the trait stays object safe.
pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = Result<VerifiedClaims, AuthError>> + Send + 'a>>;

/// External auth collaborator.
pub trait TokenVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> VerifyFuture<'a>;
}
