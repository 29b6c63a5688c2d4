use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use erdsync_common::protocol::ws::{close_code, ErrorFrame};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthInvalidToken,
    AuthForbidden,
    CapacityExceeded,
    RateLimited,
    MalformedMessage,
    StorageUnavailable,
    SyncConflict,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::SyncConflict => "SYNC_CONFLICT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::MalformedMessage => StatusCode::BAD_REQUEST,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::SyncConflict => StatusCode::CONFLICT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded
                | Self::RateLimited
                | Self::StorageUnavailable
                | Self::SyncConflict
                | Self::InternalError
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller lacks required permission",
            Self::CapacityExceeded => "workspace connection limit reached",
            Self::RateLimited => "request was rate limited",
            Self::MalformedMessage => "message could not be parsed",
            Self::StorageUnavailable => "storage backend is unavailable",
            Self::SyncConflict => "document state diverged, resync required",
            Self::InternalError => "internal server error",
        }
    }
}

/// Failure categories of the collaboration engine.
///
/// Fatal categories carry a close code; the rest drop the offending message
/// and keep the connection open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollabError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("workspace {workspace_id} is at its limit of {limit} connections")]
    CapacityExceeded { workspace_id: Uuid, limit: usize },
    #[error("rate limit exceeded for {resource}; retry in {retry_after_ms}ms")]
    RateLimitExceeded { resource: String, retry_after_ms: u64 },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("sync conflict: {0}")]
    SyncConflict(String),
}

impl CollabError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication(_) => ErrorCode::AuthInvalidToken,
            Self::Forbidden(_) => ErrorCode::AuthForbidden,
            Self::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimited,
            Self::MalformedMessage(_) => ErrorCode::MalformedMessage,
            Self::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            Self::SyncConflict(_) => ErrorCode::SyncConflict,
        }
    }

    /// Close code for errors that terminate the connection.
    pub const fn close_code(&self) -> Option<u16> {
        match self {
            Self::Authentication(_) => Some(close_code::AUTHENTICATION_FAILED),
            Self::CapacityExceeded { .. } => Some(close_code::CAPACITY_EXCEEDED),
            Self::StorageUnavailable(_) => Some(close_code::STORAGE_UNAVAILABLE),
            Self::SyncConflict(_) => Some(close_code::SYNC_CONFLICT),
            Self::Forbidden(_) | Self::RateLimitExceeded { .. } | Self::MalformedMessage(_) => None,
        }
    }

    pub const fn is_fatal(&self) -> bool {
        self.close_code().is_some()
    }

    pub fn to_frame(&self) -> ErrorFrame {
        let code = self.code();
        ErrorFrame {
            message: self.to_string(),
            code: code.as_str().to_string(),
            retryable: code.retryable(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
    request_id: Option<String>,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<CollabError> for RelayError {
    fn from(error: CollabError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": {},
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
