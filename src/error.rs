//! Error types for mcp-relay.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors (configuration, startup, store plumbing).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced at the relay's HTTP boundary.
///
/// Client errors pass through verbatim and are neither retried nor
/// breaker-tracked; transient store faults become 503; everything the
/// relay cannot recover from locally becomes 500.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Session not found: {0}")]
    UnknownSession(String),

    #[error("Session store unavailable")]
    StoreUnavailable,

    #[error("Concurrent update conflict for session {0}")]
    ConflictExhausted(String),

    #[error("Illegal session transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Malformed(_) => StatusCode::BAD_REQUEST,
            RelayError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::UnknownSession(_) => StatusCode::NOT_FOUND,
            RelayError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::ConflictExhausted(_)
            | RelayError::IllegalTransition { .. }
            | RelayError::Upstream(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn jsonrpc_code(&self) -> i64 {
        match self {
            RelayError::Malformed(_) => -32700,
            RelayError::BodyTooLarge(_) => -32600,
            RelayError::UnknownSession(_) => crate::types::CODE_SESSION_NOT_FOUND,
            RelayError::StoreUnavailable => -32002,
            _ => -32603,
        }
    }

    fn client_message(&self) -> String {
        match self {
            // Exact wire message for unknown sessions; the id stays in logs.
            RelayError::UnknownSession(_) => "Session not found".to_string(),
            RelayError::StoreUnavailable => {
                "Session store temporarily unavailable, retry later".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Render with an explicit status, for the legacy unknown-session mode
    /// where 400 is expected instead of 404.
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let body = Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.jsonrpc_code(),
                "message": self.client_message(),
            },
            "id": null
        }));
        (status, body).into_response()
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.into_response_with_status(status)
    }
}

impl From<Error> for RelayError {
    fn from(err: Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}
