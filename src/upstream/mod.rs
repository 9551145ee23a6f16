//! The seam between the relay and the MCP SDK it fronts.
//!
//! The SDK owns the authoritative in-memory transport map; the relay only
//! ever touches it through this trait. `create_transport_for_session` is
//! the rehydration hook and MUST be idempotent: concurrent admissions for
//! the same id converge on one transport.

pub mod local;

use axum::body::Body;
use axum::http::{Request, Response};
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub use local::LocalMcpServer;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handler error: {0}")]
    Handler(String),
}

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

#[async_trait]
pub trait UpstreamSessionManager: Send + Sync {
    /// Whether this instance already holds in-memory transport state for
    /// the session.
    fn has_transport(&self, session_id: &str) -> bool;

    /// Reconstruct in-memory transport state for a session this instance
    /// has never seen, from the durable record's metadata. Idempotent: an
    /// existing transport is returned untouched.
    async fn create_transport_for_session(
        &self,
        session_id: &str,
        metadata: &Map<String, Value>,
    ) -> UpstreamResult<()>;

    /// Push a synthetic client-to-server message into an existing
    /// transport's inbound channel (warming).
    async fn inject_client_message(&self, session_id: &str, message: Value) -> UpstreamResult<()>;

    /// The MCP handler entry point requests are forwarded to.
    async fn handle(&self, request: Request<Body>) -> UpstreamResult<Response<Body>>;
}
