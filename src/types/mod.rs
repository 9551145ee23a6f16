//! Core protocol and session data structures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Header carrying the session identifier, per the Streamable HTTP binding.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Legacy alias some clients still send.
pub const SESSION_ID_HEADER_LEGACY: &str = "x-mcp-session-id";

/// Per-stream resumption cursor header. Never used to locate a session.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// JSON-RPC method opening a session.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Client notification completing the initialization handshake.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// JSON-RPC error code returned for unknown or closed sessions.
pub const CODE_SESSION_NOT_FOUND: i64 = -32000;

/// JSON-RPC error code treated as a terminal session-gone signal when it
/// appears in an upstream response.
pub const CODE_SESSION_GONE: i64 = -32001;

/// Session lifecycle states.
///
/// `Initializing` only ever exists in memory on the instance that observed
/// the pending `initialize` request; persisted records are always one of
/// the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Initialized,
    Active,
    Closed,
}

impl SessionStatus {
    /// Whether `self -> to` is an edge of the lifecycle DAG. No back-edges,
    /// no skipping forward past `Active` except to `Closed`.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        matches!(
            (self, to),
            (SessionStatus::Initializing, SessionStatus::Initialized)
                | (SessionStatus::Initialized, SessionStatus::Active)
                | (SessionStatus::Initialized, SessionStatus::Closed)
                | (SessionStatus::Active, SessionStatus::Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == SessionStatus::Closed
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Initialized => "initialized",
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Authoritative per-session record stored in the shared backend.
///
/// The `id` is assigned by the upstream MCP transport and treated as an
/// opaque, case-sensitive byte string. `version` is the optimistic
/// concurrency token; it strictly increases on every successful update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque reconstruction hints (negotiated protocol version, client
    /// capability summary, auth context). Passed verbatim to the upstream
    /// during rehydration.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub version: u64,
    /// Instance that most recently owned live streaming state. Advisory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_hint: Option<String>,
}

impl SessionRecord {
    pub fn new(id: String, metadata: Map<String, Value>, owner_hint: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: SessionStatus::Initialized,
            created_at: now,
            updated_at: now,
            metadata,
            version: 1,
            owner_hint,
        }
    }
}

/// Sub-stream discriminator for the per-session event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKey {
    /// SSE responses tied to a POST request.
    Request,
    /// The standalone GET stream.
    Standalone,
}

impl StreamKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKey::Request => "request",
            StreamKey::Standalone => "standalone",
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the wire a message was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Shape of an observed JSON-RPC message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Request,
    Response,
    Notification,
    Error,
}

/// Payload handed to the store for appending; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub direction: Direction,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc_id: Option<Value>,
    pub payload: Value,
    pub observed_at: DateTime<Utc>,
}

/// A persisted protocol event.
///
/// `event_id` is unique and ordered within one `(session, stream_key)`
/// stream only; it is not globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub stream_key: StreamKey,
    pub direction: Direction,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc_id: Option<Value>,
    pub payload: Value,
    pub observed_at: DateTime<Utc>,
}

/// Parsed view of one outermost JSON-RPC object.
///
/// The interceptor only needs method/id/result shapes; params and results
/// stay as raw `Value`s.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcFrame {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
        result: Value,
    },
    Error {
        id: Value,
        code: i64,
        message: String,
    },
}

impl JsonRpcFrame {
    /// Classify a single JSON-RPC object. Returns `None` for values that
    /// are not recognizable frames (those are passed through untouched).
    pub fn parse(value: &Value) -> Option<JsonRpcFrame> {
        let obj = value.as_object()?;
        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return None;
        }
        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let params = obj.get("params").cloned();
            return Some(match obj.get("id") {
                Some(id) if !id.is_null() => JsonRpcFrame::Request {
                    id: id.clone(),
                    method: method.to_string(),
                    params,
                },
                _ => JsonRpcFrame::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }
        let id = obj.get("id").cloned().unwrap_or(Value::Null);
        if let Some(error) = obj.get("error").and_then(Value::as_object) {
            return Some(JsonRpcFrame::Error {
                id,
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        obj.get("result").map(|result| JsonRpcFrame::Response {
            id,
            result: result.clone(),
        })
    }

    /// Parse a request or response body: a single object or a batch array.
    /// Unrecognizable elements are skipped.
    pub fn parse_body(value: &Value) -> Vec<JsonRpcFrame> {
        match value {
            Value::Array(items) => items.iter().filter_map(JsonRpcFrame::parse).collect(),
            other => JsonRpcFrame::parse(other).into_iter().collect(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcFrame::Request { method, .. } | JsonRpcFrame::Notification { method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    pub fn jsonrpc_id(&self) -> Option<&Value> {
        match self {
            JsonRpcFrame::Request { id, .. }
            | JsonRpcFrame::Response { id, .. }
            | JsonRpcFrame::Error { id, .. } => Some(id),
            JsonRpcFrame::Notification { .. } => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            JsonRpcFrame::Request { params, .. } | JsonRpcFrame::Notification { params, .. } => {
                params.as_ref()
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            JsonRpcFrame::Request { .. } => EventKind::Request,
            JsonRpcFrame::Notification { .. } => EventKind::Notification,
            JsonRpcFrame::Response { .. } => EventKind::Response,
            JsonRpcFrame::Error { .. } => EventKind::Error,
        }
    }

    pub fn is_initialize(&self) -> bool {
        self.method() == Some(METHOD_INITIALIZE)
    }

    pub fn is_initialized_notification(&self) -> bool {
        matches!(self, JsonRpcFrame::Notification { method, .. } if method == METHOD_INITIALIZED)
    }
}
