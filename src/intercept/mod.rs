//! Protocol interceptor: watches JSON-RPC traffic at the transport
//! boundary and drives session lifecycle plus the event log.
//!
//! Observations for one session are serialized through a striped keyed
//! lock; different sessions proceed in parallel. Stripes may be held
//! across store calls but are always released before upstream forwarding.

use crate::events::EventLog;
use crate::session::{SessionError, SessionManager, SessionResult};
use crate::types::{
    Direction, EventKind, JsonRpcFrame, SessionStatus, StreamKey, CODE_SESSION_GONE,
};
use serde_json::{json, Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const DEFAULT_STRIPES: usize = 64;

/// What the wrapper learned about a request before forwarding it.
#[derive(Debug, Clone)]
pub struct RequestObservation {
    /// Session id discovered from headers/params, if any.
    pub session_id: Option<String>,
    /// The buffered JSON body (single object or batch).
    pub body: Value,
}

impl RequestObservation {
    pub fn frames(&self) -> Vec<JsonRpcFrame> {
        JsonRpcFrame::parse_body(&self.body)
    }

    pub fn is_initialize(&self) -> bool {
        self.frames().iter().any(JsonRpcFrame::is_initialize)
    }
}

pub struct ProtocolInterceptor {
    sessions: Arc<SessionManager>,
    events: Arc<EventLog>,
    stripes: Vec<Mutex<()>>,
}

impl ProtocolInterceptor {
    pub fn new(sessions: Arc<SessionManager>, events: Arc<EventLog>) -> Self {
        Self {
            sessions,
            events,
            stripes: (0..DEFAULT_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, session_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    /// Observe a client POST body before it is forwarded upstream.
    ///
    /// An illegal lifecycle transition (a replayed handshake for a
    /// session that is already over), an exhausted CAS loop, or a store
    /// fault all bubble up so the wrapper can answer instead of
    /// forwarding; nothing is recorded for the offending frame.
    pub async fn observe_request(&self, observation: &RequestObservation) -> SessionResult<()> {
        let Some(session_id) = observation.session_id.as_deref() else {
            if observation.is_initialize() {
                debug!("initialize request pending, no session id yet");
            }
            return Ok(());
        };

        let _guard = self.stripe(session_id).lock().await;

        for raw in body_objects(&observation.body) {
            let Some(frame) = JsonRpcFrame::parse(raw) else {
                warn!(session_id, "unrecognized client frame, passing through");
                continue;
            };

            if frame.is_initialized_notification() {
                match self
                    .sessions
                    .transition(session_id, SessionStatus::Initialized, SessionStatus::Active, None)
                    .await
                {
                    Ok(_) => {}
                    Err(SessionError::NotFound) => {
                        warn!(session_id, "initialized notification for unknown session");
                    }
                    Err(err @ SessionError::IllegalTransition { .. }) => {
                        error!(session_id, error = %err, "handshake replay outside the lifecycle DAG");
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            }

            self.record_client_frame(session_id, &frame, raw).await;
        }
        Ok(())
    }

    /// Observe a buffered JSON response after the upstream handled the
    /// request. `response_session_id` is the `Mcp-Session-Id` the upstream
    /// put on the response, which is authoritative for `initialize`.
    pub async fn observe_json_response(
        &self,
        observation: &RequestObservation,
        response_session_id: Option<&str>,
        http_status: u16,
        response_body: Option<&Value>,
    ) {
        let session_id = response_session_id
            .or(observation.session_id.as_deref())
            .map(str::to_string);
        let Some(session_id) = session_id else {
            return;
        };

        let _guard = self.stripe(&session_id).lock().await;

        // A successful initialize response with a server-assigned id is
        // the moment a session is born. The id is echoed, never minted
        // here.
        if observation.is_initialize() && response_session_id.is_some() && http_status < 400 {
            self.create_from_initialize(&session_id, observation, response_body)
                .await;
        }

        if let Some(body) = response_body {
            if http_status >= 400 {
                self.record(
                    &session_id,
                    StreamKey::Request,
                    Direction::ServerToClient,
                    EventKind::Error,
                    None,
                    None,
                    body.clone(),
                )
                .await;
            } else {
                for raw in body_objects(body) {
                    match JsonRpcFrame::parse(raw) {
                        Some(frame) => {
                            self.record(
                                &session_id,
                                StreamKey::Request,
                                Direction::ServerToClient,
                                frame.kind(),
                                frame.method().map(str::to_string),
                                frame.jsonrpc_id().cloned(),
                                raw.clone(),
                            )
                            .await;
                        }
                        None => {
                            warn!(session_id, "unrecognized upstream frame, passing through");
                        }
                    }
                }
            }
        }

        // Closing comes last so the terminal observation is still on the
        // stream before the record stops accepting appends.
        if self.is_session_gone(http_status, response_body) {
            debug!(session_id, "terminal session-gone signal from upstream");
            if let Err(err) = self.sessions.close(&session_id).await {
                warn!(session_id, error = %err, "failed to close session on terminal signal");
            }
        }
    }

    /// Observe one SSE data payload that may be the deferred response to
    /// an `initialize` request the upstream chose to answer over SSE
    /// instead of JSON. Returns true when the event was consumed as that
    /// response: the session record is created and the REQUEST and
    /// RESPONSE events land on the request stream, exactly as the
    /// buffered JSON path does. Notifications the upstream interleaves
    /// before the response are left for the regular observation path.
    pub async fn observe_initialize_sse_response(
        &self,
        observation: &RequestObservation,
        session_id: &str,
        data: &str,
    ) -> bool {
        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return false,
        };

        let init_id = body_objects(&observation.body)
            .filter_map(JsonRpcFrame::parse)
            .find(JsonRpcFrame::is_initialize)
            .and_then(|frame| frame.jsonrpc_id().cloned());
        let frame = match JsonRpcFrame::parse(&value) {
            Some(frame @ JsonRpcFrame::Response { .. })
                if frame.jsonrpc_id() == init_id.as_ref() =>
            {
                frame
            }
            _ => return false,
        };

        let _guard = self.stripe(session_id).lock().await;

        self.create_from_initialize(session_id, observation, Some(&value))
            .await;
        self.record(
            session_id,
            StreamKey::Request,
            Direction::ServerToClient,
            frame.kind(),
            frame.method().map(str::to_string),
            frame.jsonrpc_id().cloned(),
            value,
        )
        .await;
        true
    }

    /// Observe one SSE `data:` payload as it streams through the tee.
    pub async fn observe_sse_data(&self, session_id: &str, stream_key: StreamKey, data: &str) {
        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => {
                debug!(session_id, "non-JSON SSE data, passing through");
                return;
            }
        };

        let _guard = self.stripe(session_id).lock().await;

        match JsonRpcFrame::parse(&value) {
            Some(frame) => {
                let terminal = self.frame_is_terminal(&frame);
                self.record(
                    session_id,
                    stream_key,
                    Direction::ServerToClient,
                    frame.kind(),
                    frame.method().map(str::to_string),
                    frame.jsonrpc_id().cloned(),
                    value,
                )
                .await;
                if terminal {
                    debug!(session_id, "terminal error on SSE stream");
                    if let Err(err) = self.sessions.close(session_id).await {
                        warn!(session_id, error = %err, "failed to close session");
                    }
                }
            }
            None => {
                warn!(session_id, "unrecognized SSE frame, passing through");
            }
        }
    }

    /// Explicit DELETE on the MCP endpoint. Closes the session and leaves
    /// a synthetic close marker in the event stream. Store faults bubble
    /// up so the wrapper can answer 503.
    pub async fn observe_delete(&self, session_id: &str) -> SessionResult<()> {
        let _guard = self.stripe(session_id).lock().await;

        self.sessions.close(session_id).await?;
        self.record(
            session_id,
            StreamKey::Request,
            Direction::ClientToServer,
            EventKind::Notification,
            Some("session/delete".to_string()),
            None,
            json!({"jsonrpc": "2.0", "method": "session/delete"}),
        )
        .await;
        // Appends only cap streams approximately; the session ending is
        // when they get settled to the exact retention bound.
        if let Err(err) = self.events.compact(session_id).await {
            warn!(session_id, error = %err, "failed to compact event streams");
        }
        Ok(())
    }

    async fn create_from_initialize(
        &self,
        session_id: &str,
        observation: &RequestObservation,
        response_body: Option<&Value>,
    ) {
        let metadata = initialize_metadata(observation, response_body);
        match self.sessions.create(session_id, metadata).await {
            Ok(_) => {}
            // Another instance observed the same id first; converge.
            Err(SessionError::Exists) => {
                debug!(session_id, "session record already present");
            }
            Err(err) => {
                warn!(session_id, error = %err, "failed to create session record");
                return;
            }
        }

        for raw in body_objects(&observation.body) {
            if let Some(frame) = JsonRpcFrame::parse(raw) {
                self.record(
                    session_id,
                    StreamKey::Request,
                    Direction::ClientToServer,
                    frame.kind(),
                    frame.method().map(str::to_string),
                    frame.jsonrpc_id().cloned(),
                    raw.clone(),
                )
                .await;
            }
        }
    }

    fn frame_is_terminal(&self, frame: &JsonRpcFrame) -> bool {
        matches!(frame, JsonRpcFrame::Error { code, .. } if *code == CODE_SESSION_GONE)
    }

    fn is_session_gone(&self, http_status: u16, body: Option<&Value>) -> bool {
        if http_status == 404 {
            return true;
        }
        body.map(|body| {
            body_objects(body).any(|raw| {
                matches!(
                    JsonRpcFrame::parse(raw),
                    Some(JsonRpcFrame::Error { code, .. }) if code == CODE_SESSION_GONE
                )
            })
        })
        .unwrap_or(false)
    }

    async fn record_client_frame(&self, session_id: &str, frame: &JsonRpcFrame, raw: &Value) {
        self.record(
            session_id,
            StreamKey::Request,
            Direction::ClientToServer,
            frame.kind(),
            frame.method().map(str::to_string),
            frame.jsonrpc_id().cloned(),
            raw.clone(),
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        direction: Direction,
        kind: EventKind,
        method: Option<String>,
        jsonrpc_id: Option<Value>,
        payload: Value,
    ) {
        if let Err(err) = self
            .events
            .record(session_id, stream_key, direction, kind, method, jsonrpc_id, payload)
            .await
        {
            // Recording is best-effort; the request itself must not fail
            // because the audit trail hiccupped.
            warn!(session_id, error = %err, "failed to record event");
        }
    }
}

/// Metadata stored on create: the initialize request params plus the
/// protocol version the upstream actually negotiated.
fn initialize_metadata(
    observation: &RequestObservation,
    response_body: Option<&Value>,
) -> Map<String, Value> {
    let mut metadata = Map::new();

    let init_params = body_objects(&observation.body)
        .filter_map(JsonRpcFrame::parse)
        .find(JsonRpcFrame::is_initialize)
        .and_then(|frame| frame.params().cloned());
    if let Some(Value::Object(params)) = init_params {
        for (key, value) in params {
            metadata.insert(key, value);
        }
    }

    let negotiated = response_body
        .into_iter()
        .flat_map(body_objects)
        .filter_map(JsonRpcFrame::parse)
        .find_map(|frame| match frame {
            JsonRpcFrame::Response { result, .. } => {
                result.get("protocolVersion").cloned()
            }
            _ => None,
        });
    if let Some(version) = negotiated {
        metadata.insert("protocolVersion".to_string(), version);
    }

    metadata
}

/// Iterate the outermost objects of a body, batch or single.
fn body_objects(body: &Value) -> BodyIter<'_> {
    match body {
        Value::Array(items) => BodyIter::Many(items.iter()),
        other => BodyIter::One(std::iter::once(other)),
    }
}

enum BodyIter<'a> {
    Many(std::slice::Iter<'a, Value>),
    One(std::iter::Once<&'a Value>),
}

impl<'a> Iterator for BodyIter<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            BodyIter::Many(iter) => iter.next(),
            BodyIter::One(iter) => iter.next(),
        }
    }
}
