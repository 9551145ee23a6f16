//! Reference in-process MCP upstream.
//!
//! A minimal Streamable HTTP server used by the standalone binary and the
//! integration tests: it assigns session ids on `initialize`, enforces the
//! session header on everything else, answers `tools/list` from a fixed
//! tool set, can stream a response as SSE with `id:` lines, and honors
//! `Last-Event-ID` replay from a per-session buffer. It stands in for the
//! MCP SDK a real deployment embeds.

use super::{UpstreamError, UpstreamResult, UpstreamSessionManager};
use crate::types::{JsonRpcFrame, CODE_SESSION_GONE, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, request, Method, Request, Response, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Default)]
struct TransportState {
    active: bool,
    /// Messages pushed through `inject_client_message`.
    injected: Vec<Value>,
    /// Events emitted on SSE responses, kept for Last-Event-ID replay.
    emitted: Vec<SseEventRecord>,
    next_event: u64,
}

#[derive(Clone)]
struct SseEventRecord {
    id: String,
    data: String,
}

#[derive(Default)]
pub struct LocalMcpServer {
    transports: DashMap<String, TransportState>,
    create_calls: AtomicU32,
    /// Answer `initialize` over SSE instead of JSON, as Streamable HTTP
    /// permits per upstream choice.
    sse_initialize: bool,
}

impl LocalMcpServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sse_initialize() -> Self {
        Self {
            sse_initialize: true,
            ..Self::default()
        }
    }

    // Test and demo accessors.

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn injected_messages(&self, session_id: &str) -> Vec<Value> {
        self.transports
            .get(session_id)
            .map(|t| t.injected.clone())
            .unwrap_or_default()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.transports
            .get(session_id)
            .map(|t| t.active)
            .unwrap_or(false)
    }

    fn session_from(&self, parts: &request::Parts) -> Option<String> {
        parts
            .headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn json_response(
        &self,
        status: StatusCode,
        session_id: Option<&str>,
        body: Value,
    ) -> Response<Body> {
        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = session_id {
            builder = builder.header(SESSION_ID_HEADER, id);
        }
        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    fn session_gone(&self) -> Response<Body> {
        self.json_response(
            StatusCode::NOT_FOUND,
            None,
            json!({
                "jsonrpc": "2.0",
                "error": {"code": CODE_SESSION_GONE, "message": "Session terminated"},
                "id": null
            }),
        )
    }

    fn sse_response(&self, events: Vec<SseEventRecord>) -> Response<Body> {
        let chunks: Vec<Result<Bytes, std::io::Error>> = events
            .into_iter()
            .map(|event| {
                Ok(Bytes::from(format!(
                    "id: {}\ndata: {}\n\n",
                    event.id, event.data
                )))
            })
            .collect();
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }

    fn handle_initialize(&self, frame: &JsonRpcFrame) -> Response<Body> {
        // The upstream is the only party that ever mints a session id.
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(session_id, "local upstream assigned session");

        let id = frame.jsonrpc_id().cloned().unwrap_or(Value::Null);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mcp-relay-local", "version": env!("CARGO_PKG_VERSION")}
            }
        });

        if self.sse_initialize {
            let mut transport = TransportState::default();
            transport.next_event = 1;
            let record = SseEventRecord {
                id: "e1".to_string(),
                data: body.to_string(),
            };
            transport.emitted.push(record.clone());
            self.transports.insert(session_id.clone(), transport);

            let mut response = self.sse_response(vec![record]);
            if let Ok(value) = session_id.parse() {
                response.headers_mut().insert(SESSION_ID_HEADER, value);
            }
            return response;
        }

        self.transports
            .insert(session_id.clone(), TransportState::default());
        self.json_response(StatusCode::OK, Some(&session_id), body)
    }

    fn handle_request_frame(&self, session_id: &str, frame: &JsonRpcFrame) -> Response<Body> {
        let id = frame.jsonrpc_id().cloned().unwrap_or(Value::Null);
        match frame.method() {
            Some("tools/list") => self.json_response(
                StatusCode::OK,
                Some(session_id),
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "tools": [{
                            "name": "echo",
                            "description": "Echo the input back",
                            "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
                        }]
                    }
                }),
            ),
            Some("demo/stream") => {
                let count = frame
                    .params()
                    .and_then(|p| p.get("events"))
                    .and_then(Value::as_u64)
                    .unwrap_or(3);
                let mut events = Vec::new();
                {
                    let mut transport = match self.transports.get_mut(session_id) {
                        Some(t) => t,
                        None => return self.session_gone(),
                    };
                    for _ in 0..count {
                        transport.next_event += 1;
                        let seq = transport.next_event;
                        let record = SseEventRecord {
                            id: format!("e{}", seq),
                            data: json!({
                                "jsonrpc": "2.0",
                                "method": "notifications/message",
                                "params": {"seq": seq}
                            })
                            .to_string(),
                        };
                        transport.emitted.push(record.clone());
                        events.push(record);
                    }
                    transport.next_event += 1;
                    let seq = transport.next_event;
                    let record = SseEventRecord {
                        id: format!("e{}", seq),
                        data: json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {"delivered": count}
                        })
                        .to_string(),
                    };
                    transport.emitted.push(record.clone());
                    events.push(record);
                }
                self.sse_response(events)
            }
            Some(method) => self.json_response(
                StatusCode::OK,
                Some(session_id),
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"ok": true, "method": method}
                }),
            ),
            None => self.json_response(
                StatusCode::OK,
                Some(session_id),
                json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            ),
        }
    }

    async fn handle_post(
        &self,
        parts: request::Parts,
        body: Body,
    ) -> UpstreamResult<Response<Body>> {
        let bytes = axum::body::to_bytes(body, 4 * 1024 * 1024)
            .await
            .map_err(|e| UpstreamError::Handler(e.to_string()))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| UpstreamError::Handler(format!("invalid JSON: {}", e)))?;
        let frames = JsonRpcFrame::parse_body(&value);

        if let Some(init) = frames.iter().find(|f| f.is_initialize()) {
            return Ok(self.handle_initialize(init));
        }

        let Some(session_id) = self.session_from(&parts) else {
            return Ok(self.json_response(
                StatusCode::BAD_REQUEST,
                None,
                json!({
                    "jsonrpc": "2.0",
                    "error": {"code": -32600, "message": "Missing session id"},
                    "id": null
                }),
            ));
        };
        if !self.transports.contains_key(&session_id) {
            return Ok(self.session_gone());
        }

        // Notifications are accepted without a response body.
        if frames
            .iter()
            .all(|f| matches!(f, JsonRpcFrame::Notification { .. }))
        {
            if frames.iter().any(JsonRpcFrame::is_initialized_notification) {
                if let Some(mut transport) = self.transports.get_mut(&session_id) {
                    transport.active = true;
                }
            }
            let mut response = Response::builder()
                .status(StatusCode::ACCEPTED)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()));
            response.headers_mut().insert(
                SESSION_ID_HEADER,
                session_id.parse().map_err(|_| {
                    UpstreamError::Transport("session id not header-safe".into())
                })?,
            );
            return Ok(response);
        }

        let request_frame = frames
            .iter()
            .find(|f| matches!(f, JsonRpcFrame::Request { .. }));
        match request_frame {
            Some(frame) => Ok(self.handle_request_frame(&session_id, frame)),
            None => Ok(self.json_response(
                StatusCode::BAD_REQUEST,
                Some(&session_id),
                json!({
                    "jsonrpc": "2.0",
                    "error": {"code": -32600, "message": "No request in body"},
                    "id": null
                }),
            )),
        }
    }

    fn handle_get(&self, parts: &request::Parts) -> Response<Body> {
        let Some(session_id) = self.session_from(parts) else {
            return self.session_gone();
        };
        let Some(transport) = self.transports.get(&session_id) else {
            return self.session_gone();
        };

        let last_event_id = parts
            .headers
            .get(LAST_EVENT_ID_HEADER)
            .and_then(|v| v.to_str().ok());
        let events = match last_event_id {
            Some(cursor) => {
                let start = transport
                    .emitted
                    .iter()
                    .position(|e| e.id == cursor)
                    .map(|idx| idx + 1)
                    .unwrap_or(0);
                transport.emitted[start..].to_vec()
            }
            None => Vec::new(),
        };
        drop(transport);
        self.sse_response(events)
    }

    fn handle_delete(&self, parts: &request::Parts) -> Response<Body> {
        let Some(session_id) = self.session_from(parts) else {
            return self.session_gone();
        };
        match self.transports.remove(&session_id) {
            Some(_) => {
                debug!(session_id, "local upstream dropped transport");
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::empty())
                    .unwrap_or_else(|_| Response::new(Body::empty()))
            }
            None => self.session_gone(),
        }
    }
}

#[async_trait]
impl UpstreamSessionManager for LocalMcpServer {
    fn has_transport(&self, session_id: &str) -> bool {
        self.transports.contains_key(session_id)
    }

    async fn create_transport_for_session(
        &self,
        session_id: &str,
        _metadata: &Map<String, Value>,
    ) -> UpstreamResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        // Entry-based insert keeps concurrent rehydrations down to one
        // transport.
        self.transports
            .entry(session_id.to_string())
            .or_default();
        Ok(())
    }

    async fn inject_client_message(&self, session_id: &str, message: Value) -> UpstreamResult<()> {
        let mut transport = self
            .transports
            .get_mut(session_id)
            .ok_or_else(|| UpstreamError::UnknownSession(session_id.to_string()))?;
        if JsonRpcFrame::parse(&message)
            .map(|f| f.is_initialized_notification())
            .unwrap_or(false)
        {
            transport.active = true;
        }
        transport.injected.push(message);
        Ok(())
    }

    async fn handle(&self, request: Request<Body>) -> UpstreamResult<Response<Body>> {
        let (parts, body) = request.into_parts();
        match parts.method {
            Method::POST => self.handle_post(parts, body).await,
            Method::GET => Ok(self.handle_get(&parts)),
            Method::DELETE => Ok(self.handle_delete(&parts)),
            _ => Ok(Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::METHOD_INITIALIZED;

    fn post(session: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(id) = session {
            builder = builder.header(SESSION_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn initialize_assigns_session_and_transport() {
        let upstream = LocalMcpServer::new();
        let response = upstream
            .handle(post(
                None,
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            ))
            .await
            .unwrap();

        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(upstream.has_transport(&session_id));

        let body = body_json(response).await;
        assert_eq!(body["result"]["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn unknown_session_is_terminal_404() {
        let upstream = LocalMcpServer::new();
        let response = upstream
            .handle(post(
                Some("s-never"),
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], CODE_SESSION_GONE);
    }

    #[tokio::test]
    async fn rehydration_is_idempotent() {
        let upstream = LocalMcpServer::new();
        let metadata = Map::new();
        upstream
            .create_transport_for_session("s-1", &metadata)
            .await
            .unwrap();
        upstream
            .create_transport_for_session("s-1", &metadata)
            .await
            .unwrap();
        assert_eq!(upstream.transport_count(), 1);
        assert_eq!(upstream.create_calls(), 2);
    }

    #[tokio::test]
    async fn injected_initialized_marks_active() {
        let upstream = LocalMcpServer::new();
        upstream
            .create_transport_for_session("s-1", &Map::new())
            .await
            .unwrap();
        assert!(!upstream.is_active("s-1"));

        upstream
            .inject_client_message(
                "s-1",
                json!({"jsonrpc": "2.0", "method": METHOD_INITIALIZED}),
            )
            .await
            .unwrap();
        assert!(upstream.is_active("s-1"));
        assert_eq!(upstream.injected_messages("s-1").len(), 1);
    }

    #[tokio::test]
    async fn stream_replay_honors_cursor() {
        let upstream = LocalMcpServer::new();
        upstream
            .create_transport_for_session("s-1", &Map::new())
            .await
            .unwrap();

        let response = upstream
            .handle(post(
                Some("s-1"),
                json!({"jsonrpc": "2.0", "id": 2, "method": "demo/stream", "params": {"events": 2}}),
            ))
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("id: e1"));
        assert!(text.contains("id: e3"));

        let replay = Request::builder()
            .method(Method::GET)
            .uri("/mcp")
            .header(SESSION_ID_HEADER, "s-1")
            .header(LAST_EVENT_ID_HEADER, "e1")
            .body(Body::empty())
            .unwrap();
        let response = upstream.handle(replay).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("id: e1\n"));
        assert!(text.contains("id: e2"));
        assert!(text.contains("id: e3"));
    }
}
