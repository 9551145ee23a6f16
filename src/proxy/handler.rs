//! Request handlers for the MCP endpoint: the transport wrapper that
//! stitches admission, interception, and SSE teeing around the upstream.
//!
//! POST bodies are buffered (bounded) so they can be parsed once and
//! forwarded replayably; GET and DELETE are never buffered. SSE responses
//! are observed and forwarded in the same pass, byte for byte.

use crate::admission::AdmissionError;
use crate::error::RelayError;
use crate::intercept::RequestObservation;
use crate::proxy::server::AppState;
use crate::proxy::sse::SseParser;
use crate::session::SessionError;
use crate::types::{
    Direction, EventKind, JsonRpcFrame, StreamKey, LAST_EVENT_ID_HEADER, SESSION_ID_HEADER,
    SESSION_ID_HEADER_LEGACY,
};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// POST {path}: JSON-RPC request, response either JSON or SSE.
pub async fn handle_post(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let content_type = header_str(&parts.headers, header::CONTENT_TYPE.as_str());
    if !content_type.starts_with("application/json") {
        return RelayError::Malformed("Content-Type must be application/json".into())
            .into_response();
    }
    let accept = header_str(&parts.headers, header::ACCEPT.as_str());
    if !accept.is_empty()
        && !(accept.contains("application/json") && accept.contains("text/event-stream"))
    {
        warn!(accept, "Accept should include both application/json and text/event-stream");
    }

    let max_body = state.config.relay.max_body_bytes;
    let bytes = match axum::body::to_bytes(body, max_body).await {
        Ok(bytes) => bytes,
        Err(_) => return RelayError::BodyTooLarge(max_body).into_response(),
    };
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            return RelayError::Malformed(format!("invalid JSON-RPC body: {}", err))
                .into_response()
        }
    };

    let session_id = extract_session_id(&parts.headers, Some(&value));
    let observation = RequestObservation {
        session_id,
        body: value,
    };
    let is_initialize = observation.is_initialize();

    if let Some(id) = observation.session_id.as_deref() {
        if !state.upstream.has_transport(id) {
            if let Err(response) = admission_guard(&state, id, is_initialize).await {
                return response;
            }
        } else if !is_initialize {
            if let Err(response) = closed_session_guard(&state, id).await {
                return response;
            }
        }
    }

    if let Err(err) = state.interceptor.observe_request(&observation).await {
        let session_id = observation.session_id.clone().unwrap_or_default();
        return match err {
            SessionError::IllegalTransition { from, to } => RelayError::IllegalTransition {
                id: session_id,
                from: from.to_string(),
                to: to.to_string(),
            }
            .into_response(),
            SessionError::Conflict => RelayError::ConflictExhausted(session_id).into_response(),
            SessionError::Store(_) => RelayError::StoreUnavailable.into_response(),
            other => RelayError::Internal(other.to_string()).into_response(),
        };
    }

    let had_resume_cursor = parts.headers.contains_key(LAST_EVENT_ID_HEADER);
    let upstream_request = Request::from_parts(parts, Body::from(bytes));
    let response = match state.upstream.handle(upstream_request).await {
        Ok(response) => response,
        Err(err) => {
            if let Some(id) = observation.session_id.as_deref() {
                record_upstream_failure(&state, id, &err.to_string()).await;
            }
            return RelayError::Upstream(err.to_string()).into_response();
        }
    };

    tap_response(state, observation, response, StreamKey::Request, had_resume_cursor).await
}

/// GET {path}: opens the standalone SSE stream. `Last-Event-ID` passes
/// through to the upstream unchanged; replay is the upstream's business.
pub async fn handle_get(State(state): State<AppState>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let session_id = extract_session_id(&parts.headers, None);

    if let Some(id) = session_id.as_deref() {
        if !state.upstream.has_transport(id) {
            if let Err(response) = admission_guard(&state, id, false).await {
                return response;
            }
        } else if let Err(response) = closed_session_guard(&state, id).await {
            return response;
        }
    }

    let had_resume_cursor = parts.headers.contains_key(LAST_EVENT_ID_HEADER);
    let upstream_request = Request::from_parts(parts, Body::empty());
    let response = match state.upstream.handle(upstream_request).await {
        Ok(response) => response,
        Err(err) => {
            if let Some(id) = session_id.as_deref() {
                record_upstream_failure(&state, id, &err.to_string()).await;
            }
            return RelayError::Upstream(err.to_string()).into_response();
        }
    };

    let observation = RequestObservation {
        session_id,
        body: Value::Null,
    };
    tap_response(state, observation, response, StreamKey::Standalone, had_resume_cursor).await
}

/// DELETE {path}: client-initiated termination. The id must arrive via
/// the session header.
pub async fn handle_delete(State(state): State<AppState>, request: Request) -> Response {
    let (parts, _body) = request.into_parts();
    let Some(session_id) = parts
        .headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
    else {
        return RelayError::Malformed("Mcp-Session-Id header required for DELETE".into())
            .into_response();
    };

    let upstream_request = Request::from_parts(parts, Body::empty());
    let response = match state.upstream.handle(upstream_request).await {
        Ok(response) => response,
        Err(err) => {
            record_upstream_failure(&state, &session_id, &err.to_string()).await;
            return RelayError::Upstream(err.to_string()).into_response();
        }
    };

    match state.interceptor.observe_delete(&session_id).await {
        Ok(()) => {}
        Err(SessionError::Store(_)) => return RelayError::StoreUnavailable.into_response(),
        Err(SessionError::Conflict) => {
            return RelayError::ConflictExhausted(session_id).into_response()
        }
        Err(err) => {
            warn!(session_id, error = %err, "session close after DELETE failed");
        }
    }

    response
}

/// Liveness probe.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Run the admission controller and render its refusals, honoring the
/// configured unknown-session status.
async fn admission_guard(
    state: &AppState,
    session_id: &str,
    is_initialize: bool,
) -> Result<(), Response> {
    match state.admission.admit(session_id, is_initialize).await {
        Ok(()) => Ok(()),
        Err(AdmissionError::UnknownSession(id)) => {
            let status = StatusCode::from_u16(state.config.relay.unknown_session_status)
                .unwrap_or(StatusCode::NOT_FOUND);
            Err(RelayError::UnknownSession(id).into_response_with_status(status))
        }
        Err(AdmissionError::SessionClosed(id)) => {
            Err(RelayError::UnknownSession(id).into_response())
        }
        Err(AdmissionError::StoreUnavailable) => Err(RelayError::StoreUnavailable.into_response()),
        Err(AdmissionError::Upstream(message)) => {
            Err(RelayError::Upstream(message).into_response())
        }
    }
}

/// A live local transport does not exempt a session from the durable
/// verdict: one closed or reaped elsewhere stops being served here too.
/// Reads go through the session manager, so the per-node cache keeps this
/// off the store for hot sessions; a transient store fault keeps serving
/// the local state rather than taking the session down.
async fn closed_session_guard(state: &AppState, session_id: &str) -> Result<(), Response> {
    match state.sessions.get(session_id).await {
        Ok(record) if record.status.is_closed() => {
            Err(RelayError::UnknownSession(session_id.to_string()).into_response())
        }
        Err(SessionError::NotFound) => {
            let status = StatusCode::from_u16(state.config.relay.unknown_session_status)
                .unwrap_or(StatusCode::NOT_FOUND);
            Err(RelayError::UnknownSession(session_id.to_string())
                .into_response_with_status(status))
        }
        Ok(_) => Ok(()),
        Err(err) => {
            warn!(session_id, error = %err, "session check failed, serving local state");
            Ok(())
        }
    }
}

/// Observe the upstream's response and re-emit it. JSON responses are
/// buffered once complete; SSE responses are teed event by event in the
/// same pass, with the downstream bytes untouched.
async fn tap_response(
    state: AppState,
    observation: RequestObservation,
    response: Response,
    stream_key: StreamKey,
    had_resume_cursor: bool,
) -> Response {
    let content_type = header_str(response.headers(), header::CONTENT_TYPE.as_str()).to_string();

    if content_type.starts_with("text/event-stream") {
        let response_session_id = nonempty(header_str(response.headers(), SESSION_ID_HEADER));
        let session_id = response_session_id
            .clone()
            .or_else(|| observation.session_id.clone());
        return match session_id {
            // Events on a resumed connection are the upstream's replay of
            // already-recorded history; forward without re-recording.
            Some(id) if !had_resume_cursor => {
                // The upstream may answer initialize over SSE instead of
                // JSON; the tee then births the session from the first
                // matching response event.
                let pending_init = (observation.is_initialize()
                    && response_session_id.is_some())
                .then(|| observation.clone());
                tee_sse(state, id, stream_key, pending_init, response)
            }
            _ => response,
        };
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => return RelayError::Upstream(err.to_string()).into_response(),
    };

    let parsed: Option<Value> = if content_type.starts_with("application/json") && !bytes.is_empty()
    {
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "upstream JSON response did not parse, passing through");
                None
            }
        }
    } else {
        None
    };

    let response_session_id = nonempty(header_str(&parts.headers, SESSION_ID_HEADER));
    state
        .interceptor
        .observe_json_response(
            &observation,
            response_session_id.as_deref(),
            parts.status.as_u16(),
            parsed.as_ref(),
        )
        .await;

    Response::from_parts(parts, Body::from(bytes))
}

/// Duplicate the SSE stream into the interceptor without altering
/// delivery: each chunk is forwarded as-is while a line parser extracts
/// completed events into an ordered channel drained off-path.
fn tee_sse(
    state: AppState,
    session_id: String,
    stream_key: StreamKey,
    pending_init: Option<RequestObservation>,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let interceptor = state.interceptor.clone();
    let drain_session = session_id.clone();
    tokio::spawn(async move {
        let mut pending_init = pending_init;
        while let Some(data) = rx.recv().await {
            if let Some(observation) = pending_init.as_ref() {
                if interceptor
                    .observe_initialize_sse_response(observation, &drain_session, &data)
                    .await
                {
                    pending_init = None;
                    continue;
                }
            }
            interceptor
                .observe_sse_data(&drain_session, stream_key, &data)
                .await;
        }
    });

    let mut parser = SseParser::new();
    let teed = body.into_data_stream().map(move |chunk| {
        if let Ok(bytes) = &chunk {
            for event in parser.feed(bytes) {
                if tx.send(event.data).is_err() {
                    debug!(session_id, "sse observer gone, forwarding only");
                }
            }
        }
        chunk
    });

    Response::from_parts(parts, Body::from_stream(teed))
}

async fn record_upstream_failure(state: &AppState, session_id: &str, message: &str) {
    if let Err(err) = state
        .events
        .record(
            session_id,
            StreamKey::Request,
            Direction::ServerToClient,
            EventKind::Error,
            None,
            None,
            json!({"error": message}),
        )
        .await
    {
        warn!(session_id, error = %err, "failed to record upstream failure");
    }
}

/// Session id discovery: `Mcp-Session-Id` header, then the legacy
/// `X-Mcp-Session-Id`, then JSON-RPC `params.session_id`. On a
/// header/params mismatch the header wins and the conflict is logged.
fn extract_session_id(headers: &HeaderMap, body: Option<&Value>) -> Option<String> {
    let from_header = headers
        .get(SESSION_ID_HEADER)
        .or_else(|| headers.get(SESSION_ID_HEADER_LEGACY))
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let from_params = body.and_then(params_session_id);

    match (from_header, from_params) {
        (Some(header_id), Some(params_id)) if header_id != params_id => {
            warn!(
                header = %header_id,
                params = %params_id,
                "session id differs between header and params, header wins"
            );
            Some(header_id)
        }
        (Some(header_id), _) => Some(header_id),
        (None, params_id) => params_id,
    }
}

fn params_session_id(body: &Value) -> Option<String> {
    let frames = JsonRpcFrame::parse_body(body);
    frames.iter().find_map(|frame| {
        frame
            .params()
            .and_then(|params| params.get("session_id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn nonempty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn header_order_and_params_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("s-main"));
        headers.insert(SESSION_ID_HEADER_LEGACY, HeaderValue::from_static("s-legacy"));
        assert_eq!(
            extract_session_id(&headers, None).as_deref(),
            Some("s-main")
        );

        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER_LEGACY, HeaderValue::from_static("s-legacy"));
        assert_eq!(
            extract_session_id(&headers, None).as_deref(),
            Some("s-legacy")
        );

        let body = json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list",
            "params": {"session_id": "s-params"}
        });
        assert_eq!(
            extract_session_id(&HeaderMap::new(), Some(&body)).as_deref(),
            Some("s-params")
        );
    }

    #[test]
    fn header_wins_over_conflicting_params() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("s-header"));
        let body = json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/list",
            "params": {"session_id": "s-other"}
        });
        assert_eq!(
            extract_session_id(&headers, Some(&body)).as_deref(),
            Some("s-header")
        );
    }

    #[test]
    fn empty_header_is_no_session() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static(""));
        assert_eq!(extract_session_id(&headers, None), None);
    }
}
