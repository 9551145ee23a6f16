//! Event-sourced log of observed protocol messages.
//!
//! A thin facade over the store's append-only streams: the store assigns
//! event ids and enforces retention; this log never re-numbers. Replay is
//! ordered within one `(session, stream_key)` stream only; cross-stream
//! ordering is unspecified.

use crate::store::{SessionStore, StoreResult};
use crate::types::{Direction, EventEntry, EventKind, EventRecord, StreamKey};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct EventLog {
    store: Arc<dyn SessionStore>,
    stream_maxlen: usize,
}

impl EventLog {
    pub fn new(store: Arc<dyn SessionStore>, stream_maxlen: usize) -> Self {
        Self {
            store,
            stream_maxlen,
        }
    }

    /// Append one observed message and return the store-assigned id.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        direction: Direction,
        kind: EventKind,
        method: Option<String>,
        jsonrpc_id: Option<Value>,
        payload: Value,
    ) -> StoreResult<String> {
        let entry = EventEntry {
            direction,
            kind,
            method,
            jsonrpc_id,
            payload,
            observed_at: self.store.now(),
        };
        let event_id = self.store.append_event(session_id, stream_key, &entry).await?;
        debug!(session_id, stream = %stream_key, event_id, ?kind, "event recorded");
        Ok(event_id)
    }

    /// Events strictly after `after_event_id`, in append order. Bounded by
    /// the stream's retention; a trimmed head simply shortens the result.
    pub async fn replay(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        after_event_id: Option<&str>,
    ) -> StoreResult<Vec<EventRecord>> {
        self.store
            .read_events(session_id, stream_key, after_event_id, None)
            .await
    }

    pub async fn latest_id(
        &self,
        session_id: &str,
        stream_key: StreamKey,
    ) -> StoreResult<Option<String>> {
        self.store.last_event_id(session_id, stream_key).await
    }

    /// Settle a session's streams to the exact retention bound. Appends
    /// cap streams approximately for speed (`XADD MAXLEN ~` on the shared
    /// backend); a session ending is the moment to trim precisely.
    pub async fn compact(&self, session_id: &str) -> StoreResult<()> {
        for stream_key in [StreamKey::Request, StreamKey::Standalone] {
            self.store
                .trim_stream(session_id, stream_key, self.stream_maxlen)
                .await?;
        }
        Ok(())
    }
}
