//! In-process store variant, for development and tests.
//!
//! Sessions and streams live in concurrency-safe maps; expiry is enforced
//! lazily on access so no background reaper is needed.

use super::{SessionStore, StoreError, StoreResult};
use crate::types::{EventEntry, EventRecord, SessionRecord, StreamKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct SessionEntry {
    record: SessionRecord,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    events: Vec<EventRecord>,
}

struct LockEntry {
    holder: String,
    expires_at: Instant,
}

pub struct MemoryStore {
    sessions: DashMap<String, SessionEntry>,
    streams: DashMap<(String, StreamKey), StreamState>,
    locks: DashMap<String, LockEntry>,
    stream_maxlen: usize,
    session_ttl: Option<Duration>,
}

impl MemoryStore {
    pub fn new(stream_maxlen: usize, session_ttl: Option<Duration>) -> Self {
        Self {
            sessions: DashMap::new(),
            streams: DashMap::new(),
            locks: DashMap::new(),
            stream_maxlen,
            session_ttl,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.session_ttl.map(|ttl| Instant::now() + ttl)
    }

    fn reap_if_expired(&self, id: &str) {
        let expired = self
            .sessions
            .get(id)
            .map(|e| matches!(e.expires_at, Some(at) if at <= Instant::now()))
            .unwrap_or(false);
        if expired {
            self.sessions.remove(id);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024, None)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        self.reap_if_expired(id);
        self.sessions
            .get(id)
            .map(|e| e.record.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn put_session_if_absent(&self, record: &SessionRecord) -> StoreResult<()> {
        self.reap_if_expired(&record.id);
        match self.sessions.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::Exists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(SessionEntry {
                    record: record.clone(),
                    expires_at: self.deadline(),
                });
                Ok(())
            }
        }
    }

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        new_record: &SessionRecord,
    ) -> StoreResult<SessionRecord> {
        self.reap_if_expired(id);
        let mut entry = self.sessions.get_mut(id).ok_or(StoreError::NotFound)?;
        if entry.record.version != expected_version {
            return Err(StoreError::Conflict);
        }
        entry.record = new_record.clone();
        entry.expires_at = self.deadline();
        Ok(entry.record.clone())
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.sessions
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn append_event(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        entry: &EventEntry,
    ) -> StoreResult<String> {
        let mut state = self
            .streams
            .entry((session_id.to_string(), stream_key))
            .or_default();
        state.next_seq += 1;
        let event_id = state.next_seq.to_string();
        state.events.push(EventRecord {
            event_id: event_id.clone(),
            stream_key,
            direction: entry.direction,
            kind: entry.kind,
            method: entry.method.clone(),
            jsonrpc_id: entry.jsonrpc_id.clone(),
            payload: entry.payload.clone(),
            observed_at: entry.observed_at,
        });
        if state.events.len() > self.stream_maxlen {
            let excess = state.events.len() - self.stream_maxlen;
            state.events.drain(..excess);
        }
        Ok(event_id)
    }

    async fn read_events(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        after_id: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        let state = match self.streams.get(&(session_id.to_string(), stream_key)) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };
        let after_seq = match after_id {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| StoreError::Unavailable(format!("malformed event id {:?}", raw)))?,
            None => 0,
        };
        let mut out: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.event_id.parse::<u64>().unwrap_or(0) > after_seq)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn last_event_id(
        &self,
        session_id: &str,
        stream_key: StreamKey,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .streams
            .get(&(session_id.to_string(), stream_key))
            .and_then(|state| state.events.last().map(|e| e.event_id.clone())))
    }

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        max_len: usize,
    ) -> StoreResult<()> {
        if let Some(mut state) = self.streams.get_mut(&(session_id.to_string(), stream_key)) {
            if state.events.len() > max_len {
                let excess = state.events.len() - max_len;
                state.events.drain(..excess);
            }
        }
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut entry = self.locks.entry(name.to_string()).or_insert(LockEntry {
            holder: holder.to_string(),
            expires_at: now + ttl,
        });
        if entry.holder != holder && entry.expires_at > now {
            return Err(StoreError::Held);
        }
        entry.holder = holder.to_string();
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        self.locks
            .remove_if(name, |_, entry| entry.holder == holder);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, EventKind};
    use chrono::Utc;
    use serde_json::json;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(id.to_string(), serde_json::Map::new(), None)
    }

    fn entry(payload: serde_json::Value) -> EventEntry {
        EventEntry {
            direction: Direction::ServerToClient,
            kind: EventKind::Response,
            method: None,
            jsonrpc_id: Some(json!(1)),
            payload,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_is_exclusive() {
        let store = MemoryStore::default();
        store.put_session_if_absent(&record("s-1")).await.unwrap();
        assert_eq!(
            store.put_session_if_absent(&record("s-1")).await,
            Err(StoreError::Exists)
        );
        assert_eq!(store.get_session("s-1").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = MemoryStore::default();
        store.put_session_if_absent(&record("s-1")).await.unwrap();

        let mut next = record("s-1");
        next.version = 2;
        store.update_session_cas("s-1", 1, &next).await.unwrap();

        let mut stale = record("s-1");
        stale.version = 2;
        assert_eq!(
            store
                .update_session_cas("s-1", 1, &stale)
                .await
                .unwrap_err(),
            StoreError::Conflict
        );
        assert_eq!(
            store
                .update_session_cas("s-missing", 1, &stale)
                .await
                .unwrap_err(),
            StoreError::NotFound
        );
    }

    #[tokio::test]
    async fn events_ordered_and_trimmed() {
        let store = MemoryStore::new(3, None);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .append_event("s-1", StreamKey::Request, &entry(json!({"n": i})))
                    .await
                    .unwrap(),
            );
        }
        // Head trimmed to maxlen, ordering preserved.
        let events = store
            .read_events("s-1", StreamKey::Request, None, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload, json!({"n": 2}));

        let after = store
            .read_events("s-1", StreamKey::Request, Some(&ids[3]), None)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].event_id, ids[4]);

        assert_eq!(
            store
                .last_event_id("s-1", StreamKey::Request)
                .await
                .unwrap(),
            Some(ids[4].clone())
        );
        // Other stream is untouched.
        assert_eq!(
            store
                .last_event_id("s-1", StreamKey::Standalone)
                .await
                .unwrap(),
            None
        );

        store
            .trim_stream("s-1", StreamKey::Request, 1)
            .await
            .unwrap();
        let events = store
            .read_events("s-1", StreamKey::Request, None, None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, ids[4]);
    }

    #[tokio::test]
    async fn locks_expire_and_release_checks_holder() {
        let store = MemoryStore::default();
        store
            .acquire_lock("admit:s-1", "node-a", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(
            store
                .acquire_lock("admit:s-1", "node-b", Duration::from_secs(1))
                .await,
            Err(StoreError::Held)
        );
        // Wrong holder cannot release.
        store.release_lock("admit:s-1", "node-b").await.unwrap();
        assert_eq!(
            store
                .acquire_lock("admit:s-1", "node-b", Duration::from_secs(1))
                .await,
            Err(StoreError::Held)
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        store
            .acquire_lock("admit:s-1", "node-b", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn session_ttl_reaps_on_read() {
        let store = MemoryStore::new(16, Some(Duration::from_millis(20)));
        store.put_session_if_absent(&record("s-1")).await.unwrap();
        assert!(store.get_session("s-1").await.is_ok());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            store.get_session("s-1").await.unwrap_err(),
            StoreError::NotFound
        );
        // Reaped id can be created again.
        store.put_session_if_absent(&record("s-1")).await.unwrap();
    }
}
