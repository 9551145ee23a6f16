//! Redis-backed store variant shared across the fleet.
//!
//! Session records are JSON blobs at `{prefix}:session:{id}`, event
//! streams are Redis streams at `{prefix}:stream:{id}:{stream_key}`
//! capped with `MAXLEN ~`, and advisory locks are expiring `SET NX PX`
//! keys. CAS and lock release go through Lua so the compare and the
//! write are one atomic step.

use super::{SessionStore, StoreError, StoreResult};
use crate::types::{Direction, EventEntry, EventKind, EventRecord, SessionRecord, StreamKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;

const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if not cur then return 'NOT_FOUND' end
local record = cjson.decode(cur)
if tostring(record.version) ~= ARGV[1] then return 'CONFLICT' end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] ~= '0' then redis.call('PEXPIRE', KEYS[1], ARGV[3]) end
return 'OK'
"#;

const ACQUIRE_LOCK_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if not holder then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 'OK'
end
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 'OK'
end
return 'HELD'
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    stream_maxlen: usize,
    session_ttl_ms: Option<u64>,
    cas: Script,
    acquire: Script,
    release: Script,
}

impl RedisStore {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        stream_maxlen: usize,
        session_ttl: Option<Duration>,
    ) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(map_err)?;
        let conn = client.get_connection_manager().await.map_err(map_err)?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
            stream_maxlen,
            session_ttl_ms: session_ttl.map(|ttl| ttl.as_millis() as u64),
            cas: Script::new(CAS_SCRIPT),
            acquire: Script::new(ACQUIRE_LOCK_SCRIPT),
            release: Script::new(RELEASE_LOCK_SCRIPT),
        })
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}:session:{}", self.prefix, id)
    }

    fn stream_key(&self, id: &str, stream: StreamKey) -> String {
        format!("{}:stream:{}:{}", self.prefix, id, stream.as_str())
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }
}

fn map_err(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("corrupt {}: {}", what, detail))
}

fn direction_tag(direction: Direction) -> &'static str {
    match direction {
        Direction::ClientToServer => "client_to_server",
        Direction::ServerToClient => "server_to_client",
    }
}

fn parse_direction(raw: &str) -> StoreResult<Direction> {
    match raw {
        "client_to_server" => Ok(Direction::ClientToServer),
        "server_to_client" => Ok(Direction::ServerToClient),
        other => Err(corrupt("stream entry direction", other)),
    }
}

fn kind_tag(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Request => "request",
        EventKind::Response => "response",
        EventKind::Notification => "notification",
        EventKind::Error => "error",
    }
}

fn parse_kind(raw: &str) -> StoreResult<EventKind> {
    match raw {
        "request" => Ok(EventKind::Request),
        "response" => Ok(EventKind::Response),
        "notification" => Ok(EventKind::Notification),
        "error" => Ok(EventKind::Error),
        other => Err(corrupt("stream entry kind", other)),
    }
}

type StreamEntries = Vec<(String, HashMap<String, String>)>;

fn entry_to_record(
    stream: StreamKey,
    id: String,
    fields: HashMap<String, String>,
) -> StoreResult<EventRecord> {
    let dir = fields
        .get("dir")
        .ok_or_else(|| corrupt("stream entry", "missing dir"))?;
    let kind = fields
        .get("kind")
        .ok_or_else(|| corrupt("stream entry", "missing kind"))?;
    let payload = fields
        .get("payload")
        .ok_or_else(|| corrupt("stream entry", "missing payload"))?;
    let ts = fields
        .get("ts")
        .ok_or_else(|| corrupt("stream entry", "missing ts"))?;

    Ok(EventRecord {
        event_id: id,
        stream_key: stream,
        direction: parse_direction(dir)?,
        kind: parse_kind(kind)?,
        method: fields.get("method").cloned(),
        jsonrpc_id: match fields.get("jsonrpc_id") {
            Some(raw) => {
                Some(serde_json::from_str(raw).map_err(|e| corrupt("jsonrpc id", e))?)
            }
            None => None,
        },
        payload: serde_json::from_str(payload).map_err(|e| corrupt("payload", e))?,
        observed_at: DateTime::parse_from_rfc3339(ts)
            .map_err(|e| corrupt("timestamp", e))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.session_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        serde_json::from_str(&raw).map_err(|e| corrupt("session record", e))
    }

    async fn put_session_if_absent(&self, record: &SessionRecord) -> StoreResult<()> {
        let raw = serde_json::to_string(record).map_err(|e| corrupt("session record", e))?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.session_key(&record.id)).arg(raw).arg("NX");
        if let Some(ttl) = self.session_ttl_ms {
            cmd.arg("PX").arg(ttl);
        }
        let mut conn = self.conn.clone();
        let set: Option<String> = cmd.query_async(&mut conn).await.map_err(map_err)?;
        match set {
            Some(_) => Ok(()),
            None => Err(StoreError::Exists),
        }
    }

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        new_record: &SessionRecord,
    ) -> StoreResult<SessionRecord> {
        let raw = serde_json::to_string(new_record).map_err(|e| corrupt("session record", e))?;
        let mut conn = self.conn.clone();
        let outcome: String = self
            .cas
            .key(self.session_key(id))
            .arg(expected_version.to_string())
            .arg(raw)
            .arg(self.session_ttl_ms.unwrap_or(0).to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        match outcome.as_str() {
            "OK" => Ok(new_record.clone()),
            "CONFLICT" => Err(StoreError::Conflict),
            "NOT_FOUND" => Err(StoreError::NotFound),
            other => Err(corrupt("cas outcome", other)),
        }
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.session_key(id))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        if removed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn append_event(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        entry: &EventEntry,
    ) -> StoreResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(session_id, stream_key))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.stream_maxlen)
            .arg("*")
            .arg("dir")
            .arg(direction_tag(entry.direction))
            .arg("kind")
            .arg(kind_tag(entry.kind));
        if let Some(method) = &entry.method {
            cmd.arg("method").arg(method);
        }
        if let Some(id) = &entry.jsonrpc_id {
            cmd.arg("jsonrpc_id")
                .arg(serde_json::to_string(id).map_err(|e| corrupt("jsonrpc id", e))?);
        }
        cmd.arg("payload")
            .arg(serde_json::to_string(&entry.payload).map_err(|e| corrupt("payload", e))?)
            .arg("ts")
            .arg(entry.observed_at.to_rfc3339());

        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(map_err)
    }

    async fn read_events(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        after_id: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        // Exclusive lower bound, so the cursor entry itself is skipped.
        let start = match after_id {
            Some(id) => format!("({}", id),
            None => "-".to_string(),
        };
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(self.stream_key(session_id, stream_key))
            .arg(start)
            .arg("+");
        if let Some(limit) = limit {
            cmd.arg("COUNT").arg(limit);
        }
        let mut conn = self.conn.clone();
        let entries: StreamEntries = cmd.query_async(&mut conn).await.map_err(map_err)?;
        entries
            .into_iter()
            .map(|(id, fields)| entry_to_record(stream_key, id, fields))
            .collect()
    }

    async fn last_event_id(
        &self,
        session_id: &str,
        stream_key: StreamKey,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let entries: StreamEntries = redis::cmd("XREVRANGE")
            .arg(self.stream_key(session_id, stream_key))
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(entries.into_iter().next().map(|(id, _)| id))
    }

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        max_len: usize,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XTRIM")
            .arg(self.stream_key(session_id, stream_key))
            .arg("MAXLEN")
            .arg(max_len)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let outcome: String = self
            .acquire
            .key(self.lock_key(name))
            .arg(holder)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        match outcome.as_str() {
            "OK" => Ok(()),
            "HELD" => Err(StoreError::Held),
            other => Err(corrupt("lock outcome", other)),
        }
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(self.lock_key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
