//! Resilience wrapper around a session store.
//!
//! Every call from the upper layers passes through here: a per-operation
//! timeout, bounded retry with jittered exponential backoff for transient
//! faults, and an instance-local circuit breaker. Terminal outcomes
//! (NotFound, Exists, Conflict, Held) are returned immediately and count
//! as backend successes.

use super::{SessionStore, StoreError, StoreResult};
use crate::config::{BreakerConfig, RetryConfig};
use crate::health::CircuitBreaker;
use crate::types::{EventEntry, EventRecord, SessionRecord, StreamKey};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct ResilientStore {
    inner: Arc<dyn SessionStore>,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    op_timeout: Duration,
}

impl ResilientStore {
    pub fn new(
        inner: Arc<dyn SessionStore>,
        retry: RetryConfig,
        breaker: &BreakerConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            retry,
            breaker: CircuitBreaker::new("session-store", breaker),
            op_timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = (attempt - 1).min(16);
        let exp = self.retry.base_ms.saturating_mul(1u64 << shift);
        let jitter = rand::thread_rng().gen_range(0..=self.retry.base_ms);
        Duration::from_millis(exp.saturating_add(jitter).min(self.retry.cap_ms))
    }

    async fn run<T, F, Fut>(&self, op: &str, f: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if !self.breaker.try_acquire() {
                return Err(StoreError::Unavailable("circuit breaker open".into()));
            }

            attempt += 1;
            let result = match tokio::time::timeout(self.op_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!("{} timed out", op))),
            };

            match result {
                Err(ref err) if err.is_transient() => {
                    self.breaker.record_failure();
                    if attempt >= self.retry.max_attempts {
                        return result;
                    }
                    let backoff = self.backoff(attempt);
                    warn!(op, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "transient store fault, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => {
                    self.breaker.record_success();
                    return other;
                }
            }
        }
    }
}

#[async_trait]
impl SessionStore for ResilientStore {
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        self.run("get_session", || self.inner.get_session(id)).await
    }

    async fn put_session_if_absent(&self, record: &SessionRecord) -> StoreResult<()> {
        self.run("put_session_if_absent", || {
            self.inner.put_session_if_absent(record)
        })
        .await
    }

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        new_record: &SessionRecord,
    ) -> StoreResult<SessionRecord> {
        self.run("update_session_cas", || {
            self.inner.update_session_cas(id, expected_version, new_record)
        })
        .await
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.run("delete_session", || self.inner.delete_session(id))
            .await
    }

    async fn append_event(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        entry: &EventEntry,
    ) -> StoreResult<String> {
        self.run("append_event", || {
            self.inner.append_event(session_id, stream_key, entry)
        })
        .await
    }

    async fn read_events(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        after_id: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        self.run("read_events", || {
            self.inner.read_events(session_id, stream_key, after_id, limit)
        })
        .await
    }

    async fn last_event_id(
        &self,
        session_id: &str,
        stream_key: StreamKey,
    ) -> StoreResult<Option<String>> {
        self.run("last_event_id", || {
            self.inner.last_event_id(session_id, stream_key)
        })
        .await
    }

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        max_len: usize,
    ) -> StoreResult<()> {
        self.run("trim_stream", || {
            self.inner.trim_stream(session_id, stream_key, max_len)
        })
        .await
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        self.run("acquire_lock", || self.inner.acquire_lock(name, holder, ttl))
            .await
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        self.run("release_lock", || self.inner.release_lock(name, holder))
            .await
    }
}
