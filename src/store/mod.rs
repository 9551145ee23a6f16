//! Storage adapter: versioned session records, append-only event streams,
//! and advisory locks.
//!
//! Two variants live behind [`SessionStore`]: an in-process map-backed
//! store for development and tests, and a Redis-backed store shared across
//! the fleet. Backend-specific failures never leak upward; callers only
//! ever see the closed [`StoreError`] sum.

pub mod memory;
pub mod redis;
pub mod resilient;

use crate::types::{EventEntry, EventRecord, SessionRecord, StreamKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::resilient::ResilientStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The only outcomes visible above the adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Exists,

    #[error("version conflict")]
    Conflict,

    #[error("lock held")]
    Held,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient faults drive the retry and breaker layers; everything
    /// else returns immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Capability set the rest of the relay depends on.
///
/// CAS contract: the caller passes `new_record` with `version` already set
/// to `expected_version + 1`; the store writes it only when the current
/// version equals `expected_version`, returning the stored record.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord>;

    async fn put_session_if_absent(&self, record: &SessionRecord) -> StoreResult<()>;

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        new_record: &SessionRecord,
    ) -> StoreResult<SessionRecord>;

    async fn delete_session(&self, id: &str) -> StoreResult<()>;

    /// Append one event; the returned id is unique and strictly increasing
    /// within the `(session, stream_key)` stream.
    async fn append_event(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        entry: &EventEntry,
    ) -> StoreResult<String>;

    /// Read events in append order, strictly after `after_id` when given.
    async fn read_events(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        after_id: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>>;

    async fn last_event_id(
        &self,
        session_id: &str,
        stream_key: StreamKey,
    ) -> StoreResult<Option<String>>;

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        max_len: usize,
    ) -> StoreResult<()>;

    /// Advisory lock; auto-expires at `ttl`. `Held` when another holder
    /// owns it. Re-acquiring under the same holder refreshes the TTL.
    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()>;

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()>;

    /// Advisory clock used for record and event timestamps.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
