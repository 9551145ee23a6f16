//! Session record lifecycle over the shared store.
//!
//! All writes are store-first; the optional per-node read cache only ever
//! holds records the store returned, and any CAS conflict invalidates the
//! affected entry. Lifecycle transitions enforce the status DAG.

use crate::cache::SessionReadCache;
use crate::store::{SessionStore, StoreError};
use crate::types::{SessionRecord, SessionStatus};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("session already exists")]
    Exists,

    #[error("concurrent update conflict")]
    Conflict,

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => SessionError::NotFound,
            StoreError::Exists => SessionError::Exists,
            StoreError::Conflict => SessionError::Conflict,
            other => SessionError::Store(other),
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cache: Option<SessionReadCache>,
    cas_max_retries: u32,
    instance_id: String,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cache: Option<SessionReadCache>,
        cas_max_retries: u32,
        instance_id: String,
    ) -> Self {
        Self {
            store,
            cache,
            cas_max_retries,
            instance_id,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Create the authoritative record for an id the upstream just
    /// assigned. Initial status is `Initialized`; `Exists` means another
    /// instance won the race and both will converge on its record.
    pub async fn create(&self, id: &str, metadata: Map<String, Value>) -> SessionResult<SessionRecord> {
        let record = SessionRecord::new(id.to_string(), metadata, Some(self.instance_id.clone()));
        self.store.put_session_if_absent(&record).await?;
        debug!(session_id = id, "session record created");
        if let Some(cache) = &self.cache {
            cache.put(record.clone());
        }
        Ok(record)
    }

    /// Record lookup, cache-first.
    pub async fn get(&self, id: &str) -> SessionResult<SessionRecord> {
        if let Some(cache) = &self.cache {
            if let Some(record) = cache.get(id) {
                return Ok(record);
            }
        }
        match self.store.get_session(id).await {
            Ok(record) => {
                if let Some(cache) = &self.cache {
                    cache.put(record.clone());
                }
                Ok(record)
            }
            Err(StoreError::NotFound) => {
                self.invalidate(id);
                Err(SessionError::NotFound)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Move a session along the lifecycle DAG under CAS, retrying stale
    /// reads. Already being at `to` is an idempotent no-op.
    pub async fn transition(
        &self,
        id: &str,
        from: SessionStatus,
        to: SessionStatus,
        metadata_patch: Option<Map<String, Value>>,
    ) -> SessionResult<SessionRecord> {
        if !from.can_transition_to(to) {
            error!(session_id = id, %from, %to, "transition outside the lifecycle DAG");
            return Err(SessionError::IllegalTransition { from, to });
        }

        let mut attempt = 0u32;
        loop {
            let current = self.store.get_session(id).await.map_err(SessionError::from)?;

            if current.status == to {
                if let Some(cache) = &self.cache {
                    cache.put(current.clone());
                }
                return Ok(current);
            }
            if current.status != from {
                error!(
                    session_id = id,
                    observed = %current.status,
                    expected = %from,
                    "session not in expected state for transition"
                );
                return Err(SessionError::IllegalTransition {
                    from: current.status,
                    to,
                });
            }

            let mut next = current.clone();
            next.status = to;
            next.updated_at = self.store.now();
            next.version = current.version + 1;
            if let Some(patch) = &metadata_patch {
                for (key, value) in patch {
                    next.metadata.insert(key.clone(), value.clone());
                }
            }

            match self.store.update_session_cas(id, current.version, &next).await {
                Ok(stored) => {
                    debug!(session_id = id, %from, %to, version = stored.version, "session transitioned");
                    if let Some(cache) = &self.cache {
                        cache.put(stored.clone());
                    }
                    return Ok(stored);
                }
                Err(StoreError::Conflict) => {
                    self.invalidate(id);
                    attempt += 1;
                    if attempt >= self.cas_max_retries {
                        warn!(session_id = id, attempts = attempt, "transition CAS retries exhausted");
                        return Err(SessionError::Conflict);
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// CAS-merge a metadata patch; last writer wins per key.
    pub async fn touch_metadata(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> SessionResult<SessionRecord> {
        let mut attempt = 0u32;
        loop {
            let current = self.store.get_session(id).await.map_err(SessionError::from)?;
            let mut next = current.clone();
            next.updated_at = self.store.now();
            next.version = current.version + 1;
            for (key, value) in &patch {
                next.metadata.insert(key.clone(), value.clone());
            }

            match self.store.update_session_cas(id, current.version, &next).await {
                Ok(stored) => {
                    if let Some(cache) = &self.cache {
                        cache.put(stored.clone());
                    }
                    return Ok(stored);
                }
                Err(StoreError::Conflict) => {
                    self.invalidate(id);
                    attempt += 1;
                    if attempt >= self.cas_max_retries {
                        return Err(SessionError::Conflict);
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Terminal transition. Idempotent: already closed, or already gone,
    /// both return Ok.
    pub async fn close(&self, id: &str) -> SessionResult<()> {
        let mut attempt = 0u32;
        loop {
            let current = match self.store.get_session(id).await {
                Ok(record) => record,
                Err(StoreError::NotFound) => {
                    self.invalidate(id);
                    return Ok(());
                }
                Err(other) => return Err(other.into()),
            };

            if current.status.is_closed() {
                if let Some(cache) = &self.cache {
                    cache.put(current);
                }
                return Ok(());
            }

            let mut next = current.clone();
            next.status = SessionStatus::Closed;
            next.updated_at = self.store.now();
            next.version = current.version + 1;

            match self.store.update_session_cas(id, current.version, &next).await {
                Ok(stored) => {
                    debug!(session_id = id, "session closed");
                    if let Some(cache) = &self.cache {
                        cache.put(stored);
                    }
                    return Ok(());
                }
                Err(StoreError::Conflict) => {
                    self.invalidate(id);
                    attempt += 1;
                    if attempt >= self.cas_max_retries {
                        return Err(SessionError::Conflict);
                    }
                }
                Err(StoreError::NotFound) => {
                    self.invalidate(id);
                    return Ok(());
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Drop the local cache entry for an id whose cached state external
    /// evidence contradicts.
    pub fn invalidate(&self, id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(id);
        }
    }
}
