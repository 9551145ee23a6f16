//! Admission controller: makes a session usable on this instance before
//! the upstream handler sees the request.
//!
//! Runs only when the extracted id is non-empty and the upstream has no
//! transport for it. Reads go straight to the store; the read cache is
//! deliberately bypassed here, staleness on this path means rehydrating
//! the wrong state.

use crate::store::{SessionStore, StoreError};
use crate::types::{SessionStatus, METHOD_INITIALIZED};
use crate::upstream::UpstreamSessionManager;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum AdmissionError {
    /// No record anywhere in the cluster; answered with the configured
    /// unknown-session status, never forwarded.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The record exists but the session is over.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Transient store fault (possibly the breaker short-circuiting).
    #[error("session store unavailable")]
    StoreUnavailable,

    /// The upstream refused to rehydrate; durable state is untouched.
    #[error("upstream transport creation failed: {0}")]
    Upstream(String),
}

pub struct AdmissionController {
    store: Arc<dyn SessionStore>,
    upstream: Arc<dyn UpstreamSessionManager>,
    /// Sessions this instance has already warmed; at most one synthetic
    /// `notifications/initialized` per (instance, session).
    warmed: Arc<DashMap<String, ()>>,
    instance_id: String,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        upstream: Arc<dyn UpstreamSessionManager>,
        instance_id: String,
        lock_ttl: Duration,
        lock_wait: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            warmed: Arc::new(DashMap::new()),
            instance_id,
            lock_ttl,
            lock_wait,
        }
    }

    /// Ensure local transport state exists for `session_id`, rehydrating
    /// from the durable record if needed. `is_initialize` requests pass
    /// through on NotFound; creation is deferred until the response is
    /// observed.
    pub async fn admit(
        &self,
        session_id: &str,
        is_initialize: bool,
    ) -> Result<(), AdmissionError> {
        if self.upstream.has_transport(session_id) {
            return Ok(());
        }

        let record = match self.store.get_session(session_id).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => {
                if is_initialize {
                    debug!(session_id, "fresh initialize with unknown id, passing through");
                    return Ok(());
                }
                return Err(AdmissionError::UnknownSession(session_id.to_string()));
            }
            Err(err) => {
                warn!(session_id, error = %err, "store lookup failed during admission");
                return Err(AdmissionError::StoreUnavailable);
            }
        };

        if record.status.is_closed() {
            return Err(AdmissionError::SessionClosed(session_id.to_string()));
        }

        let lock_name = format!("admit:{}", session_id);
        let holding = self.acquire_admit_lock(&lock_name).await;

        let created = self
            .upstream
            .create_transport_for_session(session_id, &record.metadata)
            .await;

        if let Err(err) = created {
            if holding {
                self.release_admit_lock(&lock_name).await;
            }
            return Err(AdmissionError::Upstream(err.to_string()));
        }

        debug!(session_id, status = %record.status, "session admitted");

        if record.status == SessionStatus::Active {
            self.warm(session_id);
        }

        if holding {
            self.release_admit_lock(&lock_name).await;
        }
        Ok(())
    }

    /// Bounded wait on the advisory lock. If it stays held past the wait
    /// window we proceed anyway: transport creation is idempotent, the
    /// lock only reduces duplicate work.
    async fn acquire_admit_lock(&self, name: &str) -> bool {
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match self
                .store
                .acquire_lock(name, &self.instance_id, self.lock_ttl)
                .await
            {
                Ok(()) => return true,
                Err(StoreError::Held) => {
                    if Instant::now() >= deadline {
                        debug!(lock = name, "admit lock still held, proceeding optimistically");
                        return false;
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(err) => {
                    warn!(lock = name, error = %err, "admit lock unavailable, proceeding");
                    return false;
                }
            }
        }
    }

    async fn release_admit_lock(&self, name: &str) {
        if let Err(err) = self.store.release_lock(name, &self.instance_id).await {
            warn!(lock = name, error = %err, "failed to release admit lock");
        }
    }

    /// Fire-and-forget injection of one synthetic
    /// `notifications/initialized` so the upstream treats the session as
    /// active without a second handshake. The claim is dropped on failure
    /// so the next request tries again.
    fn warm(&self, session_id: &str) {
        if self.warmed.insert(session_id.to_string(), ()).is_some() {
            return;
        }

        let upstream = self.upstream.clone();
        let warmed = self.warmed.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let message = json!({"jsonrpc": "2.0", "method": METHOD_INITIALIZED});
            if let Err(err) = upstream.inject_client_message(&session_id, message).await {
                warn!(session_id, error = %err, "warming injection failed");
                warmed.remove(&session_id);
            } else {
                debug!(session_id, "session warmed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::SessionRecord;
    use crate::upstream::LocalMcpServer;
    use serde_json::Map;

    struct Fixture {
        controller: Arc<AdmissionController>,
        store: Arc<dyn SessionStore>,
        upstream: Arc<LocalMcpServer>,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::default());
        let upstream = Arc::new(LocalMcpServer::new());
        let controller = Arc::new(AdmissionController::new(
            store.clone(),
            upstream.clone(),
            "node-test".into(),
            Duration::from_secs(2),
            Duration::from_millis(100),
        ));
        Fixture {
            controller,
            store,
            upstream,
        }
    }

    async fn seed(store: &Arc<dyn SessionStore>, id: &str, status: SessionStatus) {
        let mut record = SessionRecord::new(id.to_string(), Map::new(), None);
        record.status = status;
        store.put_session_if_absent(&record).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_rejected_without_upstream_call() {
        let f = fixture();
        let err = f.controller.admit("s-never", false).await.unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownSession(_)));
        assert_eq!(f.upstream.create_calls(), 0);
    }

    #[tokio::test]
    async fn fresh_initialize_passes_through() {
        let f = fixture();
        f.controller.admit("s-stale", true).await.unwrap();
        assert_eq!(f.upstream.create_calls(), 0);
    }

    #[tokio::test]
    async fn closed_session_rejected() {
        let f = fixture();
        seed(&f.store, "s-done", SessionStatus::Closed).await;
        let err = f.controller.admit("s-done", false).await.unwrap_err();
        assert!(matches!(err, AdmissionError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn initialized_session_rehydrates_without_warming() {
        let f = fixture();
        seed(&f.store, "s-1", SessionStatus::Initialized).await;

        f.controller.admit("s-1", false).await.unwrap();
        assert!(f.upstream.has_transport("s-1"));

        tokio::task::yield_now().await;
        assert!(f.upstream.injected_messages("s-1").is_empty());
    }

    #[tokio::test]
    async fn active_session_warmed_exactly_once() {
        let f = fixture();
        seed(&f.store, "s-1", SessionStatus::Active).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = f.controller.clone();
            handles.push(tokio::spawn(
                async move { controller.admit("s-1", false).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // Let the fire-and-forget injection land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.upstream.transport_count(), 1);
        assert_eq!(f.upstream.injected_messages("s-1").len(), 1);
        assert!(f.upstream.is_active("s-1"));
    }

    #[tokio::test]
    async fn held_lock_is_waited_out_then_optimistic() {
        let f = fixture();
        seed(&f.store, "s-1", SessionStatus::Initialized).await;
        // Another node holds the admit lock past our wait window.
        f.store
            .acquire_lock("admit:s-1", "node-other", Duration::from_secs(5))
            .await
            .unwrap();

        f.controller.admit("s-1", false).await.unwrap();
        assert!(f.upstream.has_transport("s-1"));
    }
}
