//! Common test utilities for integration tests.

#![allow(dead_code)]

use mcp_relay::config::Config;
use mcp_relay::proxy::server::{build_router, AppState};
use mcp_relay::store::{MemoryStore, SessionStore, StoreError, StoreResult};
use mcp_relay::types::{EventEntry, EventRecord, SessionRecord, StreamKey};
use mcp_relay::upstream::LocalMcpServer;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A relay instance bound to an ephemeral port, with handles into its
/// internals for assertions.
pub struct Relay {
    pub addr: SocketAddr,
    pub state: AppState,
    pub upstream: Arc<LocalMcpServer>,
}

impl Relay {
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, "/mcp")
    }
}

pub async fn spawn_relay(config: Config, store: Arc<dyn SessionStore>) -> Relay {
    spawn_relay_with_upstream(config, store, Arc::new(LocalMcpServer::new())).await
}

pub async fn spawn_relay_with_upstream(
    config: Config,
    store: Arc<dyn SessionStore>,
    upstream: Arc<LocalMcpServer>,
) -> Relay {
    let state = AppState::assemble(Arc::new(config), store, upstream.clone());
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("relay serve");
    });

    Relay {
        addr,
        state,
        upstream,
    }
}

pub fn shared_store() -> Arc<dyn SessionStore> {
    Arc::new(MemoryStore::default())
}

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn rpc(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

pub fn notification(method: &str) -> Value {
    json!({"jsonrpc": "2.0", "method": method})
}

/// Drive the initialize handshake against one relay; returns the
/// upstream-assigned session id.
pub async fn initialize_session(client: &reqwest::Client, url: &str) -> String {
    let response = client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream")
        .json(&rpc(
            1,
            "initialize",
            json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": {"name": "relay-test", "version": "0.1.0"}
            }),
        ))
        .send()
        .await
        .expect("initialize request");
    assert!(response.status().is_success(), "initialize should succeed");

    let session_id = response
        .headers()
        .get("mcp-session-id")
        .expect("session id header")
        .to_str()
        .expect("ascii session id")
        .to_string();

    let body: Value = response.json().await.expect("initialize body");
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    session_id
}

/// Complete the handshake: initialize plus `notifications/initialized`.
pub async fn establish_session(client: &reqwest::Client, url: &str) -> String {
    let session_id = initialize_session(client, url).await;
    let response = client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream")
        .header("mcp-session-id", &session_id)
        .json(&notification("notifications/initialized"))
        .send()
        .await
        .expect("initialized notification");
    assert!(response.status().is_success() || response.status().as_u16() == 202);
    session_id
}

pub async fn post_rpc(
    client: &reqwest::Client,
    url: &str,
    session_id: &str,
    body: &Value,
) -> reqwest::Response {
    client
        .post(url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json, text/event-stream")
        .header("mcp-session-id", session_id)
        .json(body)
        .send()
        .await
        .expect("rpc request")
}

/// Store wrapper that can be switched into a failing mode and counts the
/// calls that actually reach the backend.
pub struct FailingStore {
    inner: MemoryStore,
    fail_remaining: AtomicU32,
    calls: AtomicU32,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::default(),
            fail_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail every call until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.fail_remaining
            .store(if failing { u32::MAX } else { 0 }, Ordering::SeqCst);
    }

    /// Fail exactly the next `n` calls.
    pub fn fail_times(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn observe(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn get_session(&self, id: &str) -> StoreResult<SessionRecord> {
        self.observe()?;
        self.inner.get_session(id).await
    }

    async fn put_session_if_absent(&self, record: &SessionRecord) -> StoreResult<()> {
        self.observe()?;
        self.inner.put_session_if_absent(record).await
    }

    async fn update_session_cas(
        &self,
        id: &str,
        expected_version: u64,
        new_record: &SessionRecord,
    ) -> StoreResult<SessionRecord> {
        self.observe()?;
        self.inner
            .update_session_cas(id, expected_version, new_record)
            .await
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.observe()?;
        self.inner.delete_session(id).await
    }

    async fn append_event(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        entry: &EventEntry,
    ) -> StoreResult<String> {
        self.observe()?;
        self.inner.append_event(session_id, stream_key, entry).await
    }

    async fn read_events(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        after_id: Option<&str>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<EventRecord>> {
        self.observe()?;
        self.inner
            .read_events(session_id, stream_key, after_id, limit)
            .await
    }

    async fn last_event_id(
        &self,
        session_id: &str,
        stream_key: StreamKey,
    ) -> StoreResult<Option<String>> {
        self.observe()?;
        self.inner.last_event_id(session_id, stream_key).await
    }

    async fn trim_stream(
        &self,
        session_id: &str,
        stream_key: StreamKey,
        max_len: usize,
    ) -> StoreResult<()> {
        self.observe()?;
        self.inner.trim_stream(session_id, stream_key, max_len).await
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        self.observe()?;
        self.inner.acquire_lock(name, holder, ttl).await
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        self.observe()?;
        self.inner.release_lock(name, holder).await
    }
}
