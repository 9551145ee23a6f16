//! Relay server assembly: shared state, router, and lifecycle.
//!
//! Everything is an explicit value constructed here at startup and torn
//! down on shutdown; nothing lives in module-level globals.

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    admission::AdmissionController,
    cache::SessionReadCache,
    config::{Config, StoreBackend},
    error::{Error, Result},
    events::EventLog,
    intercept::ProtocolInterceptor,
    proxy::handler::{handle_delete, handle_get, handle_post, health_check},
    session::SessionManager,
    store::{MemoryStore, RedisStore, ResilientStore, SessionStore},
    upstream::UpstreamSessionManager,
};

/// Transitions retried this many times on CAS conflict before giving up.
const CAS_MAX_RETRIES: u32 = 3;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<EventLog>,
    pub interceptor: Arc<ProtocolInterceptor>,
    pub admission: Arc<AdmissionController>,
    pub upstream: Arc<dyn UpstreamSessionManager>,
}

impl AppState {
    /// Wire the component graph over an already-constructed raw store.
    /// The resilience wrapper is applied here, so the session manager,
    /// event log, and admission controller all share one breaker.
    pub fn assemble(
        config: Arc<Config>,
        raw_store: Arc<dyn SessionStore>,
        upstream: Arc<dyn UpstreamSessionManager>,
    ) -> Self {
        let instance_id = Uuid::new_v4().to_string();

        let store: Arc<dyn SessionStore> = Arc::new(ResilientStore::new(
            raw_store,
            config.store.retry.clone(),
            &config.store.breaker,
            Duration::from_millis(config.store.op_timeout_ms),
        ));

        let cache = config.cache.enabled.then(|| {
            SessionReadCache::new(
                config.cache.max_entries,
                Duration::from_millis(config.cache.ttl_ms),
            )
        });

        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            cache,
            CAS_MAX_RETRIES,
            instance_id.clone(),
        ));
        let events = Arc::new(EventLog::new(store.clone(), config.store.stream_maxlen));
        let interceptor = Arc::new(ProtocolInterceptor::new(sessions.clone(), events.clone()));
        let admission = Arc::new(AdmissionController::new(
            store,
            upstream.clone(),
            instance_id,
            Duration::from_millis(config.admission.lock_ttl_ms),
            Duration::from_millis(config.admission.lock_wait_ms),
        ));

        Self {
            config,
            sessions,
            events,
            interceptor,
            admission,
            upstream,
        }
    }
}

/// Router with the MCP endpoint mounted at the configured path.
pub fn build_router(state: AppState) -> Router {
    let path = state.config.relay.path.clone();
    Router::new()
        .route(
            &path,
            post(handle_post).get(handle_get).delete(handle_delete),
        )
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// The relay process: configuration, component graph, graceful shutdown.
pub struct RelayServer {
    config: Arc<Config>,
    state: AppState,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl RelayServer {
    /// Build the store selected by configuration and assemble the relay
    /// around the given upstream.
    pub async fn new(config: Config, upstream: Arc<dyn UpstreamSessionManager>) -> Result<Self> {
        config.validate()?;
        info!("initializing mcp-relay");

        let session_ttl = config.store.session_ttl_ms.map(Duration::from_millis);
        let raw_store: Arc<dyn SessionStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new(
                config.store.stream_maxlen,
                session_ttl,
            )),
            StoreBackend::Redis => {
                let url = config
                    .store
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::Config("store.url required for redis".into()))?;
                Arc::new(
                    RedisStore::connect(
                        url,
                        config.store.prefix.clone(),
                        config.store.stream_maxlen,
                        session_ttl,
                    )
                    .await
                    .map_err(|e| Error::Store(e.to_string()))?,
                )
            }
        };

        let config = Arc::new(config);
        let state = AppState::assemble(config.clone(), raw_store, upstream);
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        Ok(Self {
            config,
            state,
            shutdown_tx,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("Invalid address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("Failed to bind {}: {}", addr, e)))?;
        info!(%addr, path = %self.config.relay.path, "relay listening");

        let router = self.router();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("shutting down relay gracefully");
            })
            .await
            .map_err(|e| Error::Server(format!("Server error: {}", e)))?;

        info!("relay stopped");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
