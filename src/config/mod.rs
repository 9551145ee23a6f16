//! Configuration for the relay.
//!
//! Loaded from YAML or TOML, with every knob defaulted so an empty file is
//! a valid development configuration (in-memory store, `/mcp` endpoint).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Mount path for the MCP endpoint.
    #[serde(default = "default_path")]
    pub path: String,
    /// POST bodies above this are rejected with 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// HTTP status for unknown or closed sessions: 404, or 400 for clients
    /// that predate the 404 convention.
    #[serde(default = "default_unknown_session_status")]
    pub unknown_session_status: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Connection URL for the shared backend (redis only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    /// Per-session event streams are capped at this many entries.
    #[serde(default = "default_stream_maxlen")]
    pub stream_maxlen: usize,
    #[serde(default = "default_store_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Idle session records expire after this long; absent means never.
    #[serde(default)]
    pub session_ttl_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_admit_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_admit_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/mcp".to_string()
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_unknown_session_status() -> u16 {
    404
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_store_prefix() -> String {
    "mcprelay".to_string()
}
fn default_stream_maxlen() -> usize {
    1024
}
fn default_store_op_timeout_ms() -> u64 {
    2000
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    50
}
fn default_retry_cap_ms() -> u64 {
    2000
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_cache_max_entries() -> usize {
    1024
}
fn default_cache_ttl_ms() -> u64 {
    5000
}
fn default_admit_lock_ttl_ms() -> u64 {
    2000
}
fn default_admit_lock_wait_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_body_bytes: default_max_body_bytes(),
            unknown_session_status: default_unknown_session_status(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: None,
            prefix: default_store_prefix(),
            stream_maxlen: default_stream_maxlen(),
            op_timeout_ms: default_store_op_timeout_ms(),
            session_ttl_ms: None,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_ms: default_retry_base_ms(),
            cap_ms: default_retry_cap_ms(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            ttl_ms: default_cache_ttl_ms(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_admit_lock_ttl_ms(),
            lock_wait_ms: default_admit_lock_wait_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("yaml");

        let config: Config = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?,
            "toml" => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?,
            _ => {
                return Err(Error::Config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the serde layer cannot express.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.relay.unknown_session_status, 400 | 404) {
            return Err(Error::Config(format!(
                "relay.unknown_session_status must be 404 or 400, got {}",
                self.relay.unknown_session_status
            )));
        }
        if !self.relay.path.starts_with('/') {
            return Err(Error::Config(format!(
                "relay.path must start with '/', got {:?}",
                self.relay.path
            )));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err(Error::Config(
                "store.url is required when store.backend = redis".to_string(),
            ));
        }
        if self.store.stream_maxlen == 0 {
            return Err(Error::Config(
                "store.stream_maxlen must be greater than zero".to_string(),
            ));
        }
        if self.relay.max_body_bytes == 0 {
            return Err(Error::Config(
                "relay.max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate a configuration file without constructing a server.
    pub fn validate_file(path: &Path) -> Result<()> {
        let _config = Self::from_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.path, "/mcp");
        assert_eq!(config.relay.max_body_bytes, 1024 * 1024);
        assert_eq!(config.relay.unknown_session_status, 404);
        assert_eq!(config.store.retry.max_attempts, 3);
        assert_eq!(config.store.retry.base_ms, 50);
        assert_eq!(config.store.retry.cap_ms, 2000);
        assert_eq!(config.store.breaker.failure_threshold, 5);
        assert_eq!(config.store.breaker.cooldown_ms, 10_000);
        assert_eq!(config.store.op_timeout_ms, 2000);
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.cache.ttl_ms, 5000);
        assert_eq!(config.admission.lock_ttl_ms, 2000);
        assert_eq!(config.admission.lock_wait_ms, 500);
        assert!(config.store.session_ttl_ms.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn yaml_parses_partial_config() {
        let raw = r#"
relay:
  unknown_session_status: 400
store:
  backend: memory
  stream_maxlen: 64
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.relay.unknown_session_status, 400);
        assert_eq!(config.store.stream_maxlen, 64);
        assert_eq!(config.server.port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn redis_backend_requires_url() {
        let raw = r#"
store:
  backend: redis
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bogus_unknown_session_status_rejected() {
        let mut config = Config::default();
        config.relay.unknown_session_status = 418;
        assert!(config.validate().is_err());
    }
}
