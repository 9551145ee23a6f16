//! mcp-relay
//!
//! A distributed session-coordination relay for MCP servers speaking
//! Streamable HTTP. Lets a fleet of stateless instances sit behind any
//! Layer-7 load balancer, without sticky sessions, while preserving the
//! MCP session abstraction across nodes: session state lives in a shared
//! store, protocol traffic is intercepted and event-sourced, and unknown
//! sessions are rehydrated into the local upstream before forwarding.

pub mod admission;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod intercept;
pub mod proxy;
pub mod session;
pub mod store;
pub mod types;
pub mod upstream;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::RelayServer;
