//! HTTP surface: the axum server and the transport-wrapper handlers.

pub mod handler;
pub mod server;
pub mod sse;

pub use server::{AppState, RelayServer};
