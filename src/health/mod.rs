//! Backend health machinery.

pub mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
