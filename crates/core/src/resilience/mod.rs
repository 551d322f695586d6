//! Failure handling for external dependencies.
//!
//! Each dependency (source database, enrichment API, litigator API, DNC
//! store, sink) gets one `CircuitBreaker` from a shared
//! `CircuitBreakerRegistry`. Calls go through a `RetryExecutor` that retries
//! transient errors with exponential backoff and jitter and consults the
//! breaker before every attempt.

mod circuit_breaker;
mod config;
mod error;
mod retry;

pub use circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState,
};
pub use config::{BreakerConfig, DependencyConfig, RetryPolicy};
pub use error::{CallError, CircuitOpen, DependencyError};
pub use retry::RetryExecutor;
