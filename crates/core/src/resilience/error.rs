//! Error taxonomy for calls to external dependencies.

use std::time::Duration;

use thiserror::Error;

/// Outcome of a single failed call to an external dependency.
///
/// Splits into transient conditions (worth retrying) and permanent
/// request errors (retrying cannot help).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DependencyError {
    /// The request-level timeout elapsed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Could not connect or the connection dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The dependency answered with a 5xx-class error.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The dependency is throttling us.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Any other condition expected to clear up on its own.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The dependency rejected the request (4xx-class).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The request or response was malformed.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl DependencyError {
    /// Whether the error is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DependencyError::Timeout(_)
                | DependencyError::Connection(_)
                | DependencyError::Server { .. }
                | DependencyError::RateLimited(_)
                | DependencyError::Transient(_)
        )
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DependencyError::Timeout(_) => "timeout",
            DependencyError::Connection(_) => "connection",
            DependencyError::Server { .. } => "server",
            DependencyError::RateLimited(_) => "rate_limited",
            DependencyError::Transient(_) => "transient",
            DependencyError::Rejected { .. } => "rejected",
            DependencyError::Invalid(_) => "invalid",
        }
    }
}

/// Rejection returned by `CircuitBreaker::check` while the breaker is open.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("circuit breaker for '{dependency}' is open")]
pub struct CircuitOpen {
    /// Dependency name.
    pub dependency: String,
    /// Remaining cooldown, if known.
    pub retry_after: Option<Duration>,
}

/// Failure of a guarded call, as surfaced by `RetryExecutor`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The breaker rejected the call; no request was made.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),

    /// Every attempt failed with a transient error.
    #[error("{dependency} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        dependency: String,
        attempts: u32,
        #[source]
        source: DependencyError,
    },

    /// The dependency rejected the request; not retried.
    #[error("{dependency} rejected the request: {source}")]
    Permanent {
        dependency: String,
        #[source]
        source: DependencyError,
    },
}

impl CallError {
    /// Name of the dependency that failed.
    pub fn dependency(&self) -> &str {
        match self {
            CallError::CircuitOpen(open) => &open.dependency,
            CallError::RetriesExhausted { dependency, .. } => dependency,
            CallError::Permanent { dependency, .. } => dependency,
        }
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::CircuitOpen(_) => "circuit_open",
            CallError::RetriesExhausted { .. } => "retries_exhausted",
            CallError::Permanent { .. } => "permanent",
        }
    }

    /// Whether this is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::CircuitOpen(_))
    }
}
