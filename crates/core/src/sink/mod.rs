//! Persistence of processed records.

mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::Record;
use crate::resilience::DependencyError;

pub use sqlite::SqliteRecordSink;

/// Errors from persisting records.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// The store is unreachable, busy or locked.
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The write was rejected.
    #[error("sink write failed: {0}")]
    Write(String),

    #[error("failed to serialize record: {0}")]
    Serialization(String),
}

impl From<SinkError> for DependencyError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Unavailable(msg) => DependencyError::Connection(msg),
            SinkError::Write(msg) => DependencyError::Transient(msg),
            SinkError::Serialization(msg) => DependencyError::Invalid(msg),
        }
    }
}

/// Destination for records that made it through every stage.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Dependency name used for the breaker and metrics.
    fn name(&self) -> &str {
        "sink"
    }

    /// Write `records` for `job_id`. All-or-nothing per call.
    async fn persist(&self, job_id: &str, records: &[Record]) -> Result<(), SinkError>;
}
