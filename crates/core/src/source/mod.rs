//! Source records for a job.

mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Record;
use crate::resilience::DependencyError;

pub use sqlite::SqliteSourceStore;

/// Errors from reading source records.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The store could not be reached (or is busy).
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The query itself failed.
    #[error("source query failed: {0}")]
    Query(String),

    /// The table name is not a plain identifier.
    #[error("invalid source table name: '{0}'")]
    InvalidTable(String),
}

impl From<SourceError> for DependencyError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Unavailable(msg) => DependencyError::Connection(msg),
            SourceError::Query(msg) => DependencyError::Invalid(msg),
            SourceError::InvalidTable(table) => {
                DependencyError::Invalid(format!("invalid source table name: '{}'", table))
            }
        }
    }
}

/// What to fetch from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    /// Maximum rows to fetch (None = all).
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            limit: None,
            offset: 0,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Store the pipeline reads its input records from.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Dependency name used for the breaker and metrics.
    fn name(&self) -> &str {
        "source"
    }

    /// Fetch records. `Record::row_index` is the position in the result.
    async fn fetch_records(&self, query: &QuerySpec) -> Result<Vec<Record>, SourceError>;
}
