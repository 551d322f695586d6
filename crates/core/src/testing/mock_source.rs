//! Mock source store for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::record::Record;
use crate::source::{QuerySpec, SourceError, SourceStore};

/// Mock implementation of the SourceStore trait.
///
/// Serves a fixed record list, honouring limit and offset. Can be switched
/// into a failing mode to simulate an unreachable source.
#[derive(Debug, Clone, Default)]
pub struct MockSourceStore {
    records: Arc<RwLock<Vec<Record>>>,
    error: Arc<RwLock<Option<SourceError>>>,
    fetch_count: Arc<AtomicUsize>,
}

impl MockSourceStore {
    /// Create a mock serving `records`.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            ..Self::default()
        }
    }

    /// Make every fetch fail with `error` (None restores normal behaviour).
    pub async fn set_error(&self, error: Option<SourceError>) {
        *self.error.write().await = error;
    }

    /// Number of fetch calls made.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceStore for MockSourceStore {
    async fn fetch_records(&self, query: &QuerySpec) -> Result<Vec<Record>, SourceError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.error.read().await.clone() {
            return Err(error);
        }

        let records = self.records.read().await;
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(records
            .iter()
            .skip(query.offset)
            .take(limit)
            .enumerate()
            .map(|(i, record)| {
                let mut record = record.clone();
                record.row_index = i;
                record
            })
            .collect())
    }
}
