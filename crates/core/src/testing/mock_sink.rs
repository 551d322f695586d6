//! Mock record sink for testing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::record::{Compliance, Record};
use crate::sink::{RecordSink, SinkError};

/// Recorded persist call.
#[derive(Debug, Clone)]
pub struct PersistedRecord {
    pub job_id: String,
    pub record: Record,
}

/// Mock implementation of the RecordSink trait.
///
/// Keeps everything written in memory.
#[derive(Debug, Clone, Default)]
pub struct MockRecordSink {
    persisted: Arc<RwLock<Vec<PersistedRecord>>>,
    next_error: Arc<RwLock<Option<SinkError>>>,
    calls: Arc<AtomicUsize>,
}

impl MockRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next persist call with `error`.
    pub async fn set_next_error(&self, error: SinkError) {
        *self.next_error.write().await = Some(error);
    }

    /// All persisted records, in write order.
    pub async fn persisted(&self) -> Vec<PersistedRecord> {
        self.persisted.read().await.clone()
    }

    /// Records persisted for one job.
    pub async fn records_for(&self, job_id: &str) -> Vec<Record> {
        self.persisted
            .read()
            .await
            .iter()
            .filter(|p| p.job_id == job_id)
            .map(|p| p.record.clone())
            .collect()
    }

    pub async fn persisted_count(&self) -> usize {
        self.persisted.read().await.len()
    }

    /// Persisted records for `job_id` in the given bucket.
    pub async fn count_classified(&self, job_id: &str, bucket: Compliance) -> usize {
        self.records_for(job_id)
            .await
            .iter()
            .filter(|r| Compliance::of(r) == bucket)
            .count()
    }

    /// Number of persist calls, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn clear(&self) {
        self.persisted.write().await.clear();
    }
}

#[async_trait]
impl RecordSink for MockRecordSink {
    async fn persist(&self, job_id: &str, records: &[Record]) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }
        let mut persisted = self.persisted.write().await;
        persisted.extend(records.iter().map(|record| PersistedRecord {
            job_id: job_id.to_string(),
            record: record.clone(),
        }));
        Ok(())
    }
}
