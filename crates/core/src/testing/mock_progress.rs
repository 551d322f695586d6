//! Progress sink that records every event.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::pipeline::{JobStatus, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Default)]
pub struct RecordingProgressSink {
    events: Arc<RwLock<Vec<ProgressEvent>>>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, in order.
    pub async fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().await.clone()
    }

    /// Events for one job.
    pub async fn events_for(&self, job_id: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// The last event for `job_id` with a terminal status.
    pub async fn terminal_event(&self, job_id: &str) -> Option<ProgressEvent> {
        self.events_for(job_id)
            .await
            .into_iter()
            .rev()
            .find(|e| e.status.is_terminal())
    }

    pub async fn count_with_status(&self, status: JobStatus) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.status == status)
            .count()
    }
}

#[async_trait]
impl ProgressSink for RecordingProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.write().await.push(event);
    }
}
