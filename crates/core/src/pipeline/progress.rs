//! Progress reporting.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use super::types::ProgressEvent;

/// Receiver of job progress events.
///
/// Emission never fails from the orchestrator's point of view; sinks log
/// their own delivery problems.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: ProgressEvent);
}

/// Forwards events over an mpsc channel.
///
/// Cheaply cloneable. If the channel is closed the event is dropped and the
/// error logged.
#[derive(Clone)]
pub struct ChannelProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.tx.send(event).await {
            tracing::error!("Failed to emit progress event for job {}: channel closed", e.0.job_id);
        }
    }
}

/// Logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

#[async_trait]
impl ProgressSink for TracingProgressSink {
    async fn emit(&self, event: ProgressEvent) {
        info!(
            job_id = %event.job_id,
            status = %event.status,
            progress = event.progress,
            current_row = event.current_row,
            total_rows = event.total_rows,
            batch = event.current_batch,
            total_batches = event.total_batches,
            clean = event.stats.clean,
            litigator = event.stats.litigator,
            dnc = event.stats.dnc,
            both = event.stats.both,
            errors = event.stats.errors,
            "{}",
            event.message
        );
    }
}

/// Tracks weighted progress across sub-batches and stages.
///
/// Each stage contributes `weight * rows` units when it finishes a
/// sub-batch. The reported percentage never decreases and stays below 100
/// until the job completes.
#[derive(Debug, Clone)]
pub(crate) struct ProgressTracker {
    total_units: f64,
    done_units: f64,
    last: u8,
}

impl ProgressTracker {
    pub(crate) fn new(total_rows: usize, stage_weights: &[f64]) -> Self {
        let per_row: f64 = stage_weights.iter().sum();
        // With no weighted stages, progress follows finished rows.
        let per_row = if per_row > 0.0 { per_row } else { 1.0 };
        Self {
            total_units: per_row * total_rows as f64,
            done_units: 0.0,
            last: 0,
        }
    }

    /// Record `units` of finished work and return the new percentage.
    pub(crate) fn advance(&mut self, units: f64) -> u8 {
        if units.is_finite() && units > 0.0 {
            self.done_units += units;
        }
        let pct = if self.total_units > 0.0 {
            (self.done_units / self.total_units * 100.0).floor()
        } else {
            0.0
        };
        let pct = pct.clamp(0.0, 99.0) as u8;
        self.last = self.last.max(pct);
        self.last
    }

    pub(crate) fn current(&self) -> u8 {
        self.last
    }
}
