//! Configuration for batch execution.

use serde::{Deserialize, Serialize};

use super::sizer::calculate_workers;

/// Concurrency profile of one pipeline stage.
///
/// Each stage gets its own profile since the external services behind
/// them have different rate limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConcurrency {
    /// Lower bound on workers.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Upper bound on workers. Protects downstream rate limits.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Workers requested per `batch_size` items.
    #[serde(default = "default_workers_per_batch")]
    pub workers_per_batch: f64,

    /// Items per sizing batch. For the persist stage this is also the
    /// number of records written per sink call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Relative cost of the stage, used to weight job progress.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    10
}

fn default_workers_per_batch() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    50
}

fn default_weight() -> f64 {
    1.0
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            workers_per_batch: default_workers_per_batch(),
            batch_size: default_batch_size(),
            weight: default_weight(),
        }
    }
}

impl StageConcurrency {
    /// Worker count for a workload of `workload_size` items.
    pub fn workers_for(&self, workload_size: usize) -> usize {
        calculate_workers(
            workload_size,
            self.batch_size,
            self.min_workers,
            self.max_workers,
            self.workers_per_batch,
        )
        .max(1)
    }

    /// Sets the worker bounds.
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Sets workers requested per batch.
    pub fn with_workers_per_batch(mut self, workers_per_batch: f64) -> Self {
        self.workers_per_batch = workers_per_batch;
        self
    }

    /// Sets the sizing batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the progress weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// Configuration for the batch processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Soft ceiling on items in flight per sub-batch (None = one sub-batch).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: Option<usize>,

    /// Error rate (0.0-1.0) above which a batch-level warning is raised.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
}

fn default_chunk_size() -> Option<usize> {
    Some(1000)
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            error_rate_threshold: default_error_rate_threshold(),
        }
    }
}

impl BatchConfig {
    /// Sets the sub-batch chunk size.
    pub fn with_chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the warning threshold.
    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }
}
