//! Batch execution: worker sizing and the bounded fan-out executor.
//!
//! - `calculate_workers` decides how many workers a workload deserves.
//! - `BatchProcessor` runs a per-item operation over those workers,
//!   preserving input order and isolating per-item failures.
//!
//! # Example
//!
//! ```ignore
//! use leadflow_core::batch::{BatchConfig, BatchProcessor, StageConcurrency};
//! use tokio_util::sync::CancellationToken;
//!
//! let profile = StageConcurrency::default().with_workers(2, 8);
//! let processor = BatchProcessor::new(BatchConfig::default());
//!
//! let items = vec![1, 2, 3];
//! let workers = profile.workers_for(items.len());
//! let outcome = processor
//!     .process(items, workers, &CancellationToken::new(), |n| async move {
//!         Ok::<_, String>(n * 2)
//!     })
//!     .await;
//! assert_eq!(outcome.results.len(), 3);
//! ```

mod config;
mod processor;
mod sizer;

pub use config::{BatchConfig, StageConcurrency};
pub use processor::{BatchOutcome, BatchPartialFailure, BatchProcessor, ItemError};
pub use sizer::calculate_workers;
