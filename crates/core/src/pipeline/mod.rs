//! Job execution core.
//!
//! `PipelineOrchestrator` runs jobs (fetch, then the configured stages over
//! sub-batches), aggregates compliance counts and reports progress through
//! a `ProgressSink`.

mod config;
mod progress;
mod runner;
mod types;

pub use config::{PipelineConfig, StageKind, DNC_DEPENDENCY};
pub use progress::{ChannelProgressSink, ProgressSink, TracingProgressSink};
pub use runner::PipelineOrchestrator;
pub use types::{
    Job, JobSpec, JobStats, JobStatus, PipelineError, ProgressEvent, ProgressStats,
};
