//! Types for the pipeline orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::StageKind;
use crate::record::Compliance;
use crate::source::QuerySpec;

/// Errors surfaced by the orchestrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// No job with this id.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A configured stage has no collaborator to run it.
    #[error("stage '{stage}' is configured but no {collaborator} was supplied")]
    MissingCollaborator {
        stage: StageKind,
        collaborator: &'static str,
    },

    /// The configured stage list cannot be run.
    #[error("invalid stage list: {0}")]
    InvalidStages(String),

    /// A stage failed as a whole; the job cannot continue.
    #[error("stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative counters of a job. Never decrease during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub clean_count: usize,
    pub litigator_count: usize,
    pub dnc_count: usize,
    pub both_count: usize,
    /// Records dropped because a stage failed for them.
    pub error_count: usize,
    /// `error_count` broken down by stage name.
    #[serde(default)]
    pub stage_errors: BTreeMap<String, usize>,
    /// Sub-batches whose error rate crossed the warning threshold.
    #[serde(default)]
    pub batch_warnings: usize,
}

impl JobStats {
    /// Count one fully processed record.
    pub fn classify(&mut self, compliance: Compliance) {
        match compliance {
            Compliance::Clean => self.clean_count += 1,
            Compliance::Litigator => self.litigator_count += 1,
            Compliance::Dnc => self.dnc_count += 1,
            Compliance::Both => self.both_count += 1,
        }
    }

    /// Count `failed` records dropped in `stage`.
    pub fn record_errors(&mut self, stage: &str, failed: usize) {
        if failed == 0 {
            return;
        }
        self.error_count += failed;
        *self.stage_errors.entry(stage.to_string()).or_insert(0) += failed;
    }

    /// Sum of the four classification buckets.
    pub fn classified(&self) -> usize {
        self.clean_count + self.litigator_count + self.dnc_count + self.both_count
    }
}

/// Snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// 0-100. Only reaches 100 on completion.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<usize>,
    /// Records that went through every stage.
    pub total_rows_processed: usize,
    pub stats: JobStats,
    /// Rows covered by finished sub-batches (processed or errored).
    pub current_row: usize,
    pub total_rows: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// A freshly created job.
    pub fn new(id: impl Into<String>, row_limit: Option<usize>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            progress: 0,
            row_limit,
            total_rows_processed: 0,
            stats: JobStats::default(),
            current_row: 0,
            total_rows: 0,
            current_batch: 0,
            total_batches: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn rows_remaining(&self) -> usize {
        self.total_rows.saturating_sub(self.current_row)
    }
}

/// Request to run a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// What to fetch from the source store.
    pub query: QuerySpec,
    /// Cap on records processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_limit: Option<usize>,
}

impl JobSpec {
    pub fn new(query: QuerySpec) -> Self {
        Self {
            query,
            row_limit: None,
        }
    }

    pub fn with_row_limit(mut self, row_limit: Option<usize>) -> Self {
        self.row_limit = row_limit;
        self
    }
}

/// Counters carried by a progress event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub clean: usize,
    pub litigator: usize,
    pub dnc: usize,
    pub both: usize,
    pub errors: usize,
}

impl From<&JobStats> for ProgressStats {
    fn from(stats: &JobStats) -> Self {
        Self {
            clean: stats.clean_count,
            litigator: stats.litigator_count,
            dnc: stats.dnc_count,
            both: stats.both_count,
            errors: stats.error_count,
        }
    }
}

/// Progress update emitted after each stage and sub-batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub status: JobStatus,
    pub current_row: usize,
    pub total_rows: usize,
    pub rows_remaining: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub progress: u8,
    pub message: String,
    pub stats: ProgressStats,
}

impl ProgressEvent {
    /// Build an event from a job snapshot.
    pub fn from_job(job: &Job, message: impl Into<String>) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            current_row: job.current_row,
            total_rows: job.total_rows,
            rows_remaining: job.rows_remaining(),
            current_batch: job.current_batch,
            total_batches: job.total_batches,
            progress: job.progress,
            message: message.into(),
            stats: ProgressStats::from(&job.stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_stats_classify() {
        let mut stats = JobStats::default();
        stats.classify(Compliance::Clean);
        stats.classify(Compliance::Both);
        stats.classify(Compliance::Both);
        stats.record_errors("enrich", 2);
        stats.record_errors("enrich", 1);
        stats.record_errors("persist", 0);

        assert_eq!(stats.classified(), 3);
        assert_eq!(stats.both_count, 2);
        assert_eq!(stats.error_count, 3);
        assert_eq!(stats.stage_errors.get("enrich"), Some(&3));
        assert!(!stats.stage_errors.contains_key("persist"));
    }

    #[test]
    fn test_progress_event_from_job() {
        let mut job = Job::new("job-1", Some(100));
        job.status = JobStatus::Running;
        job.total_rows = 100;
        job.current_row = 40;
        job.stats.classify(Compliance::Dnc);
        job.stats.record_errors("dnc_screen", 1);

        let event = ProgressEvent::from_job(&job, "halfway");
        assert_eq!(event.rows_remaining, 60);
        assert_eq!(event.stats.dnc, 1);
        assert_eq!(event.stats.errors, 1);
        assert_eq!(event.message, "halfway");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["stats"]["clean"], 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::MissingCollaborator {
            stage: StageKind::DncScreen,
            collaborator: "denylist store",
        };
        assert_eq!(
            err.to_string(),
            "stage 'dnc_screen' is configured but no denylist store was supplied"
        );
    }
}
