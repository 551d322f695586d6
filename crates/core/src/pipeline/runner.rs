//! Pipeline orchestrator implementation.
//!
//! Drives a job through fetch and the configured post-fetch stages:
//! - Fetch: one guarded call to the source store; failure fails the job.
//! - Records are then cut into sub-batches. Every stage runs over a whole
//!   sub-batch (bounded fan-out through `BatchProcessor`) before the next
//!   stage starts on it.
//! - Records failing a stage are dropped and counted; survivors of the last
//!   stage are classified into the compliance buckets.
//!
//! Each job is owned by one spawned runner task, the only writer of its
//! `Job` snapshot. Callers observe it through a `watch` channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{BatchOutcome, BatchProcessor, ItemError};
use crate::denylist::DenylistStore;
use crate::lookup::{Enricher, LitigatorScreen};
use crate::metrics;
use crate::record::{dnc_field, Compliance, Record, IN_DNC_LIST, IN_LITIGATOR_LIST};
use crate::resilience::{
    BreakerSnapshot, CallError, CircuitBreakerRegistry, DependencyError, RetryExecutor,
};
use crate::sink::RecordSink;
use crate::source::SourceStore;

use super::config::{PipelineConfig, StageKind, DNC_DEPENDENCY};
use super::progress::{ProgressSink, ProgressTracker, TracingProgressSink};
use super::types::{Job, JobSpec, JobStatus, PipelineError, ProgressEvent};

/// Field holding extra litigator match information.
const LITIGATOR_DETAILS: &str = "litigator_details";

/// External collaborators of the pipeline.
#[derive(Clone)]
struct Collaborators {
    source: Arc<dyn SourceStore>,
    enricher: Option<Arc<dyn Enricher>>,
    litigator: Option<Arc<dyn LitigatorScreen>>,
    denylist: Option<Arc<dyn DenylistStore>>,
    sink: Option<Arc<dyn RecordSink>>,
    progress: Arc<dyn ProgressSink>,
}

struct JobEntry {
    state: watch::Receiver<Job>,
    cancel: CancellationToken,
}

/// The pipeline orchestrator: starts jobs and exposes their state.
///
/// Jobs run concurrently and independently; the circuit breakers are the
/// only state they share, so a dependency that trips for one job is open
/// for all of them.
pub struct PipelineOrchestrator {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    processor: BatchProcessor,
    breakers: Arc<CircuitBreakerRegistry>,
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator reading from `source`. Stage collaborators are
    /// attached with the `with_*` methods.
    pub fn new(config: PipelineConfig, source: Arc<dyn SourceStore>) -> Self {
        let processor = BatchProcessor::new(config.batch.clone());
        Self {
            config: Arc::new(config),
            collaborators: Collaborators {
                source,
                enricher: None,
                litigator: None,
                denylist: None,
                sink: None,
                progress: Arc::new(TracingProgressSink),
            },
            processor,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.collaborators.enricher = Some(enricher);
        self
    }

    pub fn with_litigator_screen(mut self, screen: Arc<dyn LitigatorScreen>) -> Self {
        self.collaborators.litigator = Some(screen);
        self
    }

    pub fn with_denylist(mut self, denylist: Arc<dyn DenylistStore>) -> Self {
        self.collaborators.denylist = Some(denylist);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.collaborators.sink = Some(sink);
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.collaborators.progress = progress;
        self
    }

    /// Share a breaker registry with other orchestrators.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Start a job in the background and return its id.
    pub async fn start(&self, spec: JobSpec) -> Result<String, PipelineError> {
        self.check_collaborators()?;

        let job_id = Uuid::new_v4().to_string();
        let job = Job::new(job_id.clone(), spec.row_limit);
        let (state_tx, state_rx) = watch::channel(job);
        let cancel = CancellationToken::new();

        self.jobs.write().await.insert(
            job_id.clone(),
            JobEntry {
                state: state_rx,
                cancel: cancel.clone(),
            },
        );

        let runner = JobRunner {
            job_id: job_id.clone(),
            spec,
            config: Arc::clone(&self.config),
            collaborators: self.collaborators.clone(),
            processor: self.processor.clone(),
            breakers: Arc::clone(&self.breakers),
            state: state_tx,
            cancel,
        };
        tokio::spawn(runner.run());

        info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Request cooperative cancellation. No-op for finished jobs.
    pub async fn cancel(&self, job_id: &str) -> Result<(), PipelineError> {
        let jobs = self.jobs.read().await;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;
        if !entry.state.borrow().status.is_terminal() {
            info!(job_id, "Cancellation requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Current snapshot of a job.
    pub async fn get_status(&self, job_id: &str) -> Option<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|entry| entry.state.borrow().clone())
    }

    /// Wait until a job reaches a terminal state and return it.
    pub async fn wait(&self, job_id: &str) -> Result<Job, PipelineError> {
        let mut state = {
            let jobs = self.jobs.read().await;
            jobs.get(job_id)
                .map(|entry| entry.state.clone())
                .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?
        };
        loop {
            {
                let job = state.borrow_and_update();
                if job.status.is_terminal() {
                    return Ok(job.clone());
                }
            }
            if state.changed().await.is_err() {
                // Runner is gone; report what it last published.
                return Ok(state.borrow().clone());
            }
        }
    }

    /// Snapshots of every known job, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut list: Vec<Job> = jobs
            .values()
            .map(|entry| entry.state.borrow().clone())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// State of every circuit breaker used so far.
    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    fn check_collaborators(&self) -> Result<(), PipelineError> {
        self.config
            .check_stages()
            .map_err(PipelineError::InvalidStages)?;
        for stage in &self.config.stages {
            let missing = match stage {
                StageKind::Enrich if self.collaborators.enricher.is_none() => Some("enricher"),
                StageKind::LitigatorScreen if self.collaborators.litigator.is_none() => {
                    Some("litigator screen")
                }
                StageKind::DncScreen if self.collaborators.denylist.is_none() => {
                    Some("denylist store")
                }
                StageKind::Persist if self.collaborators.sink.is_none() => Some("record sink"),
                _ => None,
            };
            if let Some(collaborator) = missing {
                return Err(PipelineError::MissingCollaborator {
                    stage: *stage,
                    collaborator,
                });
            }
        }
        Ok(())
    }
}

/// How a run ended, short of failing.
enum RunEnd {
    Completed,
    Cancelled,
}

/// Records surviving one stage over one sub-batch.
struct StageResult {
    survivors: Vec<Record>,
    failed: usize,
    warnings: usize,
    cancelled: bool,
}

impl StageResult {
    fn passthrough(records: Vec<Record>) -> Self {
        Self {
            survivors: records,
            failed: 0,
            warnings: 0,
            cancelled: false,
        }
    }
}

/// Owns one job for its whole lifetime.
struct JobRunner {
    job_id: String,
    spec: JobSpec,
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    processor: BatchProcessor,
    breakers: Arc<CircuitBreakerRegistry>,
    state: watch::Sender<Job>,
    cancel: CancellationToken,
}

impl JobRunner {
    async fn run(self) {
        self.state.send_modify(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
        });
        info!(job_id = %self.job_id, stages = ?self.config.stages, "Job started");

        let result = self.execute().await;

        let (status, message) = match result {
            Ok(RunEnd::Completed) => (JobStatus::Completed, "Job completed".to_string()),
            Ok(RunEnd::Cancelled) => (JobStatus::Cancelled, "Job cancelled".to_string()),
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Job failed");
                (JobStatus::Failed, format!("Job failed: {}", e))
            }
        };
        let error = match status {
            JobStatus::Failed => Some(message.clone()),
            _ => None,
        };

        self.state.send_modify(|job| {
            job.status = status;
            job.completed_at = Some(Utc::now());
            job.error = error;
            if status == JobStatus::Completed {
                job.progress = 100;
            }
        });
        metrics::JOBS_FINISHED
            .with_label_values(&[status.as_str()])
            .inc();

        let job = self.snapshot();
        info!(
            job_id = %self.job_id,
            status = %status,
            processed = job.total_rows_processed,
            clean = job.stats.clean_count,
            litigator = job.stats.litigator_count,
            dnc = job.stats.dnc_count,
            both = job.stats.both_count,
            errors = job.stats.error_count,
            "Job finished"
        );
        self.emit(message).await;
    }

    async fn execute(&self) -> Result<RunEnd, PipelineError> {
        let records = self.fetch().await?;

        let total_rows = records.len();
        let sub_batch_size = self.config.sub_batch_size.max(1);
        let total_batches = total_rows.div_ceil(sub_batch_size);
        self.state.send_modify(|job| {
            job.total_rows = total_rows;
            job.total_batches = total_batches;
        });
        self.emit(format!(
            "Fetched {} records in {} sub-batches",
            total_rows, total_batches
        ))
        .await;

        let weights: Vec<f64> = self
            .config
            .stages
            .iter()
            .map(|stage| self.config.stage_weight(*stage))
            .collect();
        let mut tracker = ProgressTracker::new(total_rows, &weights);

        let mut remaining = records.into_iter();
        for batch_index in 0..total_batches {
            if self.cancel.is_cancelled() {
                debug!(job_id = %self.job_id, batch = batch_index, "Cancelled between sub-batches");
                return Ok(RunEnd::Cancelled);
            }

            let batch: Vec<Record> = remaining.by_ref().take(sub_batch_size).collect();
            let batch_len = batch.len();
            let mut survivors = batch;

            for (stage, weight) in self.config.stages.iter().zip(&weights) {
                if self.cancel.is_cancelled() {
                    debug!(job_id = %self.job_id, stage = %stage, "Cancelled between stages");
                    return Ok(RunEnd::Cancelled);
                }

                let input_len = survivors.len();
                let started = Instant::now();
                let result = self.run_stage(*stage, survivors).await;
                metrics::STAGE_DURATION
                    .with_label_values(&[stage.as_str()])
                    .observe(started.elapsed().as_secs_f64());

                if result.failed > 0 {
                    metrics::RECORD_ERRORS
                        .with_label_values(&[stage.as_str()])
                        .inc_by(result.failed as u64);
                }
                self.state.send_modify(|job| {
                    job.stats.record_errors(stage.as_str(), result.failed);
                    job.stats.batch_warnings += result.warnings;
                });

                if result.cancelled {
                    return Ok(RunEnd::Cancelled);
                }

                if let Some(max_rate) = self.config.max_stage_error_rate {
                    if input_len > 0 {
                        let rate = result.failed as f64 / input_len as f64;
                        if rate > max_rate {
                            return Err(PipelineError::StageFailure {
                                stage: stage.as_str().to_string(),
                                message: format!(
                                    "{}/{} records failed in sub-batch {} (limit {:.0}%)",
                                    result.failed,
                                    input_len,
                                    batch_index + 1,
                                    max_rate * 100.0
                                ),
                            });
                        }
                    }
                }

                let progress = tracker.advance(weight * batch_len as f64);
                self.state.send_modify(|job| job.progress = progress);
                self.emit(format!(
                    "{}: {}/{} records succeeded in sub-batch {}/{}",
                    stage,
                    result.survivors.len(),
                    input_len,
                    batch_index + 1,
                    total_batches
                ))
                .await;

                survivors = result.survivors;
            }

            let classified: Vec<Compliance> = survivors.iter().map(Compliance::of).collect();
            for compliance in &classified {
                metrics::RECORDS_CLASSIFIED
                    .with_label_values(&[compliance.as_str()])
                    .inc();
            }
            let progress = if weights.iter().sum::<f64>() > 0.0 {
                tracker.current()
            } else {
                tracker.advance(batch_len as f64)
            };
            self.state.send_modify(|job| {
                for compliance in &classified {
                    job.stats.classify(*compliance);
                }
                job.total_rows_processed += classified.len();
                job.current_row += batch_len;
                job.current_batch = batch_index + 1;
                job.progress = progress;
            });
            self.emit(format!(
                "Sub-batch {}/{} complete: {} processed, {} errored",
                batch_index + 1,
                total_batches,
                classified.len(),
                batch_len - classified.len()
            ))
            .await;
        }

        Ok(RunEnd::Completed)
    }

    async fn fetch(&self) -> Result<Vec<Record>, PipelineError> {
        let source = self.collaborators.source.as_ref();
        let executor = self.executor_for(source.name());

        let mut query = self.spec.query.clone();
        if let Some(limit) = self.spec.row_limit {
            query.limit = Some(query.limit.map_or(limit, |l| l.min(limit)));
        }
        let query = &query;

        let mut records = executor
            .execute(move || async move {
                source
                    .fetch_records(query)
                    .await
                    .map_err(DependencyError::from)
            })
            .await
            .map_err(|e| PipelineError::StageFailure {
                stage: "fetch".to_string(),
                message: e.to_string(),
            })?;

        if let Some(limit) = self.spec.row_limit {
            records.truncate(limit);
        }
        info!(job_id = %self.job_id, table = %query.table, rows = records.len(), "Source records fetched");
        Ok(records)
    }

    async fn run_stage(&self, stage: StageKind, records: Vec<Record>) -> StageResult {
        if records.is_empty() {
            return StageResult::passthrough(records);
        }
        match stage {
            StageKind::Enrich => self.enrich(records).await,
            StageKind::LitigatorScreen => self.screen_litigators(records).await,
            StageKind::DncScreen => self.screen_dnc(records).await,
            StageKind::Persist => self.persist(records).await,
        }
    }

    async fn enrich(&self, records: Vec<Record>) -> StageResult {
        let Some(enricher) = self.collaborators.enricher.clone() else {
            return StageResult::passthrough(records);
        };
        let executor = self.executor_for(enricher.name());
        let workers = self
            .config
            .stage_concurrency(StageKind::Enrich)
            .workers_for(records.len());
        let rows: Vec<usize> = records.iter().map(|r| r.row_index).collect();

        let outcome = self
            .processor
            .process(records, workers, &self.cancel, move |mut record: Record| {
                let enricher = Arc::clone(&enricher);
                let executor = executor.clone();
                async move {
                    let enrichment = {
                        let enricher = enricher.as_ref();
                        let target = &record;
                        executor.execute(move || enricher.enrich(target)).await?
                    };
                    record.merge(enrichment.fields);
                    Ok::<Record, CallError>(record)
                }
            })
            .await;

        self.collect(StageKind::Enrich, &rows, outcome)
    }

    async fn screen_litigators(&self, records: Vec<Record>) -> StageResult {
        let Some(screen) = self.collaborators.litigator.clone() else {
            return StageResult::passthrough(records);
        };
        let executor = self.executor_for(screen.name());
        let workers = self
            .config
            .stage_concurrency(StageKind::LitigatorScreen)
            .workers_for(records.len());
        let rows: Vec<usize> = records.iter().map(|r| r.row_index).collect();

        let outcome = self
            .processor
            .process(records, workers, &self.cancel, move |mut record: Record| {
                let screen = Arc::clone(&screen);
                let executor = executor.clone();
                async move {
                    let verdict = {
                        let screen = screen.as_ref();
                        let target = &record;
                        executor.execute(move || screen.check(target)).await?
                    };
                    record.set(IN_LITIGATOR_LIST, verdict.is_litigator);
                    if !verdict.details.is_empty() {
                        record.set(LITIGATOR_DETAILS, Value::Object(verdict.details));
                    }
                    Ok::<Record, CallError>(record)
                }
            })
            .await;

        self.collect(StageKind::LitigatorScreen, &rows, outcome)
    }

    /// One chunked denylist lookup for the whole sub-batch.
    async fn screen_dnc(&self, mut records: Vec<Record>) -> StageResult {
        let Some(denylist) = self.collaborators.denylist.clone() else {
            return StageResult::passthrough(records);
        };
        let executor = self.executor_for(DNC_DEPENDENCY);

        let record_phones: Vec<Vec<(u32, String)>> = records.iter().map(Record::phones).collect();
        let unique: HashSet<String> = record_phones
            .iter()
            .flatten()
            .map(|(_, phone)| phone.clone())
            .collect();

        let lookup = executor
            .execute(move || {
                let denylist = Arc::clone(&denylist);
                let phones = unique.clone();
                async move {
                    tokio::task::spawn_blocking(move || denylist.check_many(&phones))
                        .await
                        .map_err(|e| {
                            DependencyError::Transient(format!("denylist lookup task failed: {}", e))
                        })?
                        .map_err(DependencyError::from)
                }
            })
            .await;

        let listed = match lookup {
            Ok(listed) => listed,
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    stage = %StageKind::DncScreen,
                    records = records.len(),
                    error = %e,
                    "Denylist lookup failed for sub-batch"
                );
                return StageResult {
                    failed: records.len(),
                    survivors: Vec::new(),
                    warnings: 1,
                    cancelled: false,
                };
            }
        };

        for (record, phones) in records.iter_mut().zip(record_phones) {
            let mut any = false;
            for (slot, phone) in phones {
                let hit = listed.contains(&phone);
                any |= hit;
                record.set(dnc_field(slot), hit);
            }
            record.set(IN_DNC_LIST, any);
        }
        debug!(
            job_id = %self.job_id,
            phones = listed.len(),
            records = records.len(),
            "Denylist screen complete"
        );
        StageResult::passthrough(records)
    }

    /// Writes in chunks of the stage's `batch_size`; a failed chunk drops
    /// all of its records. Once started, a persist runs to completion so the
    /// sink never holds rows the job did not count.
    async fn persist(&self, records: Vec<Record>) -> StageResult {
        let Some(sink) = self.collaborators.sink.clone() else {
            return StageResult::passthrough(records);
        };
        let executor = self.executor_for(sink.name());
        let profile = self.config.stage_concurrency(StageKind::Persist);
        let chunk_size = profile.batch_size.max(1);

        let mut chunks: Vec<Vec<Record>> = Vec::new();
        let mut iter = records.into_iter().peekable();
        while iter.peek().is_some() {
            chunks.push(iter.by_ref().take(chunk_size).collect());
        }
        let chunk_lens: Vec<usize> = chunks.iter().map(Vec::len).collect();
        let workers = profile.workers_for(chunk_lens.iter().sum());
        let job_id: Arc<str> = Arc::from(self.job_id.as_str());
        let uncancellable = CancellationToken::new();

        let outcome = self
            .processor
            .process(chunks, workers, &uncancellable, move |chunk: Vec<Record>| {
                let sink = Arc::clone(&sink);
                let executor = executor.clone();
                let job_id = Arc::clone(&job_id);
                async move {
                    {
                        let sink = sink.as_ref();
                        let job_id: &str = &job_id;
                        let rows: &[Record] = &chunk;
                        executor
                            .execute(move || async move {
                                sink.persist(job_id, rows)
                                    .await
                                    .map_err(DependencyError::from)
                            })
                            .await?;
                    }
                    Ok::<Vec<Record>, CallError>(chunk)
                }
            })
            .await;

        let mut result = StageResult::passthrough(Vec::new());
        result.warnings = outcome.warnings.len();
        for (len, chunk) in chunk_lens.iter().zip(outcome.results) {
            match chunk {
                Ok(chunk) => result.survivors.extend(chunk),
                Err(e) => {
                    result.failed += len;
                    warn!(
                        job_id = %self.job_id,
                        stage = %StageKind::Persist,
                        records = len,
                        error = %e,
                        "Failed to persist chunk"
                    );
                }
            }
        }
        result
    }

    /// Split a per-record outcome into survivors and failures.
    fn collect(
        &self,
        stage: StageKind,
        rows: &[usize],
        outcome: BatchOutcome<Record, CallError>,
    ) -> StageResult {
        let mut result = StageResult::passthrough(Vec::with_capacity(outcome.success_count()));
        result.warnings = outcome.warnings.len();
        result.cancelled = outcome.cancelled;

        for (row, item) in rows.iter().zip(outcome.results) {
            match item {
                Ok(record) => result.survivors.push(record),
                Err(e) => {
                    result.failed += 1;
                    match &e {
                        ItemError::Failed(call) if call.is_circuit_open() => debug!(
                            job_id = %self.job_id,
                            stage = %stage,
                            row,
                            dependency = call.dependency(),
                            "Record skipped, circuit open"
                        ),
                        _ => debug!(
                            job_id = %self.job_id,
                            stage = %stage,
                            row,
                            error = %e,
                            "Record failed"
                        ),
                    }
                }
            }
        }
        if result.failed > 0 {
            debug!(
                job_id = %self.job_id,
                stage = %stage,
                failed = result.failed,
                succeeded = result.survivors.len(),
                "Stage finished with errors"
            );
        }
        result
    }

    fn executor_for(&self, dependency: &str) -> RetryExecutor {
        let config = self.config.dependency(dependency);
        let breaker = self
            .breakers
            .get_or_create(dependency, config.breaker_config());
        RetryExecutor::new(config.retry_policy(), breaker)
    }

    fn snapshot(&self) -> Job {
        self.state.borrow().clone()
    }

    async fn emit(&self, message: String) {
        let event = ProgressEvent::from_job(&self.snapshot(), message);
        self.collaborators.progress.emit(event).await;
    }
}
