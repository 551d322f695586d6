//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Resilience (breaker transitions, external calls, retries)
//! - Pipeline (record classification, stage errors, job outcomes, stage timing)
//!
//! Collectors are created lazily and never registered globally; callers
//! register them with their own `prometheus::Registry` via `register_all`
//! and export with `encode_text`.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

// =============================================================================
// Resilience
// =============================================================================

/// Circuit breaker transitions by dependency and new state.
pub static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "leadflow_breaker_transitions_total",
            "Circuit breaker state transitions",
        ),
        &["dependency", "state"], // "open", "half_open", "closed"
    )
    .expect("valid metric definition")
});

/// External call attempts by dependency and outcome.
pub static EXTERNAL_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "leadflow_external_calls_total",
            "External dependency call attempts",
        ),
        &["dependency", "result"], // "success", "permanent", "circuit_open", or an error kind
    )
    .expect("valid metric definition")
});

/// Retries scheduled by dependency.
pub static RETRY_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("leadflow_retry_attempts_total", "Retries scheduled after a transient failure"),
        &["dependency"],
    )
    .expect("valid metric definition")
});

// =============================================================================
// Pipeline
// =============================================================================

/// Records classified by compliance bucket.
pub static RECORDS_CLASSIFIED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "leadflow_records_classified_total",
            "Fully processed records by compliance bucket",
        ),
        &["bucket"], // "clean", "litigator", "dnc", "both"
    )
    .expect("valid metric definition")
});

/// Records dropped by the stage they failed in.
pub static RECORD_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("leadflow_record_errors_total", "Records that failed a stage"),
        &["stage"],
    )
    .expect("valid metric definition")
});

/// Jobs finished by terminal status.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("leadflow_jobs_finished_total", "Jobs that reached a terminal state"),
        &["status"], // "completed", "failed", "cancelled"
    )
    .expect("valid metric definition")
});

/// Time spent in one stage for one sub-batch.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "leadflow_stage_duration_seconds",
            "Duration of a stage over one sub-batch",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["stage"],
    )
    .expect("valid metric definition")
});

/// All core metrics, for registration with a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Resilience
        Box::new(BREAKER_TRANSITIONS.clone()),
        Box::new(EXTERNAL_CALLS.clone()),
        Box::new(RETRY_ATTEMPTS.clone()),
        // Pipeline
        Box::new(RECORDS_CLASSIFIED.clone()),
        Box::new(RECORD_ERRORS.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(STAGE_DURATION.clone()),
    ]
}

/// Register every core metric with `registry`.
pub fn register_all(registry: &Registry) -> prometheus::Result<()> {
    for metric in all_metrics() {
        registry.register(metric)?;
    }
    Ok(())
}

/// Encode everything in `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        let registry = Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        RECORD_ERRORS.with_label_values(&["enrich"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "leadflow_record_errors_total"));
    }

    #[test]
    fn test_encode_text_exports_core_metrics() {
        let registry = Registry::new();
        register_all(&registry).unwrap();
        JOBS_FINISHED.with_label_values(&["completed"]).inc();
        EXTERNAL_CALLS
            .with_label_values(&["enrichment", "success"])
            .inc();

        let text = encode_text(&registry).unwrap();
        assert!(text.contains("# TYPE leadflow_jobs_finished_total counter"));
        assert!(text.contains("leadflow_jobs_finished_total{status=\"completed\"}"));
        assert!(text.contains("leadflow_external_calls_total"));
    }

    #[test]
    fn test_register_all_twice_fails() {
        let registry = Registry::new();
        register_all(&registry).unwrap();
        assert!(register_all(&registry).is_err());
    }
}
