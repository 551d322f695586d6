use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use prometheus::Registry;
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use leadflow_core::{
    load_config, metrics, validate_config, Config, DenylistStore, Enricher, HttpEnricher,
    HttpLitigatorScreen, JobSpec, JobStatus, LitigatorScreen, PipelineOrchestrator, RecordSink,
    SanitizedConfig, SourceStore, SqliteDenylist, SqliteRecordSink, SqliteSourceStore, StageKind,
};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code used when the job was cancelled with Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("leadflow: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let config_path = std::env::var("LEADFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("leadflow.toml"));

    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    init_logging(&config);

    let sanitized = SanitizedConfig::from(&config);
    let config_json = serde_json::to_string(&sanitized).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        version = VERSION,
        config_hash = &config_hash[..16],
        "Starting leadflow with configuration from {:?}",
        config_path
    );
    info!("Configuration: {}", config_json);

    let registry = Registry::new();
    metrics::register_all(&registry).context("Failed to register metrics")?;

    let orchestrator = build_orchestrator(&config)?;

    let spec = JobSpec::new(config.query_spec()).with_row_limit(config.source.limit);
    let job_id = orchestrator
        .start(spec)
        .await
        .context("Failed to start job")?;

    let job = tokio::select! {
        job = orchestrator.wait(&job_id) => job?,
        _ = signal::ctrl_c() => {
            warn!(job_id = %job_id, "Interrupt received, cancelling job");
            orchestrator.cancel(&job_id).await?;
            orchestrator.wait(&job_id).await?
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&job).context("Failed to serialize job")?
    );
    for breaker in orchestrator.breaker_states() {
        info!(
            dependency = %breaker.dependency,
            state = %breaker.state,
            failures = breaker.failure_count,
            "Circuit breaker state"
        );
    }

    if let Err(e) = export_metrics(&config, &registry) {
        warn!("Failed to export metrics: {:#}", e);
    }

    match job.status {
        JobStatus::Completed => Ok(ExitCode::SUCCESS),
        JobStatus::Cancelled => Ok(ExitCode::from(EXIT_CANCELLED)),
        _ => bail!(
            "job {} failed: {}",
            job.id,
            job.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Write the registry to `metrics.textfile`, or log it when no file is set.
fn export_metrics(config: &Config, registry: &Registry) -> Result<()> {
    let text = metrics::encode_text(registry).context("Failed to encode metrics")?;
    match &config.metrics.textfile {
        Some(path) => {
            // Collectors may read at any moment; replace atomically.
            let partial = path.with_extension("prom.tmp");
            std::fs::write(&partial, &text)
                .with_context(|| format!("Failed to write {:?}", partial))?;
            std::fs::rename(&partial, path)
                .with_context(|| format!("Failed to move metrics into {:?}", path))?;
            info!("Metrics written to {:?}", path);
        }
        None => debug!("Metrics:\n{}", text),
    }
    Ok(())
}

/// Wire the SQLite stores and the configured lookup services.
///
/// Stages whose service is not configured are dropped with a warning.
fn build_orchestrator(config: &Config) -> Result<PipelineOrchestrator> {
    let mut pipeline = config.pipeline_config()?;

    let source_path = config
        .source
        .path
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    let source: Arc<dyn SourceStore> = Arc::new(
        SqliteSourceStore::new(&source_path)
            .with_context(|| format!("Failed to open source database {:?}", source_path))?,
    );
    info!("Source database: {:?}, table {}", source_path, config.source.table);

    let denylist_path = config
        .denylist
        .path
        .clone()
        .unwrap_or_else(|| config.database.path.clone());
    let denylist: Arc<dyn DenylistStore> = Arc::new(
        SqliteDenylist::new(&denylist_path)
            .with_context(|| format!("Failed to open denylist {:?}", denylist_path))?
            .with_chunk_size(config.denylist.chunk_size),
    );

    let sink: Arc<dyn RecordSink> = Arc::new(
        SqliteRecordSink::new(&config.database.path)
            .with_context(|| format!("Failed to open results database {:?}", config.database.path))?,
    );

    let enricher: Option<Arc<dyn Enricher>> = match &config.enrichment {
        Some(lookup) => {
            info!("Enrichment service at {}", lookup.url);
            Some(Arc::new(
                HttpEnricher::new("enrichment", lookup.clone())
                    .context("Failed to create enrichment client")?,
            ))
        }
        None => None,
    };
    let litigator: Option<Arc<dyn LitigatorScreen>> = match &config.litigator {
        Some(lookup) => {
            info!("Litigator screening service at {}", lookup.url);
            Some(Arc::new(
                HttpLitigatorScreen::new("litigator", lookup.clone())
                    .context("Failed to create litigator client")?,
            ))
        }
        None => None,
    };

    let stages: Vec<StageKind> = pipeline
        .stages
        .iter()
        .copied()
        .filter(|stage| match stage {
            StageKind::Enrich if enricher.is_none() => {
                warn!("No enrichment service configured, skipping enrich stage");
                false
            }
            StageKind::LitigatorScreen if litigator.is_none() => {
                warn!("No litigator service configured, skipping litigator screen");
                false
            }
            _ => true,
        })
        .collect();
    pipeline = pipeline.with_stages(stages);
    info!("Pipeline stages: {:?}", pipeline.stages);

    let mut orchestrator = PipelineOrchestrator::new(pipeline, source)
        .with_denylist(denylist)
        .with_sink(sink);
    if let Some(enricher) = enricher {
        orchestrator = orchestrator.with_enricher(enricher);
    }
    if let Some(litigator) = litigator {
        orchestrator = orchestrator.with_litigator_screen(litigator);
    }
    Ok(orchestrator)
}
