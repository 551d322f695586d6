use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::batch::StageConcurrency;
use crate::denylist::DEFAULT_CHUNK_SIZE;
use crate::lookup::HttpLookupConfig;
use crate::pipeline::{PipelineConfig, StageKind};
use crate::resilience::DependencyConfig;
use crate::source::QuerySpec;

use super::ConfigError;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Concurrency profile per stage name (`enrich`, `litigator_screen`, ...).
    #[serde(default)]
    pub stages: HashMap<String, StageConcurrency>,
    /// Breaker and retry settings per dependency name.
    #[serde(default)]
    pub dependencies: HashMap<String, DependencyConfig>,
    #[serde(default)]
    pub denylist: DenylistConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<HttpLookupConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub litigator: Option<HttpLookupConfig>,
}

impl Config {
    /// Pipeline settings with the per-stage and per-dependency sections
    /// folded in.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut pipeline = self.pipeline.clone();
        for (name, profile) in &self.stages {
            let stage: StageKind = name
                .parse()
                .map_err(|e: String| ConfigError::ValidationError(format!("stages.{}: {}", name, e)))?;
            pipeline = pipeline.with_stage_concurrency(stage, profile.clone());
        }
        for (name, dependency) in &self.dependencies {
            pipeline = pipeline.with_dependency(name.clone(), dependency.clone());
        }
        Ok(pipeline)
    }

    /// The job request described by `[source]`.
    pub fn query_spec(&self) -> QuerySpec {
        QuerySpec::new(self.source.table.clone()).with_limit(self.source.limit)
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Results database (`lead_results`). Also the default for the source
    /// and denylist databases.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("leadflow.db")
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics export configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Prometheus text file written when a job ends, for a node exporter
    /// textfile collector. When unset the metrics are logged at debug level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub textfile: Option<PathBuf>,
}

/// Denylist store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DenylistConfig {
    /// Numbers per lookup query.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Denylist database (defaults to `database.path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for DenylistConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            path: None,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// Source store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Source database (defaults to `database.path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Table holding the leads.
    #[serde(default = "default_table")]
    pub table: String,
    /// Maximum rows per job (None = all).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            table: default_table(),
            limit: None,
        }
    }
}

fn default_table() -> String {
    "leads".to_string()
}

/// Sanitized config for logging (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub pipeline: PipelineConfig,
    pub stages: HashMap<String, StageConcurrency>,
    pub dependencies: HashMap<String, DependencyConfig>,
    pub denylist: DenylistConfig,
    pub source: SourceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<SanitizedLookupConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub litigator: Option<SanitizedLookupConfig>,
}

/// Sanitized HTTP lookup config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedLookupConfig {
    pub url: String,
    pub api_key_configured: bool,
    pub timeout_secs: u64,
}

impl From<&HttpLookupConfig> for SanitizedLookupConfig {
    fn from(config: &HttpLookupConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key_configured: config.api_key.as_ref().is_some_and(|k| !k.is_empty()),
            timeout_secs: config.timeout_secs,
        }
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            database: config.database.clone(),
            logging: config.logging.clone(),
            metrics: config.metrics.clone(),
            pipeline: config.pipeline.clone(),
            stages: config.stages.clone(),
            dependencies: config.dependencies.clone(),
            denylist: config.denylist.clone(),
            source: config.source.clone(),
            enrichment: config.enrichment.as_ref().map(SanitizedLookupConfig::from),
            litigator: config.litigator.as_ref().map(SanitizedLookupConfig::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.database.path, PathBuf::from("leadflow.db"));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.denylist.chunk_size, 900);
        assert_eq!(config.source.table, "leads");
        assert!(config.enrichment.is_none());
        assert!(config.metrics.textfile.is_none());
        assert_eq!(config.pipeline.stages.len(), 4);
    }

    #[test]
    fn test_deserialize_full_config() {
        let toml = r#"
[database]
path = "/var/lib/leadflow/results.db"

[logging]
level = "debug"
json = true

[metrics]
textfile = "/var/lib/node_exporter/leadflow.prom"

[pipeline]
stages = ["enrich", "dnc_screen", "persist"]
sub_batch_size = 500
weighted_progress = true

[stages.enrich]
max_workers = 4
batch_size = 25
weight = 3.0

[dependencies.enrichment]
failure_threshold = 2
max_retries = 1

[denylist]
chunk_size = 500

[source]
table = "raw_leads"
limit = 10000

[enrichment]
url = "https://enrich.example.com/v1/lookup"
api_key = "secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.logging.json);
        assert_eq!(
            config.metrics.textfile,
            Some(PathBuf::from("/var/lib/node_exporter/leadflow.prom"))
        );
        assert_eq!(config.pipeline.sub_batch_size, 500);
        assert_eq!(config.stages["enrich"].max_workers, 4);
        assert_eq!(config.dependencies["enrichment"].failure_threshold, 2);
        assert_eq!(config.source.limit, Some(10_000));

        let pipeline = config.pipeline_config().unwrap();
        assert_eq!(pipeline.stage_concurrency(StageKind::Enrich).batch_size, 25);
        assert_eq!(pipeline.stage_weight(StageKind::Enrich), 3.0);
        assert_eq!(pipeline.dependency("enrichment").max_retries, 1);
        assert_eq!(pipeline.dependency("litigator").max_retries, 3);

        let query = config.query_spec();
        assert_eq!(query.table, "raw_leads");
        assert_eq!(query.limit, Some(10_000));
    }

    #[test]
    fn test_unknown_stage_section_rejected() {
        let toml = r#"
[stages.fetch]
max_workers = 2
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(
            config.pipeline_config(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_sanitized_config_hides_api_key() {
        let toml = r#"
[litigator]
url = "https://lit.example.com/check"
api_key = "top-secret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let sanitized = SanitizedConfig::from(&config);
        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("top-secret"));
        assert!(json.contains("\"api_key_configured\":true"));
        assert!(sanitized.enrichment.is_none());
    }
}
