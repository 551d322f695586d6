use super::{types::Config, ConfigError};
use crate::batch::StageConcurrency;
use crate::resilience::DependencyConfig;

/// SQLite's default limit on bound parameters per statement.
const SQLITE_MAX_PARAMS: usize = 999;

fn invalid(message: String) -> ConfigError {
    ConfigError::ValidationError(message)
}

/// Validate configuration
/// Currently validates:
/// - Pipeline stages are unique, with `persist` last
/// - Stage concurrency profiles (worker bounds, batch size, weight)
/// - Dependency breaker/retry settings
/// - Pipeline sub-batch size and error-rate thresholds
/// - Denylist chunk size against SQLite's parameter ceiling
/// - Source table and lookup endpoints are non-empty
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Resolves stage names as a side effect
    config
        .pipeline_config()?
        .check_stages()
        .map_err(|e| invalid(format!("pipeline.stages: {}", e)))?;

    for (name, stage) in &config.stages {
        validate_stage(name, stage)?;
    }
    for (name, dependency) in &config.dependencies {
        validate_dependency(name, dependency)?;
    }

    let pipeline = &config.pipeline;
    if pipeline.sub_batch_size == 0 {
        return Err(invalid("pipeline.sub_batch_size cannot be 0".to_string()));
    }
    if pipeline.batch.chunk_size == Some(0) {
        return Err(invalid("pipeline.batch.chunk_size cannot be 0".to_string()));
    }
    check_fraction(
        "pipeline.batch.error_rate_threshold",
        pipeline.batch.error_rate_threshold,
    )?;
    if let Some(rate) = pipeline.max_stage_error_rate {
        check_fraction("pipeline.max_stage_error_rate", rate)?;
    }

    let chunk = config.denylist.chunk_size;
    if chunk == 0 || chunk > SQLITE_MAX_PARAMS {
        return Err(invalid(format!(
            "denylist.chunk_size must be between 1 and {}, got {}",
            SQLITE_MAX_PARAMS, chunk
        )));
    }

    if config.source.table.trim().is_empty() {
        return Err(invalid("source.table cannot be empty".to_string()));
    }
    for (name, lookup) in [("enrichment", &config.enrichment), ("litigator", &config.litigator)] {
        if let Some(lookup) = lookup {
            if lookup.url.trim().is_empty() {
                return Err(invalid(format!("{}.url cannot be empty", name)));
            }
        }
    }

    Ok(())
}

fn validate_stage(name: &str, stage: &StageConcurrency) -> Result<(), ConfigError> {
    if stage.min_workers == 0 {
        return Err(invalid(format!("stages.{}.min_workers cannot be 0", name)));
    }
    if stage.min_workers > stage.max_workers {
        return Err(invalid(format!(
            "stages.{}: min_workers ({}) exceeds max_workers ({})",
            name, stage.min_workers, stage.max_workers
        )));
    }
    if !(stage.workers_per_batch.is_finite() && stage.workers_per_batch > 0.0) {
        return Err(invalid(format!(
            "stages.{}.workers_per_batch must be positive",
            name
        )));
    }
    if stage.batch_size == 0 {
        return Err(invalid(format!("stages.{}.batch_size cannot be 0", name)));
    }
    if !(stage.weight.is_finite() && stage.weight >= 0.0) {
        return Err(invalid(format!("stages.{}.weight cannot be negative", name)));
    }
    Ok(())
}

fn validate_dependency(name: &str, dependency: &DependencyConfig) -> Result<(), ConfigError> {
    if dependency.failure_threshold == 0 {
        return Err(invalid(format!(
            "dependencies.{}.failure_threshold cannot be 0",
            name
        )));
    }
    if dependency.retry_base_delay_ms > dependency.retry_max_delay_ms {
        return Err(invalid(format!(
            "dependencies.{}: retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
            name, dependency.retry_base_delay_ms, dependency.retry_max_delay_ms
        )));
    }
    if !(0.0..1.0).contains(&dependency.jitter) {
        return Err(invalid(format!(
            "dependencies.{}.jitter must be in [0, 1), got {}",
            name, dependency.jitter
        )));
    }
    if dependency.request_timeout_ms == 0 {
        return Err(invalid(format!(
            "dependencies.{}.request_timeout_ms cannot be 0",
            name
        )));
    }
    Ok(())
}

fn check_fraction(field: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{} must be in [0, 1], got {}", field, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn assert_invalid(toml: &str) {
        let config = load_config_from_str(toml).unwrap();
        let result = validate_config(&config);
        assert!(
            matches!(result, Err(ConfigError::ValidationError(_))),
            "expected validation error for:\n{}",
            toml
        );
    }

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_stage_profiles() {
        assert_invalid("[stages.enrich]\nmin_workers = 0");
        assert_invalid("[stages.enrich]\nmin_workers = 5\nmax_workers = 2");
        assert_invalid("[stages.persist]\nworkers_per_batch = 0.0");
        assert_invalid("[stages.persist]\nworkers_per_batch = -1.0");
        assert_invalid("[stages.dnc_screen]\nbatch_size = 0");
        assert_invalid("[stages.bogus]\nmax_workers = 2");
    }

    #[test]
    fn test_validate_dependencies() {
        assert_invalid("[dependencies.enrichment]\nfailure_threshold = 0");
        assert_invalid(
            "[dependencies.enrichment]\nretry_base_delay_ms = 5000\nretry_max_delay_ms = 100",
        );
        assert_invalid("[dependencies.litigator]\njitter = 1.0");
        assert_invalid("[dependencies.litigator]\njitter = -0.1");
    }

    #[test]
    fn test_validate_pipeline_and_denylist() {
        assert_invalid("[pipeline]\nsub_batch_size = 0");
        assert_invalid("[pipeline]\nmax_stage_error_rate = 1.5");
        assert_invalid("[pipeline.batch]\nchunk_size = 0");
        assert_invalid("[pipeline.batch]\nerror_rate_threshold = -0.5");
        assert_invalid("[denylist]\nchunk_size = 0");
        assert_invalid("[denylist]\nchunk_size = 1000");
        assert_invalid("[source]\ntable = \"\"");
        assert_invalid("[enrichment]\nurl = \"\"");
    }

    #[test]
    fn test_validate_stage_order() {
        assert_invalid("[pipeline]\nstages = [\"enrich\", \"enrich\"]");
        assert_invalid("[pipeline]\nstages = [\"persist\", \"dnc_screen\"]");
        assert_invalid("[pipeline]\nstages = [\"enrich\", \"persist\", \"persist\"]");

        let config =
            load_config_from_str("[pipeline]\nstages = [\"dnc_screen\", \"persist\"]").unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_accepts_edges() {
        let config = load_config_from_str(
            r#"
[pipeline]
max_stage_error_rate = 1.0

[denylist]
chunk_size = 999

[dependencies.dnc]
jitter = 0.0
retry_base_delay_ms = 100
retry_max_delay_ms = 100

[stages.enrich]
min_workers = 3
max_workers = 3
"#,
        )
        .unwrap();
        assert!(validate_config(&config).is_ok());
    }
}
