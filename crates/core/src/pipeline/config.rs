//! Pipeline configuration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::batch::{BatchConfig, StageConcurrency};
use crate::resilience::DependencyConfig;

/// A post-fetch pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Enrich,
    LitigatorScreen,
    DncScreen,
    Persist,
}

impl StageKind {
    /// Every stage in its canonical order.
    pub const ALL: [StageKind; 4] = [
        StageKind::Enrich,
        StageKind::LitigatorScreen,
        StageKind::DncScreen,
        StageKind::Persist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Enrich => "enrich",
            StageKind::LitigatorScreen => "litigator_screen",
            StageKind::DncScreen => "dnc_screen",
            StageKind::Persist => "persist",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Breaker/retry key of the denylist store.
pub const DNC_DEPENDENCY: &str = "dnc";

/// Configuration for the pipeline orchestrator.
///
/// The `[pipeline]` section deserializes straight into this; per-stage
/// concurrency and per-dependency resilience settings come from their own
/// sections and are attached with the `with_*` setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Post-fetch stages, in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageKind>,

    /// Records per job-level sub-batch. Every stage finishes a sub-batch
    /// before the next stage starts on it.
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,

    /// Fail the job when a stage's error rate within one sub-batch exceeds
    /// this fraction. Unset means partial failure never fails a job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_stage_error_rate: Option<f64>,

    /// Weight progress by each stage's `weight` instead of equal slices.
    #[serde(default)]
    pub weighted_progress: bool,

    /// Batch processor settings.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Per-stage concurrency profiles (defaults for missing stages).
    #[serde(skip)]
    pub concurrency: HashMap<StageKind, StageConcurrency>,

    /// Per-dependency breaker and retry settings, keyed by dependency name.
    #[serde(skip)]
    pub dependencies: HashMap<String, DependencyConfig>,
}

fn default_stages() -> Vec<StageKind> {
    StageKind::ALL.to_vec()
}

fn default_sub_batch_size() -> usize {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
            sub_batch_size: default_sub_batch_size(),
            max_stage_error_rate: None,
            weighted_progress: false,
            batch: BatchConfig::default(),
            concurrency: HashMap::new(),
            dependencies: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Concurrency profile for `stage`.
    pub fn stage_concurrency(&self, stage: StageKind) -> StageConcurrency {
        self.concurrency.get(&stage).cloned().unwrap_or_default()
    }

    /// Resilience settings for `dependency`.
    pub fn dependency(&self, dependency: &str) -> DependencyConfig {
        self.dependencies
            .get(dependency)
            .cloned()
            .unwrap_or_default()
    }

    /// Progress weight of `stage`.
    pub fn stage_weight(&self, stage: StageKind) -> f64 {
        if self.weighted_progress {
            let weight = self.stage_concurrency(stage).weight;
            if weight.is_finite() && weight > 0.0 {
                weight
            } else {
                0.0
            }
        } else {
            1.0
        }
    }

    /// Check the stage list: each stage at most once, and `persist`, when
    /// present, last.
    pub fn check_stages(&self) -> Result<(), String> {
        for (i, stage) in self.stages.iter().enumerate() {
            if self.stages[..i].contains(stage) {
                return Err(format!("stage '{}' is listed more than once", stage));
            }
        }
        if let Some(position) = self.stages.iter().position(|s| *s == StageKind::Persist) {
            if position + 1 != self.stages.len() {
                return Err(format!(
                    "stage '{}' must be last, found before '{}'",
                    StageKind::Persist,
                    self.stages[position + 1]
                ));
            }
        }
        Ok(())
    }

    pub fn with_stages(mut self, stages: Vec<StageKind>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_sub_batch_size(mut self, sub_batch_size: usize) -> Self {
        self.sub_batch_size = sub_batch_size;
        self
    }

    pub fn with_max_stage_error_rate(mut self, rate: Option<f64>) -> Self {
        self.max_stage_error_rate = rate;
        self
    }

    pub fn with_weighted_progress(mut self, weighted: bool) -> Self {
        self.weighted_progress = weighted;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_stage_concurrency(mut self, stage: StageKind, profile: StageConcurrency) -> Self {
        self.concurrency.insert(stage, profile);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>, config: DependencyConfig) -> Self {
        self.dependencies.insert(name.into(), config);
        self
    }
}
