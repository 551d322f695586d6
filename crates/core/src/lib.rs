pub mod batch;
pub mod config;
pub mod denylist;
pub mod lookup;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod resilience;
pub mod sink;
pub mod source;
pub mod testing;

pub use batch::{BatchConfig, BatchOutcome, BatchProcessor, StageConcurrency};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use denylist::{normalize_phone, DenylistError, DenylistStore, SqliteDenylist};
pub use lookup::{
    Enricher, Enrichment, HttpEnricher, HttpLitigatorScreen, HttpLookupConfig, LitigatorScreen,
    LitigatorVerdict,
};
pub use pipeline::{
    ChannelProgressSink, Job, JobSpec, JobStats, JobStatus, PipelineConfig, PipelineError,
    PipelineOrchestrator, ProgressEvent, ProgressSink, StageKind, TracingProgressSink,
};
pub use record::{Compliance, Record};
pub use resilience::{
    CallError, CircuitBreaker, CircuitBreakerRegistry, CircuitState, DependencyConfig,
    DependencyError, RetryExecutor,
};
pub use sink::{RecordSink, SinkError, SqliteRecordSink};
pub use source::{QuerySpec, SourceError, SourceStore, SqliteSourceStore};
