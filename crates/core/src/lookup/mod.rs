//! Per-record lookups against third-party APIs.
//!
//! Two collaborator traits, one per external dependency:
//! - `Enricher` appends contact data to a record.
//! - `LitigatorScreen` reports whether a lead is a known litigator.
//!
//! Both report failures as `DependencyError` so the orchestrator can route
//! every call through a `RetryExecutor`.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::record::Record;
use crate::resilience::DependencyError;

pub use http::{classify_status, HttpEnricher, HttpLitigatorScreen, HttpLookupConfig};

/// Fields returned by an enrichment lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub fields: Map<String, Value>,
}

impl Enrichment {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Result of a litigator screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LitigatorVerdict {
    pub is_litigator: bool,
    /// Extra match information returned by the service.
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl LitigatorVerdict {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn litigator() -> Self {
        Self {
            is_litigator: true,
            details: Map::new(),
        }
    }
}

/// Contact-data enrichment service.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Dependency name used for the breaker and metrics.
    fn name(&self) -> &str;

    /// Look up additional fields for `record`.
    async fn enrich(&self, record: &Record) -> Result<Enrichment, DependencyError>;
}

/// Litigation screening service.
#[async_trait]
pub trait LitigatorScreen: Send + Sync {
    /// Dependency name used for the breaker and metrics.
    fn name(&self) -> &str;

    /// Screen `record`.
    async fn check(&self, record: &Record) -> Result<LitigatorVerdict, DependencyError>;
}
