//! Mock enrichment and litigator services for testing.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::lookup::{Enricher, Enrichment, LitigatorScreen, LitigatorVerdict};
use crate::record::Record;
use crate::resilience::DependencyError;

/// Behaviour shared by the lookup mocks. Clones share the counters.
#[derive(Debug, Clone, Default)]
struct MockBehavior {
    /// Rows that always fail with `row_error`.
    failing_rows: HashSet<usize>,
    row_error: Option<DependencyError>,
    delay: Duration,
    /// While set, every call fails with a 503.
    unavailable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl MockBehavior {
    async fn before_call(&self, record: &Record) -> Result<(), DependencyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DependencyError::Server {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        if self.failing_rows.contains(&record.row_index) {
            return Err(self.row_error.clone().unwrap_or(DependencyError::Rejected {
                status: 422,
                message: format!("cannot process row {}", record.row_index),
            }));
        }
        Ok(())
    }
}

/// Mock implementation of the Enricher trait.
///
/// Adds `enriched = true` and a synthetic `email_1` to every record.
///
/// # Example
///
/// ```rust,ignore
/// use leadflow_core::testing::MockEnricher;
///
/// let enricher = MockEnricher::new().with_failing_rows([3, 7]);
/// ```
#[derive(Debug, Clone)]
pub struct MockEnricher {
    name: String,
    behavior: MockBehavior,
}

impl Default for MockEnricher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEnricher {
    pub fn new() -> Self {
        Self {
            name: "enrichment".to_string(),
            behavior: MockBehavior::default(),
        }
    }

    /// Rows that fail permanently (422).
    pub fn with_failing_rows(mut self, rows: impl IntoIterator<Item = usize>) -> Self {
        self.behavior.failing_rows.extend(rows);
        self
    }

    /// Error returned for failing rows.
    pub fn with_row_error(mut self, error: DependencyError) -> Self {
        self.behavior.row_error = Some(error);
        self
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.behavior.delay = delay;
        self
    }

    /// Toggle a full outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.behavior.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of enrich calls made, including failed ones.
    pub fn call_count(&self) -> usize {
        self.behavior.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for MockEnricher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enrich(&self, record: &Record) -> Result<Enrichment, DependencyError> {
        self.behavior.before_call(record).await?;
        let mut fields = Map::new();
        fields.insert("enriched".to_string(), Value::Bool(true));
        fields.insert(
            "email_1".to_string(),
            Value::String(format!("lead{}@example.com", record.row_index)),
        );
        Ok(Enrichment::new(fields))
    }
}

/// Mock implementation of the LitigatorScreen trait.
///
/// Flags records whose normalized phones are in the configured set.
#[derive(Debug, Clone)]
pub struct MockLitigatorScreen {
    name: String,
    litigators: Arc<HashSet<String>>,
    behavior: MockBehavior,
}

impl Default for MockLitigatorScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLitigatorScreen {
    pub fn new() -> Self {
        Self {
            name: "litigator".to_string(),
            litigators: Arc::new(HashSet::new()),
            behavior: MockBehavior::default(),
        }
    }

    /// Phones (normalized) belonging to known litigators.
    pub fn with_litigators<I, S>(mut self, phones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = (*self.litigators).clone();
        set.extend(phones.into_iter().map(Into::into));
        self.litigators = Arc::new(set);
        self
    }

    /// Rows that fail permanently (422).
    pub fn with_failing_rows(mut self, rows: impl IntoIterator<Item = usize>) -> Self {
        self.behavior.failing_rows.extend(rows);
        self
    }

    /// Error returned for failing rows.
    pub fn with_row_error(mut self, error: DependencyError) -> Self {
        self.behavior.row_error = Some(error);
        self
    }

    /// Simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.behavior.delay = delay;
        self
    }

    /// Toggle a full outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.behavior.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of check calls made, including failed ones.
    pub fn call_count(&self) -> usize {
        self.behavior.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LitigatorScreen for MockLitigatorScreen {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, record: &Record) -> Result<LitigatorVerdict, DependencyError> {
        self.behavior.before_call(record).await?;
        let hit = record
            .phones()
            .iter()
            .any(|(_, phone)| self.litigators.contains(phone));
        Ok(if hit {
            LitigatorVerdict::litigator()
        } else {
            LitigatorVerdict::clean()
        })
    }
}
