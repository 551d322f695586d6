//! Three-state circuit breaker, one per external dependency.
//!
//! ```text
//!   CLOSED --(failures >= threshold)--> OPEN
//!   OPEN   --(cooldown elapsed, next check)--> HALF_OPEN (one trial call)
//!   HALF_OPEN --success--> CLOSED
//!   HALF_OPEN --failure--> OPEN
//! ```
//!
//! Any success while closed resets the failure count, so only an unbroken
//! run of failures trips the breaker.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::BreakerConfig;
use super::error::CircuitOpen;
use crate::metrics;

/// How a call was let through by `CircuitBreaker::check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed.
    Normal,
    /// The single half-open trial. Must be resolved with `record_success`,
    /// `record_failure` or `abandon`, otherwise the breaker stays half-open
    /// and rejects every later call.
    Trial,
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    /// Set while the single half-open trial call is outstanding.
    trial_in_flight: bool,
}

/// Circuit breaker guarding one dependency.
///
/// All state lives behind a single mutex; `check`, `record_success`,
/// `record_failure` and `abandon` are the only mutators. Cheap to share via
/// `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker settings.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. Does not advance OPEN to HALF_OPEN; only `check` does.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures counted since the last reset.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Ask permission to make a call.
    ///
    /// Returns `Err(CircuitOpen)` while open and cooling down, and while a
    /// half-open trial call is already in flight.
    pub fn check(&self) -> Result<Admission, CircuitOpen> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                } else {
                    Err(CircuitOpen {
                        dependency: self.name.clone(),
                        retry_after: Some(self.config.recovery_timeout - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitOpen {
                        dependency: self.name.clone(),
                        retry_after: None,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // A call admitted before the breaker tripped finished late.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure_time = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.last_failure_time = Some(Instant::now());
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
        }
    }

    /// Release a call that ended without an outcome (panicked or dropped).
    ///
    /// An abandoned trial counts as a failed trial: the breaker reopens and
    /// the next check after cooldown admits a fresh trial. Abandoning a
    /// normal call changes nothing.
    pub fn abandon(&self, admission: Admission) {
        if admission != Admission::Trial {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            warn!(dependency = %self.name, "Half-open trial abandoned");
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure_time = Some(Instant::now());
            inner.trial_in_flight = false;
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => warn!(
                dependency = %self.name,
                from = %from,
                failures = inner.failure_count,
                "Circuit breaker opened"
            ),
            _ => info!(
                dependency = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            ),
        }
        metrics::BREAKER_TRANSITIONS
            .with_label_values(&[self.name.as_str(), to.as_str()])
            .inc();
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Owns exactly one breaker per dependency name.
///
/// Constructed explicitly and passed around; there is no process-wide
/// instance, so independent registries never share state.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker for `name`, creating it with `config` on first use.
    ///
    /// Later calls return the existing breaker and ignore `config`.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Get an existing breaker.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers.get(name).cloned()
    }

    /// State of every breaker, sorted by dependency name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let guard = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.values().cloned().collect()
        };
        let mut snapshot: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|b| {
                let inner = b.lock();
                BreakerSnapshot {
                    dependency: b.name.clone(),
                    state: inner.state,
                    failure_count: inner.failure_count,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-api",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = breaker(3, 1_000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.check().unwrap_err();
        assert_eq!(err.dependency, "test-api");
        assert!(err.retry_after.is_some());
    }

    #[test]
    fn test_success_while_closed_resets_count() {
        // Reset-on-any-success: two failures, one success, two failures
        // never reaches a threshold of three.
        let cb = breaker(3, 60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 2);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let cb = breaker(1, 30);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());

        thread::sleep(Duration::from_millis(40));
        // state() alone does not advance the breaker
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let cb = breaker(1, 10);
        cb.record_failure();
        thread::sleep(Duration::from_millis(20));

        assert!(cb.check().is_ok());
        let second = cb.check().unwrap_err();
        assert!(second.retry_after.is_none());
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = breaker(2, 10);
        cb.record_failure();
        cb.record_failure();
        thread::sleep(Duration::from_millis(20));
        cb.check().unwrap();

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 30);
        cb.record_failure();
        thread::sleep(Duration::from_millis(40));
        cb.check().unwrap();

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        // Cooldown restarted from the trial failure
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_abandoned_trial_reopens_then_admits_new_trial() {
        let cb = breaker(1, 30);
        cb.record_failure();
        thread::sleep(Duration::from_millis(40));
        let admission = cb.check().unwrap();
        assert_eq!(admission, Admission::Trial);

        cb.abandon(admission);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());

        thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.check().unwrap(), Admission::Trial);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_abandoning_normal_call_is_noop() {
        let cb = breaker(1, 60_000);
        let admission = cb.check().unwrap();
        assert_eq!(admission, Admission::Normal);
        cb.abandon(admission);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_late_success_while_open_is_ignored() {
        let cb = breaker(1, 60_000);
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_concurrent_failures_trip_once() {
        let cb = Arc::new(breaker(50, 60_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = Arc::clone(&cb);
                thread::spawn(move || {
                    for _ in 0..10 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 80);
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("enrichment", BreakerConfig::default());
        let b = registry.get_or_create(
            "enrichment",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(1),
            },
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 5);
        assert!(registry.get("litigator").is_none());
    }

    #[test]
    fn test_registries_are_independent() {
        let first = CircuitBreakerRegistry::new();
        let second = CircuitBreakerRegistry::new();
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        first.get_or_create("dnc", config).record_failure();

        assert_eq!(first.get_or_create("dnc", config).state(), CircuitState::Open);
        assert_eq!(second.get_or_create("dnc", config).state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_snapshot_sorted() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("source", BreakerConfig::default());
        registry
            .get_or_create("enrichment", BreakerConfig::default())
            .record_failure();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].dependency, "enrichment");
        assert_eq!(snapshot[0].failure_count, 1);
        assert_eq!(snapshot[1].dependency, "source");
        assert_eq!(snapshot[1].state, CircuitState::Closed);
    }
}
