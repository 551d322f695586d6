//! Retry with exponential backoff, guarded by a circuit breaker.

use std::future::Future;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use super::circuit_breaker::{Admission, CircuitBreaker};
use super::config::RetryPolicy;
use super::error::{CallError, DependencyError};
use crate::metrics;

/// Reports the outcome of one admitted attempt to the breaker.
///
/// Dropped unresolved when the attempt panics or the calling future is
/// cancelled; the breaker is then told the attempt was abandoned.
struct AttemptGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl<'a> AttemptGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            admission: Some(admission),
        }
    }

    fn success(mut self) {
        if self.admission.take().is_some() {
            self.breaker.record_success();
        }
    }

    fn failure(mut self) {
        if self.admission.take().is_some() {
            self.breaker.record_failure();
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.abandon(admission);
        }
    }
}

/// Runs calls to one dependency with retries and breaker protection.
///
/// Every attempt asks the breaker first and reports its outcome back. An
/// open breaker fails the call immediately without touching the dependency.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { policy, breaker }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation`, retrying errors for which `DependencyError::is_retryable`
    /// returns true.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
    {
        self.execute_with(operation, DependencyError::is_retryable)
            .await
    }

    /// Run `operation` with a custom transient/permanent classifier.
    ///
    /// Attempts are bounded by `max_retries + 1`. Each attempt is bounded by
    /// the policy's request timeout. Permanent errors return immediately and
    /// do not count against the breaker: the dependency did answer.
    pub async fn execute_with<T, F, Fut, C>(
        &self,
        mut operation: F,
        is_retryable: C,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DependencyError>>,
        C: Fn(&DependencyError) -> bool,
    {
        let dependency = self.breaker.name();
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            let guard = match self.breaker.check() {
                Ok(admission) => AttemptGuard::new(&self.breaker, admission),
                Err(open) => {
                    metrics::EXTERNAL_CALLS
                        .with_label_values(&[dependency, "circuit_open"])
                        .inc();
                    debug!(dependency, attempt, "Call rejected by open circuit");
                    return Err(CallError::CircuitOpen(open));
                }
            };
            attempt += 1;

            let result = match tokio::time::timeout(self.policy.request_timeout, operation()).await
            {
                Ok(result) => result,
                Err(_) => Err(DependencyError::Timeout(self.policy.request_timeout)),
            };

            let error = match result {
                Ok(value) => {
                    guard.success();
                    metrics::EXTERNAL_CALLS
                        .with_label_values(&[dependency, "success"])
                        .inc();
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                // Releases a half-open trial without reopening the circuit.
                guard.success();
                metrics::EXTERNAL_CALLS
                    .with_label_values(&[dependency, "permanent"])
                    .inc();
                debug!(dependency, attempt, error = %error, "Permanent failure, not retrying");
                return Err(CallError::Permanent {
                    dependency: dependency.to_string(),
                    source: error,
                });
            }

            guard.failure();
            metrics::EXTERNAL_CALLS
                .with_label_values(&[dependency, error.kind()])
                .inc();

            if attempt >= max_attempts {
                warn!(
                    dependency,
                    attempts = attempt,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(CallError::RetriesExhausted {
                    dependency: dependency.to_string(),
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.jittered_delay(attempt - 1);
            metrics::RETRY_ATTEMPTS.with_label_values(&[dependency]).inc();
            debug!(
                dependency,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn jittered_delay(&self, attempt: u32) -> std::time::Duration {
        let nominal = self.policy.backoff_delay(attempt);
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        // Never shorter than nominal backoff.
        let factor = rand::thread_rng().gen_range(1.0..=(1.0 + jitter));
        nominal.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::resilience::config::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn policy(max_retries: u32, base_ms: u64, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(1),
            jitter,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn executor(policy: RetryPolicy, threshold: u32) -> RetryExecutor {
        let breaker = Arc::new(CircuitBreaker::new(
            "test-dep",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
            },
        ));
        RetryExecutor::new(policy, breaker)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let exec = executor(policy(3, 10, 0.0), 10);
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let result = exec
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DependencyError::Connection("refused".into()))
                    } else {
                        Ok("enriched")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "enriched");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 10ms + 20ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(exec.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let exec = executor(policy(2, 1, 0.2), 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DependencyError::Server {
                        status: 503,
                        message: "unavailable".into(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(CallError::RetriesExhausted {
                dependency,
                attempts,
                ..
            }) => {
                assert_eq!(dependency, "test-dep");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(exec.breaker().failure_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let exec = executor(policy(5, 1, 0.0), 1);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(DependencyError::Rejected {
                        status: 400,
                        message: "bad phone".into(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(CallError::Permanent { .. })));
        // Threshold of one would have tripped on a counted failure
        assert_eq!(exec.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let exec = executor(policy(3, 1, 0.0), 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = exec
            .execute_with(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(DependencyError::Transient("flaky".into())) }
                },
                |_| false,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(CallError::Permanent { .. })));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let exec = executor(policy(3, 1, 0.0), 2);
        exec.breaker().record_failure();
        exec.breaker().record_failure();
        assert_eq!(exec.breaker().state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_breaker_opens_mid_retry() {
        // Threshold 2 trips during the retry loop; the third attempt is
        // rejected by the breaker instead of hitting the dependency.
        let exec = executor(policy(5, 1, 0.0), 2);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DependencyError::Connection("reset".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let mut p = policy(1, 1, 0.0);
        p.request_timeout = Duration::from_millis(20);
        let exec = executor(p, 10);
        let calls = AtomicU32::new(0);

        let result: Result<(), CallError> = exec
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result {
            Err(CallError::RetriesExhausted { source, .. }) => {
                assert_eq!(source, DependencyError::Timeout(Duration::from_millis(20)));
            }
            other => panic!("Expected RetriesExhausted, got {:?}", other),
        }
    }

    #[test]
    fn test_jitter_never_shortens_backoff() {
        let exec = executor(policy(5, 100, 0.5), 10);
        for attempt in 0..4 {
            let (low, high) = exec.policy().jitter_bounds(attempt);
            for _ in 0..200 {
                let delay = exec.jittered_delay(attempt);
                assert!(delay >= low, "{:?} below nominal {:?}", delay, low);
                assert!(delay <= high, "{:?} above {:?}", delay, high);
            }
        }
    }

    #[tokio::test]
    async fn test_jittered_retries_wait_at_least_nominal() {
        let exec = executor(policy(3, 10, 0.9), 10);
        let calls = AtomicU32::new(0);

        let started = Instant::now();
        let result = exec
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(DependencyError::Connection("refused".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    fn half_open_executor() -> (RetryExecutor, Arc<CircuitBreaker>) {
        let breaker = Arc::new(CircuitBreaker::new(
            "test-dep",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(30),
            },
        ));
        breaker.record_failure();
        let exec = RetryExecutor::new(policy(0, 1, 0.0), Arc::clone(&breaker));
        (exec, breaker)
    }

    #[tokio::test]
    async fn test_panicking_trial_reopens_breaker() {
        let (exec, breaker) = half_open_executor();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let trial = exec.clone();
        let handle = tokio::spawn(async move {
            trial
                .execute(|| async {
                    let crash = true;
                    if crash {
                        panic!("lookup client crashed");
                    }
                    Ok::<(), DependencyError>(())
                })
                .await
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = exec.execute(|| async { Ok::<_, DependencyError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_reopens_breaker() {
        let (exec, breaker) = half_open_executor();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let dropped = tokio::time::timeout(
            Duration::from_millis(20),
            exec.execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), DependencyError>(())
            }),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = exec.execute(|| async { Ok::<_, DependencyError>("ok") }).await;
        assert_eq!(result.unwrap(), "ok");
    }
}
