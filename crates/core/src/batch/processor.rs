//! Bounded fan-out/fan-in executor.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::BatchConfig;

/// Per-item failure captured by the batch processor.
#[derive(Debug, thiserror::Error)]
pub enum ItemError<E> {
    /// The operation returned an error for this item.
    #[error("{0}")]
    Failed(E),

    /// The operation panicked while processing this item.
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl<E> ItemError<E> {
    /// The operation's error, if the item failed normally.
    pub fn as_failed(&self) -> Option<&E> {
        match self {
            ItemError::Failed(e) => Some(e),
            ItemError::Panicked(_) => None,
        }
    }
}

/// Batch-level warning raised when a sub-batch's error rate crosses the
/// configured threshold, or when every item in it failed.
///
/// Reported to the caller alongside the per-item errors; it never halts
/// processing on its own.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("sub-batch {chunk_index}: {failed}/{total} items failed")]
pub struct BatchPartialFailure {
    /// Index of the sub-batch within the call.
    pub chunk_index: usize,
    /// Items in the sub-batch.
    pub total: usize,
    /// Items that failed.
    pub failed: usize,
}

impl BatchPartialFailure {
    /// Fraction of the sub-batch that failed.
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Result of a `BatchProcessor::process` call.
#[derive(Debug)]
pub struct BatchOutcome<R, E> {
    /// One entry per processed item, in input order. When the call was
    /// cancelled these cover a prefix of the input.
    pub results: Vec<Result<R, ItemError<E>>>,
    /// Items never started because cancellation was observed.
    pub skipped: usize,
    /// Number of failed entries in `results`.
    pub error_count: usize,
    /// Sub-batches that crossed the warning threshold.
    pub warnings: Vec<BatchPartialFailure>,
    /// Whether cancellation stopped the call before all items ran.
    pub cancelled: bool,
}

impl<R, E> BatchOutcome<R, E> {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            skipped: 0,
            error_count: 0,
            warnings: Vec::new(),
            cancelled: false,
        }
    }

    /// Number of items that ran (successfully or not).
    pub fn processed(&self) -> usize {
        self.results.len()
    }

    /// Number of items that succeeded.
    pub fn success_count(&self) -> usize {
        self.results.len() - self.error_count
    }

    /// Fraction of processed items that failed.
    pub fn error_rate(&self) -> f64 {
        if self.results.is_empty() {
            0.0
        } else {
            self.error_count as f64 / self.results.len() as f64
        }
    }
}

/// Fans items out across a bounded pool of workers and reassembles the
/// results positionally.
///
/// Large inputs are split into sub-batches of `chunk_size` items which run
/// one after another, each with full worker concurrency. Cancellation is
/// checked before every sub-batch; a sub-batch that has started always
/// runs to completion.
#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    /// Creates a new batch processor.
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Returns the processor configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Runs `operation` over every item with `worker_count` concurrent workers.
    ///
    /// `results[i]` corresponds to `items[i]`. One item's failure never
    /// affects its siblings.
    pub async fn process<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        worker_count: usize,
        cancel: &CancellationToken,
        operation: F,
    ) -> BatchOutcome<R, E>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let mut outcome = BatchOutcome::empty();
        if items.is_empty() {
            return outcome;
        }

        let total = items.len();
        let chunk_size = match self.config.chunk_size {
            Some(size) if size > 0 => size,
            _ => total,
        };
        let operation = Arc::new(operation);
        let mut remaining = items.into_iter();
        let mut chunk_index = 0;

        loop {
            if remaining.len() == 0 {
                break;
            }
            if cancel.is_cancelled() {
                outcome.skipped = remaining.len();
                outcome.cancelled = true;
                debug!(
                    skipped = outcome.skipped,
                    "Cancellation observed, not starting further sub-batches"
                );
                break;
            }

            let chunk: Vec<T> = remaining.by_ref().take(chunk_size).collect();
            let chunk_len = chunk.len();
            let chunk_results = run_chunk(chunk, worker_count, Arc::clone(&operation)).await;

            let failed = chunk_results.iter().filter(|r| r.is_err()).count();
            outcome.error_count += failed;
            if failed > 0
                && (failed == chunk_len
                    || failed as f64 / chunk_len as f64 > self.config.error_rate_threshold)
            {
                let warning = BatchPartialFailure {
                    chunk_index,
                    total: chunk_len,
                    failed,
                };
                warn!(
                    chunk_index,
                    failed,
                    total = chunk_len,
                    "Sub-batch error rate above threshold"
                );
                outcome.warnings.push(warning);
            }

            outcome.results.extend(chunk_results);
            chunk_index += 1;
        }

        debug!(
            total,
            processed = outcome.processed(),
            errors = outcome.error_count,
            "Batch finished"
        );
        outcome
    }
}

/// Runs one sub-batch on `worker_count` workers pulling from a shared queue.
async fn run_chunk<T, R, E, F, Fut>(
    chunk: Vec<T>,
    worker_count: usize,
    operation: Arc<F>,
) -> Vec<Result<R, ItemError<E>>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let len = chunk.len();
    let workers = worker_count.clamp(1, len.max(1));
    let queue = Arc::new(Mutex::new(chunk.into_iter().enumerate()));
    // Capacity equals the item count, so sends never wait on the collector.
    let (tx, mut rx) = mpsc::channel(len.max(1));

    let mut pool = JoinSet::new();
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let operation = Arc::clone(&operation);
        let tx = tx.clone();
        pool.spawn(async move {
            loop {
                let next = {
                    let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                    queue.next()
                };
                let Some((index, item)) = next else {
                    break;
                };
                // A panic is confined to its item; the worker keeps pulling.
                let result = AssertUnwindSafe(async { operation(item).await })
                    .catch_unwind()
                    .await
                    .map_err(|payload| {
                        let message = panic_message(payload.as_ref());
                        warn!(index, "Batch item panicked: {}", message);
                        message
                    });
                if tx.send((index, result)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut slots: Vec<Option<Result<R, ItemError<E>>>> = (0..len).map(|_| None).collect();
    while let Some((index, result)) = rx.recv().await {
        slots[index] = Some(match result {
            Ok(outcome) => outcome.map_err(ItemError::Failed),
            Err(message) => Err(ItemError::Panicked(message)),
        });
    }

    let mut abnormal_exit = None;
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            warn!("Batch worker terminated abnormally: {}", e);
            abnormal_exit.get_or_insert_with(|| e.to_string());
        }
    }

    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                Err(ItemError::Panicked(
                    abnormal_exit
                        .clone()
                        .unwrap_or_else(|| "worker exited without a result".to_string()),
                ))
            })
        })
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn processor(chunk_size: Option<usize>) -> BatchProcessor {
        BatchProcessor::new(BatchConfig::default().with_chunk_size(chunk_size))
    }

    #[tokio::test]
    async fn test_order_preserved_for_any_worker_count() {
        let items: Vec<u64> = (0..40).collect();
        for workers in [1, 2, 7, 40, 100] {
            let outcome: BatchOutcome<u64, String> = processor(None)
                .process(items.clone(), workers, &CancellationToken::new(), |n| async move {
                    // Later items finish first
                    tokio::time::sleep(Duration::from_millis(40 - n)).await;
                    Ok(n * 10)
                })
                .await;

            assert_eq!(outcome.results.len(), items.len());
            for (i, result) in outcome.results.iter().enumerate() {
                assert_eq!(*result.as_ref().unwrap(), i as u64 * 10);
            }
            assert_eq!(outcome.error_count, 0);
            assert!(!outcome.cancelled);
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let outcome = processor(None)
            .process(vec![1, 2, 3, 4, 5], 3, &CancellationToken::new(), |n| async move {
                if n == 3 {
                    Err(format!("bad item {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(outcome.results.len(), 5);
        assert_eq!(outcome.error_count, 1);
        assert_eq!(outcome.success_count(), 4);
        assert_eq!(*outcome.results[1].as_ref().unwrap(), 2);
        assert_eq!(*outcome.results[3].as_ref().unwrap(), 4);
        match &outcome.results[2] {
            Err(ItemError::Failed(msg)) => assert_eq!(msg, "bad item 3"),
            other => panic!("Expected failure, got {:?}", other),
        }
        // 1/5 is below the default 0.5 threshold
        assert!(outcome.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let op_active = Arc::clone(&active);
        let op_peak = Arc::clone(&peak);
        let outcome: BatchOutcome<(), String> = processor(None)
            .process((0..30).collect::<Vec<u32>>(), 4, &CancellationToken::new(), move |_| {
                let active = Arc::clone(&op_active);
                let peak = Arc::clone(&op_peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(outcome.results.len(), 30);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_chunking_keeps_order_and_reports_warnings() {
        // 25 items in chunks of 10: chunk 1 (items 10..20) fails entirely
        let outcome = processor(Some(10))
            .process((0..25).collect::<Vec<u32>>(), 4, &CancellationToken::new(), |n| async move {
                if (10..20).contains(&n) {
                    Err("down")
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(outcome.results.len(), 25);
        assert_eq!(outcome.error_count, 10);
        assert_eq!(*outcome.results[24].as_ref().unwrap(), 24);
        assert_eq!(
            outcome.warnings,
            vec![BatchPartialFailure {
                chunk_index: 1,
                total: 10,
                failed: 10
            }]
        );
        assert_eq!(outcome.warnings[0].error_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_chunk() {
        let cancel = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let op_cancel = cancel.clone();
        let op_seen = Arc::clone(&seen);
        let outcome: BatchOutcome<u32, String> = processor(Some(5))
            .process((0..20).collect::<Vec<u32>>(), 2, &cancel, move |n| {
                let cancel = op_cancel.clone();
                let seen = Arc::clone(&op_seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        cancel.cancel();
                    }
                    Ok(n)
                }
            })
            .await;

        // The first sub-batch finishes even though cancel fired inside it
        assert!(outcome.cancelled);
        assert_eq!(outcome.results.len(), 5);
        assert_eq!(outcome.skipped, 15);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert!(outcome.results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_panicking_item_reported_as_error() {
        let outcome: BatchOutcome<u32, String> = processor(None)
            .process(vec![1u32, 2, 3, 4], 2, &CancellationToken::new(), |n| async move {
                if n == 2 {
                    panic!("boom");
                }
                Ok(n)
            })
            .await;

        assert_eq!(outcome.results.len(), 4);
        assert_eq!(outcome.error_count, 1);
        assert!(matches!(outcome.results[1], Err(ItemError::Panicked(_))));
        assert_eq!(*outcome.results[3].as_ref().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_panic_does_not_block_later_items() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let outcome: BatchOutcome<u32, String> = processor(None)
            .process(vec![1u32, 2, 3, 4], 1, &CancellationToken::new(), move |n| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if n == 2 {
                        panic!("lookup for item {} crashed", n);
                    }
                    Ok(n * 10)
                }
            })
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.error_count, 1);
        match &outcome.results[1] {
            Err(ItemError::Panicked(message)) => assert!(message.contains("item 2 crashed")),
            other => panic!("Expected panic, got {:?}", other),
        }
        let values: Vec<u32> = [0, 2, 3]
            .iter()
            .map(|&i| *outcome.results[i].as_ref().unwrap())
            .collect();
        assert_eq!(values, vec![10, 30, 40]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let outcome: BatchOutcome<u32, String> = processor(Some(10))
            .process(Vec::<u32>::new(), 4, &CancellationToken::new(), |n| async move { Ok(n) })
            .await;
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.error_rate(), 0.0);
        assert!(!outcome.cancelled);
    }
}
