//! Worker-pool sizing for batch operations.

/// Compute how many concurrent workers to use for a workload.
///
/// One "batch" is `batch_size` items; every batch asks for
/// `workers_per_batch` workers. The result is rounded and clamped to
/// `[min_workers, max_workers]`. An empty workload gets `min_workers`.
///
/// Never panics: a zero `batch_size` is treated as 1, a non-finite or
/// negative `workers_per_batch` as 0, and `max_workers < min_workers`
/// collapses to `min_workers`.
pub fn calculate_workers(
    workload_size: usize,
    batch_size: usize,
    min_workers: usize,
    max_workers: usize,
    workers_per_batch: f64,
) -> usize {
    let max_workers = max_workers.max(min_workers);
    if workload_size == 0 {
        return min_workers;
    }

    let batches = workload_size.div_ceil(batch_size.max(1));
    let per_batch = if workers_per_batch.is_finite() && workers_per_batch > 0.0 {
        workers_per_batch
    } else {
        0.0
    };

    let wanted = (batches as f64 * per_batch).round();
    // f64 -> usize saturates on overflow
    let wanted = wanted as usize;
    wanted.max(min_workers).min(max_workers)
}
