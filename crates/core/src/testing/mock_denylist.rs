//! In-memory denylist for testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::denylist::{normalize_phone, DenylistError, DenylistStore, DEFAULT_CHUNK_SIZE};

/// DenylistStore backed by a HashSet.
///
/// Counts chunk queries so tests can check chunking, and can be toggled
/// into a failing mode to simulate a locked database.
#[derive(Debug, Clone)]
pub struct InMemoryDenylist {
    numbers: Arc<HashSet<String>>,
    chunk_size: usize,
    queries: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl Default for InMemoryDenylist {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl InMemoryDenylist {
    /// Create a denylist holding `numbers`, normalized on the way in.
    pub fn new<I, S>(numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            numbers: Arc::new(
                numbers
                    .into_iter()
                    .filter_map(|n| normalize_phone(n.as_ref()))
                    .collect(),
            ),
            chunk_size: DEFAULT_CHUNK_SIZE,
            queries: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Make every lookup fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of chunk queries issued.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }
}

impl DenylistStore for InMemoryDenylist {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn lookup_chunk(&self, numbers: &[String]) -> Result<HashSet<String>, DenylistError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DenylistError::Database("database is locked".to_string()));
        }
        Ok(numbers
            .iter()
            .filter(|n| self.numbers.contains(*n))
            .cloned()
            .collect())
    }
}
