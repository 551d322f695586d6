//! Do-not-call denylist lookup.
//!
//! The backing store caps the number of bound parameters per query, so
//! `check_many` splits the input into chunks of `chunk_size()` numbers,
//! issues one lookup per chunk and unions the hits. Callers never see the
//! chunking.

mod sqlite;

use std::collections::HashSet;

use thiserror::Error;

use crate::resilience::DependencyError;

pub use sqlite::SqliteDenylist;

/// Default numbers per lookup query, below SQLite's 999-parameter ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 900;

/// Errors from denylist lookups.
#[derive(Debug, Error)]
pub enum DenylistError {
    #[error("denylist database error: {0}")]
    Database(String),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(usize),
}

impl From<rusqlite::Error> for DenylistError {
    fn from(e: rusqlite::Error) -> Self {
        DenylistError::Database(e.to_string())
    }
}

impl From<DenylistError> for DependencyError {
    fn from(e: DenylistError) -> Self {
        match e {
            DenylistError::Database(msg) => DependencyError::Transient(msg),
            DenylistError::InvalidChunkSize(size) => {
                DependencyError::Invalid(format!("invalid denylist chunk size {}", size))
            }
        }
    }
}

/// Store of denylisted phone numbers.
///
/// Implementations only provide the single-chunk query; `check_many` is
/// shared. Numbers are expected in `normalize_phone` form.
pub trait DenylistStore: Send + Sync {
    /// Maximum numbers per `lookup_chunk` call.
    fn chunk_size(&self) -> usize;

    /// Return the members of `numbers` present in the denylist.
    ///
    /// `numbers.len()` never exceeds `chunk_size()`.
    fn lookup_chunk(&self, numbers: &[String]) -> Result<HashSet<String>, DenylistError>;

    /// Return the subset of `numbers` present in the denylist.
    ///
    /// Fails as a whole if any chunk query fails.
    fn check_many(&self, numbers: &HashSet<String>) -> Result<HashSet<String>, DenylistError> {
        if numbers.is_empty() {
            return Ok(HashSet::new());
        }
        let chunk_size = self.chunk_size();
        if chunk_size == 0 {
            return Err(DenylistError::InvalidChunkSize(chunk_size));
        }

        // Sorted so the same set always produces the same queries.
        let mut sorted: Vec<String> = numbers.iter().cloned().collect();
        sorted.sort_unstable();

        let mut found = HashSet::new();
        for chunk in sorted.chunks(chunk_size) {
            found.extend(self.lookup_chunk(chunk)?);
        }
        Ok(found)
    }
}

/// Canonical form of a phone number for denylist lookups.
///
/// Keeps digits only and drops a leading `1` country code from 11-digit
/// numbers. Returns `None` for anything shorter than 10 digits.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    };
    if digits.len() < 10 {
        None
    } else {
        Some(digits)
    }
}
