//! SQLite-backed denylist.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use super::{DenylistError, DenylistStore, DEFAULT_CHUNK_SIZE};

/// Denylist stored in a `dnc_numbers` table.
pub struct SqliteDenylist {
    conn: Mutex<Connection>,
    chunk_size: usize,
}

impl SqliteDenylist {
    /// Open (or create) the denylist database at `path`.
    pub fn new(path: &Path) -> Result<Self, DenylistError> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// In-memory denylist (useful for testing).
    pub fn in_memory() -> Result<Self, DenylistError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Sets numbers per lookup query.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    fn initialize_schema(conn: &Connection) -> Result<(), DenylistError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dnc_numbers (
                phone TEXT PRIMARY KEY,
                added_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    /// Add numbers to the denylist. Returns how many were new.
    ///
    /// Numbers that do not normalize to a valid phone are skipped.
    pub fn add_numbers<I, S>(&self, numbers: I) -> Result<usize, DenylistError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO dnc_numbers (phone) VALUES (?1)")?;
            for raw in numbers {
                if let Some(phone) = super::normalize_phone(raw.as_ref()) {
                    added += stmt.execute(params![phone])?;
                }
            }
        }
        tx.commit()?;
        Ok(added)
    }

    /// Number of denylisted phones.
    pub fn count(&self) -> Result<usize, DenylistError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dnc_numbers", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl DenylistStore for SqliteDenylist {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn lookup_chunk(&self, numbers: &[String]) -> Result<HashSet<String>, DenylistError> {
        if numbers.is_empty() {
            return Ok(HashSet::new());
        }
        let placeholders = vec!["?"; numbers.len()].join(",");
        let sql = format!("SELECT phone FROM dnc_numbers WHERE phone IN ({})", placeholders);

        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(numbers.iter()), |row| row.get::<_, String>(0))?;

        let mut found = HashSet::new();
        for row in rows {
            found.insert(row?);
        }
        debug!(queried = numbers.len(), matched = found.len(), "Denylist chunk lookup");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn phones(range: std::ops::Range<u32>) -> Vec<String> {
        range.map(|n| format!("555{:07}", n)).collect()
    }

    #[test]
    fn test_add_and_count() {
        let store = SqliteDenylist::in_memory().unwrap();
        let added = store
            .add_numbers(["(555) 000-0001", "1-555-000-0002", "5550000001", "123"])
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_check_many_across_chunks() {
        let store = SqliteDenylist::in_memory().unwrap().with_chunk_size(100);
        let listed: Vec<String> = phones(0..1500).into_iter().step_by(3).collect();
        store.add_numbers(&listed).unwrap();

        let input: HashSet<String> = phones(0..1500).into_iter().collect();
        let found = store.check_many(&input).unwrap();
        assert_eq!(found, listed.into_iter().collect::<HashSet<_>>());
    }

    #[test]
    fn test_default_chunk_handles_more_than_sqlite_limit() {
        let store = SqliteDenylist::in_memory().unwrap();
        assert_eq!(store.chunk_size(), 900);
        store.add_numbers(["5550002999"]).unwrap();

        let input: HashSet<String> = phones(0..3000).into_iter().collect();
        let found = store.check_many(&input).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains("5550002999"));
    }

    #[test]
    fn test_persists_to_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dnc.db");
        {
            let store = SqliteDenylist::new(&path).unwrap();
            store.add_numbers(["5551234567"]).unwrap();
        }
        let store = SqliteDenylist::new(&path).unwrap();
        let input: HashSet<String> = ["5551234567".to_string(), "5559999999".to_string()]
            .into_iter()
            .collect();
        let found = store.check_many(&input).unwrap();
        assert_eq!(found.len(), 1);
    }
}
