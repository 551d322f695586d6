//! SQLite-backed source store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use serde_json::{Map, Number, Value};
use tracing::debug;

use super::{QuerySpec, SourceError, SourceStore};
use crate::record::Record;

static IDENTIFIER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

fn is_identifier(name: &str) -> bool {
    IDENTIFIER.as_ref().is_some_and(|re| re.is_match(name))
}

fn map_sqlite_error(e: rusqlite::Error) -> SourceError {
    match e.sqlite_error_code() {
        Some(ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            SourceError::Unavailable(e.to_string())
        }
        _ => SourceError::Query(e.to_string()),
    }
}

/// Reads every column of a table into record fields.
///
/// Queries run on tokio's blocking pool, never on a runtime worker.
pub struct SqliteSourceStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteSourceStore {
    /// Open an existing database read-only.
    pub fn new(path: &Path) -> Result<Self, SourceError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already-open connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        }
    }

    /// Database path, if opened from a file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn read_table(conn: &Connection, spec: &QuerySpec) -> Result<Vec<Record>, SourceError> {
    if !is_identifier(&spec.table) {
        return Err(SourceError::InvalidTable(spec.table.clone()));
    }
    // SQLite treats a negative LIMIT as "no limit".
    let limit = spec.limit.map(|l| l as i64).unwrap_or(-1);
    let sql = format!(
        "SELECT * FROM \"{}\" ORDER BY rowid LIMIT ?1 OFFSET ?2",
        spec.table
    );

    let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt
        .query(params![limit, spec.offset as i64])
        .map_err(map_sqlite_error)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqlite_error)? {
        let mut fields = Map::new();
        for (i, column) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(map_sqlite_error)?;
            fields.insert(column.clone(), to_json(value));
        }
        records.push(Record::from_fields(records.len(), fields));
    }
    Ok(records)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

#[async_trait]
impl SourceStore for SqliteSourceStore {
    async fn fetch_records(&self, query: &QuerySpec) -> Result<Vec<Record>, SourceError> {
        let conn = Arc::clone(&self.conn);
        let spec = query.clone();
        let records = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            read_table(&conn, &spec)
        })
        .await
        .map_err(|e| SourceError::Unavailable(format!("source query task failed: {}", e)))??;
        debug!(table = %query.table, rows = records.len(), "Fetched source records");
        Ok(records)
    }
}
