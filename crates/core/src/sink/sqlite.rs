//! SQLite-backed record sink.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode};
use tracing::debug;

use super::{RecordSink, SinkError};
use crate::record::{Compliance, Record};

fn map_sqlite_error(e: rusqlite::Error) -> SinkError {
    match e.sqlite_error_code() {
        Some(ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            SinkError::Unavailable(e.to_string())
        }
        _ => SinkError::Write(e.to_string()),
    }
}

/// Writes one `lead_results` row per record.
///
/// Writes run on tokio's blocking pool, never on a runtime worker.
pub struct SqliteRecordSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordSink {
    /// Open (or create) the results database at `path`.
    pub fn new(path: &Path) -> Result<Self, SinkError> {
        let conn = Connection::open(path).map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory sink (useful for testing).
    pub fn in_memory() -> Result<Self, SinkError> {
        let conn =
            Connection::open_in_memory().map_err(|e| SinkError::Unavailable(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), SinkError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lead_results (
                job_id TEXT NOT NULL,
                row_index INTEGER NOT NULL,
                payload TEXT NOT NULL,
                in_litigator_list INTEGER NOT NULL DEFAULT 0,
                in_dnc_list INTEGER NOT NULL DEFAULT 0,
                classification TEXT NOT NULL,
                persisted_at TEXT NOT NULL,
                PRIMARY KEY (job_id, row_index)
            );

            CREATE INDEX IF NOT EXISTS idx_lead_results_class ON lead_results(job_id, classification);
            "#,
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    /// Rows stored for `job_id`.
    pub fn count_for_job(&self, job_id: &str) -> Result<usize, SinkError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM lead_results WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .map_err(map_sqlite_error)?;
        Ok(count as usize)
    }

    /// Rows stored for `job_id` with the given classification.
    pub fn count_classified(&self, job_id: &str, compliance: Compliance) -> Result<usize, SinkError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM lead_results WHERE job_id = ?1 AND classification = ?2",
                params![job_id, compliance.as_str()],
                |row| row.get(0),
            )
            .map_err(map_sqlite_error)?;
        Ok(count as usize)
    }
}

fn write_records(conn: &mut Connection, job_id: &str, records: &[Record]) -> Result<(), SinkError> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.transaction().map_err(map_sqlite_error)?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT OR REPLACE INTO lead_results
                 (job_id, row_index, payload, in_litigator_list, in_dnc_list, classification, persisted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(map_sqlite_error)?;
        for record in records {
            let payload = serde_json::to_string(&record.fields)
                .map_err(|e| SinkError::Serialization(e.to_string()))?;
            stmt.execute(params![
                job_id,
                record.row_index as i64,
                payload,
                record.is_litigator(),
                record.is_dnc(),
                Compliance::of(record).as_str(),
                now,
            ])
            .map_err(map_sqlite_error)?;
        }
    }
    tx.commit().map_err(map_sqlite_error)
}

#[async_trait]
impl RecordSink for SqliteRecordSink {
    async fn persist(&self, job_id: &str, records: &[Record]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = Arc::clone(&self.conn);
        let owned_job = job_id.to_string();
        let batch = records.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            write_records(&mut conn, &owned_job, &batch)
        })
        .await
        .map_err(|e| SinkError::Write(format!("persist task failed: {}", e)))??;

        debug!(job_id, rows = records.len(), "Persisted records");
        Ok(())
    }
}
