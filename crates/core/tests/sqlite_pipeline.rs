//! End-to-end run against the SQLite source, denylist and sink.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection};
use tempfile::TempDir;

use leadflow_core::{
    denylist::SqliteDenylist,
    pipeline::{JobSpec, JobStatus, PipelineConfig, PipelineOrchestrator, StageKind},
    record::Compliance,
    sink::SqliteRecordSink,
    source::{QuerySpec, SqliteSourceStore},
    testing::{fixtures, MockEnricher, MockLitigatorScreen},
};

const ROWS: usize = 300;

fn seed_leads(path: &Path) {
    let mut conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE leads (first_name TEXT, last_name TEXT, phone_1 TEXT, phone_2 TEXT)",
    )
    .unwrap();
    let tx = conn.transaction().unwrap();
    for row in 0..ROWS {
        // Every third lead has a second, formatted number.
        let phone_2 = (row % 3 == 0).then(|| format!("+1 (666) 000-{:04}", row));
        tx.execute(
            "INSERT INTO leads VALUES (?1, ?2, ?3, ?4)",
            params![
                format!("Lead{}", row),
                "Example",
                fixtures::phone_for_row(row),
                phone_2
            ],
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

#[tokio::test]
async fn test_sqlite_pipeline_end_to_end() {
    let dir = TempDir::new().unwrap();
    let source_path = dir.path().join("leads.db");
    seed_leads(&source_path);

    let denylist = SqliteDenylist::new(&dir.path().join("dnc.db"))
        .unwrap()
        .with_chunk_size(64);
    // Rows 0..10 by primary phone, rows 30 and 60 by their second phone.
    denylist
        .add_numbers(fixtures::phones_where(ROWS, |r| r < 10))
        .unwrap();
    denylist
        .add_numbers(["666-000-0030", "16660000060"])
        .unwrap();
    assert_eq!(denylist.count().unwrap(), 12);

    let sink = Arc::new(SqliteRecordSink::new(&dir.path().join("results.db")).unwrap());
    let source = SqliteSourceStore::new(&source_path).unwrap();
    let litigator =
        MockLitigatorScreen::new().with_litigators(fixtures::phones_where(ROWS, |r| r % 50 == 0));

    let orchestrator = PipelineOrchestrator::new(
        PipelineConfig::default().with_sub_batch_size(128),
        Arc::new(source),
    )
    .with_enricher(Arc::new(MockEnricher::new()))
    .with_litigator_screen(Arc::new(litigator))
    .with_denylist(Arc::new(denylist))
    .with_sink(Arc::clone(&sink) as _);

    let job_id = orchestrator
        .start(JobSpec::new(QuerySpec::new("leads")))
        .await
        .unwrap();
    let job = orchestrator.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_batches, 3);
    assert_eq!(job.total_rows_processed, ROWS);

    // Litigators: 0, 50, 100, 150, 200, 250. DNC: 0..10, 30, 60.
    assert_eq!(job.stats.both_count, 1);
    assert_eq!(job.stats.litigator_count, 5);
    assert_eq!(job.stats.dnc_count, 11);
    assert_eq!(job.stats.clean_count, ROWS - 17);

    assert_eq!(sink.count_for_job(&job_id).unwrap(), ROWS);
    assert_eq!(sink.count_classified(&job_id, Compliance::Both).unwrap(), 1);
    assert_eq!(sink.count_classified(&job_id, Compliance::Dnc).unwrap(), 11);
}

#[tokio::test]
async fn test_sqlite_pipeline_rejects_bad_table() {
    let dir = TempDir::new().unwrap();
    let source_path = dir.path().join("leads.db");
    seed_leads(&source_path);

    let denylist = SqliteDenylist::in_memory().unwrap();
    let orchestrator = PipelineOrchestrator::new(
        PipelineConfig::default().with_stages(vec![StageKind::DncScreen]),
        Arc::new(SqliteSourceStore::new(&source_path).unwrap()),
    )
    .with_denylist(Arc::new(denylist));

    let job_id = orchestrator
        .start(JobSpec::new(QuerySpec::new("leads; DROP TABLE leads")))
        .await
        .unwrap();
    let job = orchestrator.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.total_rows_processed, 0);
}
