//! The binary keeps stdout for the job report, whatever the log format.

use std::process::Command;

use tempfile::TempDir;

#[test]
fn test_json_logs_stay_off_stdout() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("leadflow.db");
    // An empty file is a valid empty database; the missing `leads` table
    // fails the job after it has started and logged.
    std::fs::File::create(&db_path).unwrap();
    let metrics_path = dir.path().join("leadflow.prom");

    let config_path = dir.path().join("leadflow.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[database]
path = {:?}

[logging]
level = "debug"
json = true

[metrics]
textfile = {:?}

[pipeline]
stages = ["dnc_screen", "persist"]
"#,
            db_path, metrics_path
        ),
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_leadflow"))
        .env("LEADFLOW_CONFIG", &config_path)
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    assert!(!output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let job: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(job["status"], "failed");

    let stderr = String::from_utf8(output.stderr).unwrap();
    let first_log = stderr.lines().next().unwrap();
    let log: serde_json::Value = serde_json::from_str(first_log).unwrap();
    assert!(log.get("level").is_some());

    let metrics = std::fs::read_to_string(&metrics_path).unwrap();
    assert!(metrics.contains("leadflow_jobs_finished_total"));
}
