#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn sl_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sl"))
}

fn unique_temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("serial-ledger-cli-{}.sqlite3", Ulid::new()))
}

fn sl_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(sl_binary_path());
    command.env_remove("SERIAL_LEDGER_DB_PATH");
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sl command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

#[test]
fn help_lists_operator_commands() {
    let output = match Command::new(sl_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["check", "extract", "log", "history", "stats", "migrate"] {
        assert!(stdout.contains(required), "missing subcommand {required}");
    }
}

#[test]
fn check_does_not_create_database() {
    let db_path = unique_temp_db_path();
    let output = sl_output(&db_path, &["check", "ah28519618b"]);
    assert!(output.status.success());

    let value = stdout_json(&output);
    assert_eq!(value["serial_number"], Value::from("AH28519618B"));
    assert_eq!(value["valid"], Value::from(true));
    assert_eq!(value["is_winner"], Value::from(true));
    assert!(!db_path.exists());
}

#[test]
fn extract_prints_candidate_or_fails() {
    let db_path = unique_temp_db_path();
    let found = sl_output(&db_path, &["extract", "RESERVE BANK ah28519618b TEN RAND"]);
    assert!(found.status.success());
    assert_eq!(String::from_utf8_lossy(&found.stdout).trim(), "AH28519618B");

    let missing = sl_output(&db_path, &["extract", "no digits here"]);
    assert!(!missing.status.success());
}

#[test]
fn log_then_history_reports_disclosure() {
    let db_path = unique_temp_db_path();

    let first = sl_output(
        &db_path,
        &["log", "AB1234567C", "--client", "203.0.113.1", "--user-agent", "curl"],
    );
    assert!(first.status.success());
    let first = stdout_json(&first);
    assert!(first["event_id"].as_i64().is_some());
    assert_eq!(first["previous_queries"], Value::Null);

    let second = sl_output(
        &db_path,
        &["log", "AB1234567C", "--winner", "--client", "203.0.113.2"],
    );
    assert!(second.status.success());
    let second = stdout_json(&second);
    assert_eq!(second["previous_queries"]["query_count"], Value::from(1));
    assert_eq!(second["previous_queries"]["queried_by_same_user"], Value::from(false));
    assert_eq!(second["previous_queries"]["first_query_was_winner"], Value::from(false));

    let history = sl_output(
        &db_path,
        &["history", "AB1234567C", "--client", "203.0.113.1", "--user-agent", "curl"],
    );
    assert!(history.status.success());
    let history = stdout_json(&history);
    assert_eq!(history["query_count"], Value::from(2));
    assert_eq!(history["queried_by_same_user"], Value::from(true));

    let events = sl_output(&db_path, &["history", "AB1234567C", "--events"]);
    assert!(events.status.success());
    let events = stdout_json(&events);
    assert_eq!(events.as_array().map(Vec::len), Some(2));
    assert_eq!(events[1]["is_winner"], Value::from(true));

    let earliest = sl_output(&db_path, &["history", "AB1234567C", "--earliest"]);
    assert!(earliest.status.success());
    let earliest = stdout_json(&earliest);
    assert_eq!(earliest["client_identity"], Value::from("203.0.113.1"));
    assert_eq!(earliest["is_winner"], Value::from(false));

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn log_rejects_malformed_serial_without_writing() {
    let db_path = unique_temp_db_path();
    let output = sl_output(&db_path, &["log", "AH2851961"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid serial number"));

    let conn = match Connection::open(&db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let count: i64 = match conn.query_row("SELECT COUNT(*) FROM query_log", [], |row| row.get(0)) {
        Ok(value) => value,
        Err(err) => panic!("failed to count events: {err}"),
    };
    assert_eq!(count, 0);

    let _ = std::fs::remove_file(&db_path);
}

#[test]
fn stats_and_migrate_report_json() {
    let db_path = unique_temp_db_path();

    let migrate = sl_output(&db_path, &["migrate"]);
    assert!(migrate.status.success());
    assert_eq!(stdout_json(&migrate)["schema_version"], Value::from(1));

    let writes: [&[&str]; 3] = [
        &["log", "AH28519618B", "--winner"],
        &["log", "AH28519618B", "--winner"],
        &["log", "AB1234567C", "--client", "203.0.113.9"],
    ];
    for args in writes {
        let output = sl_output(&db_path, args);
        assert!(output.status.success(), "{:?}", args);
    }

    let stats = sl_output(&db_path, &["stats"]);
    assert!(stats.status.success());
    let stats = stdout_json(&stats);
    assert_eq!(stats["total_queries"], Value::from(3));
    assert_eq!(stats["unique_serials"], Value::from(2));
    assert_eq!(stats["unique_clients"], Value::from(2));
    assert_eq!(stats["winner_queries"], Value::from(2));

    let _ = std::fs::remove_file(&db_path);
}
