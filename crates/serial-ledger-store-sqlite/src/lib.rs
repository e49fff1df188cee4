#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serial_ledger_core::{
    format_rfc3339, now_utc_seconds, Disclosure, EarliestQuery, NewQuery, QueryEvent,
    QueryStats, RecordedQuery, SerialNumber,
};
use tracing::debug;

const QUERY_LOG_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CUTOFF_OPEN: u8 = 0;
const CUTOFF_CLAIMED: u8 = 1;
const CUTOFF_ABANDONED: u8 = 2;

const SCHEMA_QUERY_LOG_V1: &str = r"
CREATE TABLE IF NOT EXISTS query_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  serial_number TEXT NOT NULL CHECK (
    length(serial_number) BETWEEN 9 AND 11
    AND serial_number GLOB '[A-Z][A-Z][0-9][0-9][0-9][0-9][0-9][0-9]*[A-Z]'
    AND substr(serial_number, 3, length(serial_number) - 3) NOT GLOB '*[^0-9]*'
  ),
  is_winner INTEGER NOT NULL DEFAULT 0 CHECK (is_winner IN (0, 1)),
  client_identity TEXT NOT NULL,
  query_time TEXT NOT NULL,
  user_agent TEXT NOT NULL DEFAULT ''
);

CREATE TRIGGER IF NOT EXISTS trg_query_log_no_update
BEFORE UPDATE ON query_log
BEGIN
  SELECT RAISE(FAIL, 'query_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_query_log_no_delete
BEFORE DELETE ON query_log
BEGIN
  SELECT RAISE(FAIL, 'query_log is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_query_log_serial_number
  ON query_log(serial_number, query_time, id);
CREATE INDEX IF NOT EXISTS idx_query_log_client_identity
  ON query_log(client_identity);
CREATE INDEX IF NOT EXISTS idx_query_log_query_time
  ON query_log(query_time);
CREATE INDEX IF NOT EXISTS idx_query_log_is_winner
  ON query_log(is_winner);
";

/// Append-only log of serial lookups backed by a single sqlite file.
///
/// Every write takes the sqlite write lock up front (`BEGIN IMMEDIATE`), so
/// concurrent writers on the same file are serialized and a reader that
/// starts after a commit observes it.
pub struct SqliteQueryStore {
    conn: Connection,
    cutoff: Option<WriteCutoff>,
}

/// Decides, once per unit of work, whether pending writes may still commit.
///
/// The writer claims the commit right before `COMMIT`; a waiter that gave up
/// abandons it. Whichever side gets there first wins, so a waiter that
/// abandoned successfully knows nothing was written, and a waiter whose
/// abandon fails knows the write is already committing.
#[derive(Debug, Clone)]
pub struct WriteCutoff {
    state: Arc<AtomicU8>,
    deadline: Option<Instant>,
}

impl WriteCutoff {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(CUTOFF_OPEN)),
            deadline: None,
        }
    }

    /// A cutoff that also refuses commits once `deadline` has passed.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::new()
        }
    }

    /// Refuses every later commit. Returns `false` when a write already
    /// claimed its commit.
    pub fn abandon(&self) -> bool {
        matches!(
            self.state.compare_exchange(
                CUTOFF_OPEN,
                CUTOFF_ABANDONED,
                Ordering::AcqRel,
                Ordering::Acquire
            ),
            Ok(_) | Err(CUTOFF_ABANDONED)
        )
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::Acquire) == CUTOFF_ABANDONED
    }

    fn claim_commit(&self) -> bool {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = self.abandon();
        }
        matches!(
            self.state.compare_exchange(
                CUTOFF_OPEN,
                CUTOFF_CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire
            ),
            Ok(_) | Err(CUTOFF_CLAIMED)
        )
    }
}

impl Default for WriteCutoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Filesystem facts about a configured database location.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LocationDiagnostics {
    pub database_path: String,
    pub database_directory: String,
    pub directory_exists: bool,
    pub directory_writable: bool,
    pub file_exists: bool,
    pub file_writable: Option<bool>,
}

impl SqliteQueryStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens the database, creating its directory when missing.
    ///
    /// `busy_timeout` bounds how long a statement waits on another
    /// connection's lock before failing.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if !dir.is_dir() {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("cannot create database directory {}", dir.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, cutoff: None })
    }

    /// Makes every later write ask `cutoff` before committing.
    pub fn set_write_cutoff(&mut self, cutoff: WriteCutoff) {
        self.cutoff = Some(cutoff);
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_QUERY_LOG_V1)
            .context("failed to apply query_log schema")?;

        let now = format_rfc3339(now_utc_seconds())?;
        let registered = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![QUERY_LOG_MIGRATION_VERSION, now],
            )
            .context("failed to register query_log schema migration")?;
        if registered > 0 {
            debug!(version = QUERY_LOG_MIGRATION_VERSION, "applied query_log schema");
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query schema version")
    }

    /// Cheap reachability check against the event table.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT COUNT(*) FROM query_log WHERE id = 0", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("query_log is not readable")?;
        Ok(())
    }

    /// Appends one event and returns its id. `query_time` is assigned here.
    pub fn insert(&mut self, query: &NewQuery) -> Result<i64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start insert transaction")?;
        let event_id = insert_event(&tx, query)?;
        ensure_commit_allowed(self.cutoff.as_ref())?;
        tx.commit().context("failed to commit insert transaction")?;
        Ok(event_id)
    }

    /// Reads the disclosure for `serial` and appends the new event inside one
    /// write transaction, so the disclosure reflects exactly the events
    /// committed before this one.
    pub fn record_query(&mut self, query: &NewQuery) -> Result<RecordedQuery> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start record transaction")?;

        let previous_queries = disclosure_for(
            &tx,
            &query.serial_number,
            &query.client_identity,
            &query.user_agent,
        )?;
        let event_id = insert_event(&tx, query)?;
        ensure_commit_allowed(self.cutoff.as_ref())?;
        tx.commit().context("failed to commit record transaction")?;

        debug!(
            event_id,
            serial_number = %query.serial_number,
            prior_queries = previous_queries.as_ref().map_or(0, |item| item.query_count),
            "recorded serial query"
        );

        Ok(RecordedQuery {
            event_id,
            previous_queries,
        })
    }

    pub fn previous_query_info(
        &self,
        serial: &SerialNumber,
        current_identity: &str,
        current_user_agent: &str,
    ) -> Result<Option<Disclosure>> {
        disclosure_for(&self.conn, serial, current_identity, current_user_agent)
    }

    pub fn single_earliest_previous(&self, serial: &SerialNumber) -> Result<Option<EarliestQuery>> {
        self.conn
            .query_row(
                "SELECT client_identity, query_time, is_winner
                 FROM query_log
                 WHERE serial_number = ?1
                 ORDER BY query_time ASC, id ASC
                 LIMIT 1",
                params![serial.as_str()],
                |row| {
                    Ok(EarliestQuery {
                        client_identity: row.get(0)?,
                        query_time: row.get(1)?,
                        is_winner: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()
            .context("failed to query earliest serial query")
    }

    pub fn stats(&self) -> Result<QueryStats> {
        let (total, serials, clients, winners) = self
            .conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COUNT(DISTINCT serial_number),
                    COUNT(DISTINCT client_identity),
                    COALESCE(SUM(is_winner), 0)
                 FROM query_log",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .context("failed to aggregate query_log statistics")?;

        Ok(QueryStats {
            total_queries: to_count(total, "total_queries")?,
            unique_serials: to_count(serials, "unique_serials")?,
            unique_clients: to_count(clients, "unique_clients")?,
            winner_queries: to_count(winners, "winner_queries")?,
        })
    }

    /// Full event rows for one serial in query order. Operator use only; the
    /// HTTP surface never exposes these.
    pub fn list_events(&self, serial: &SerialNumber) -> Result<Vec<QueryEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, serial_number, is_winner, client_identity, query_time, user_agent
             FROM query_log
             WHERE serial_number = ?1
             ORDER BY query_time ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![serial.as_str()], parse_event_row)?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

// An uncommitted transaction rolls back when dropped on the error path.
fn ensure_commit_allowed(cutoff: Option<&WriteCutoff>) -> Result<()> {
    if cutoff.is_some_and(|cutoff| !cutoff.claim_commit()) {
        bail!("write abandoned before commit");
    }
    Ok(())
}

fn disclosure_for(
    conn: &Connection,
    serial: &SerialNumber,
    current_identity: &str,
    current_user_agent: &str,
) -> Result<Option<Disclosure>> {
    let mut stmt = conn
        .prepare(
            "SELECT client_identity, query_time, is_winner, user_agent
             FROM query_log
             WHERE serial_number = ?1
             ORDER BY query_time ASC, id ASC",
        )
        .context("failed to prepare disclosure query")?;

    let mut rows = stmt
        .query(params![serial.as_str()])
        .context("failed to query previous serial lookups")?;

    let mut first: Option<(String, bool)> = None;
    let mut all_timestamps = Vec::new();
    let mut queried_by_same_user = false;

    while let Some(row) = rows.next()? {
        let client_identity: String = row.get(0)?;
        let query_time: String = row.get(1)?;
        let is_winner = row.get::<_, i64>(2)? != 0;
        let user_agent: String = row.get(3)?;

        if client_identity == current_identity && user_agent == current_user_agent {
            queried_by_same_user = true;
        }
        if first.is_none() {
            first = Some((query_time.clone(), is_winner));
        }
        all_timestamps.push(query_time);
    }

    Ok(first.map(|(first_query_time, first_query_was_winner)| Disclosure {
        first_query_time,
        query_count: all_timestamps.len(),
        all_timestamps,
        queried_by_same_user,
        first_query_was_winner,
    }))
}

fn insert_event(conn: &Connection, query: &NewQuery) -> Result<i64> {
    let now = format_rfc3339(now_utc_seconds())?;
    let latest: Option<String> = conn
        .query_row("SELECT MAX(query_time) FROM query_log", [], |row| row.get(0))
        .context("failed to query latest query_time")?;

    // Keep stamps non-decreasing in insertion order even if the clock steps back.
    let query_time = match latest {
        Some(latest) if latest > now => latest,
        _ => now,
    };

    conn.execute(
        "INSERT INTO query_log(serial_number, is_winner, client_identity, query_time, user_agent)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            query.serial_number.as_str(),
            i64::from(query.is_winner),
            query.client_identity,
            query_time,
            query.user_agent,
        ],
    )
    .context("failed to append query event")?;

    Ok(conn.last_insert_rowid())
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryEvent> {
    let serial_raw: String = row.get(1)?;
    let serial_number = SerialNumber::parse(&serial_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )),
        )
    })?;

    Ok(QueryEvent {
        id: row.get(0)?,
        serial_number,
        is_winner: row.get::<_, i64>(2)? != 0,
        client_identity: row.get(3)?,
        query_time: row.get(4)?,
        user_agent: row.get(5)?,
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn to_count(value: i64, label: &str) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("invalid {label} count: {value}"))
}

/// Inspects the database location without opening it.
#[must_use]
pub fn diagnose_location(path: &Path) -> LocationDiagnostics {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let directory_exists = dir.is_dir();
    let file_exists = path.is_file();

    LocationDiagnostics {
        database_path: path.display().to_string(),
        database_directory: dir.display().to_string(),
        directory_exists,
        directory_writable: directory_exists && is_writable(dir),
        file_exists,
        file_writable: file_exists.then(|| is_writable(path)),
    }
}

fn is_writable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| !meta.permissions().readonly())
}
