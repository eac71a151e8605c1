//! Durable state store backed by SQLite.
//!
//! One database file holds all orchestration state: tasks, per-source
//! health, the fix-attempt audit log, and the source registry. Every
//! transition is committed before the next task is pulled, so a process
//! crash never loses more than the in-flight task (which restart recovery
//! reclaims).
//!
//! Component ownership is enforced by convention: the queue owns `tasks`,
//! the health tracker owns `source_health`, the repair workflow appends to
//! `fix_attempts`. Shared read/append helpers for the audit log and the
//! source registry live here.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use crate::domain::{FailureKind, FixAttempt, FixAttemptId, FixOutcome, SourceSpec};
use crate::error::MenderError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    target        TEXT NOT NULL,
    state         TEXT NOT NULL,
    priority      INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL,
    error_message TEXT,
    context       TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim
    ON tasks (state, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS source_health (
    source_name           TEXT PRIMARY KEY,
    state                 TEXT NOT NULL,
    success_count         INTEGER NOT NULL DEFAULT 0,
    failure_count         INTEGER NOT NULL DEFAULT 0,
    consecutive_failures  INTEGER NOT NULL DEFAULT 0,
    last_success_at       TEXT,
    last_failure_at       TEXT,
    last_error            TEXT,
    fix_attempts_today    INTEGER NOT NULL DEFAULT 0,
    fix_attempts_reset_at TEXT,
    quarantine_until      TEXT
);

CREATE TABLE IF NOT EXISTS fix_attempts (
    id             TEXT PRIMARY KEY,
    source_name    TEXT NOT NULL,
    classification TEXT NOT NULL,
    diagnosis      TEXT,
    patch_ref      TEXT,
    validation     TEXT,
    outcome        TEXT NOT NULL,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fix_attempts_source
    ON fix_attempts (source_name, created_at);

CREATE TABLE IF NOT EXISTS sources (
    name               TEXT PRIMARY KEY,
    url                TEXT NOT NULL,
    schema             TEXT NOT NULL,
    last_snapshot_hash TEXT,
    registered_at      TEXT NOT NULL
);
";

/// Shared handle to the orchestration database.
///
/// The connection sits behind a mutex: SQLite is the single writer here and
/// the conditional-UPDATE claim in the queue keeps multi-worker setups safe
/// even if the mutex were replaced by a pool.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MenderError> {
        let conn = Connection::open(path)?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, MenderError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, MenderError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // -- fix attempt audit log ------------------------------------------------

    /// Append one row to the audit log. Rows are immutable once written.
    pub fn append_fix_attempt(&self, attempt: &FixAttempt) -> Result<(), MenderError> {
        let validation = attempt
            .validation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.lock().execute(
            "INSERT INTO fix_attempts
                 (id, source_name, classification, diagnosis, patch_ref,
                  validation, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt.id.storage_key(),
                attempt.source_name,
                attempt.classification.as_str(),
                attempt.diagnosis,
                attempt.patch_ref,
                validation,
                attempt.outcome.as_str(),
                attempt.created_at,
            ],
        )?;
        Ok(())
    }

    /// All attempts for a source, oldest first.
    pub fn fix_attempts_for(&self, source_name: &str) -> Result<Vec<FixAttempt>, MenderError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_name, classification, diagnosis, patch_ref,
                    validation, outcome, created_at
             FROM fix_attempts
             WHERE source_name = ?1
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![source_name], map_fix_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Number of attempts for a source at or after `cutoff`. The breaker's
    /// rolling window and probe rule are both counts over this table.
    pub fn count_fix_attempts_since(
        &self,
        source_name: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u32, MenderError> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM fix_attempts
             WHERE source_name = ?1 AND created_at >= ?2",
            params![source_name, cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // -- source registry ------------------------------------------------------

    pub fn upsert_source(&self, spec: &SourceSpec) -> Result<(), MenderError> {
        let schema = serde_json::to_string(&spec.schema)?;
        self.lock().execute(
            "INSERT INTO sources (name, url, schema, last_snapshot_hash, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                 url = excluded.url,
                 schema = excluded.schema",
            params![
                spec.name,
                spec.url,
                schema,
                spec.last_snapshot_hash,
                spec.registered_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, name: &str) -> Result<Option<SourceSpec>, MenderError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT name, url, schema, last_snapshot_hash, registered_at
             FROM sources WHERE name = ?1",
        )?;
        let mut rows = stmt.query_map(params![name], |row| {
            let schema_json: String = row.get(2)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                schema_json,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
            ))
        })?;
        match rows.next() {
            None => Ok(None),
            Some(row) => {
                let (name, url, schema_json, hash, registered_at) = row?;
                Ok(Some(SourceSpec {
                    name,
                    url,
                    schema: serde_json::from_str(&schema_json)?,
                    last_snapshot_hash: hash,
                    registered_at,
                }))
            }
        }
    }

    pub fn set_snapshot_hash(&self, name: &str, hash: &str) -> Result<(), MenderError> {
        self.lock().execute(
            "UPDATE sources SET last_snapshot_hash = ?2 WHERE name = ?1",
            params![name, hash],
        )?;
        Ok(())
    }
}

fn map_fix_row(row: &Row<'_>) -> rusqlite::Result<FixAttempt> {
    let id: String = row.get(0)?;
    let classification: String = row.get(2)?;
    let validation: Option<String> = row.get(5)?;
    let outcome: String = row.get(6)?;
    Ok(FixAttempt {
        id: FixAttemptId::parse(&id)
            .map_err(|e| bad_column(0, format!("fix attempt id: {e}")))?,
        source_name: row.get(1)?,
        classification: FailureKind::parse(&classification)
            .ok_or_else(|| bad_column(2, format!("classification '{classification}'")))?,
        diagnosis: row.get(3)?,
        patch_ref: row.get(4)?,
        validation: validation
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(|e| bad_column(5, format!("validation json: {e}")))?,
        outcome: FixOutcome::parse(&outcome)
            .ok_or_else(|| bad_column(6, format!("outcome '{outcome}'")))?,
        created_at: row.get(7)?,
    })
}

pub(crate) fn bad_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}
