//! SQLite store for the tracker.
//!
//! `TrackerDb` owns the connection; the `impl TrackerDb` blocks are split by
//! area (`org`, `activities`, `reports`). Every multi-row mutation runs in a
//! single transaction so a status change and its audit row land together.

mod activities;
mod org;
mod reports;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, ErrorCode, Row, params_from_iter};

use crate::errors::TrackerError;

pub use activities::ActivityFilter;

/// Async-safe handle to the tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// (and Argon2 verification done inside closures) off the async workers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct TrackerDb {
    conn: Connection,
}

const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%SZ', 'now')";

/// Tables that carry an `updated_at` column maintained by trigger.
const TIMESTAMPED_TABLES: [&str; 6] = [
    "sectors",
    "plants",
    "users",
    "projects",
    "activities",
    "subtasks",
];

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        let schema = format!(
            "
            CREATE TABLE IF NOT EXISTS sectors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS plants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                code TEXT NOT NULL UNIQUE,
                location TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member'
                    CHECK (role IN ('admin', 'manager', 'member')),
                sector_id INTEGER REFERENCES sectors(id),
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                sector_id INTEGER REFERENCES sectors(id),
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'next'
                    CHECK (status IN ('next', 'in_progress', 'paused', 'completed', 'cancelled')),
                priority TEXT NOT NULL DEFAULT 'medium'
                    CHECK (priority IN ('low', 'medium', 'high', 'urgent')),
                sector_id INTEGER REFERENCES sectors(id),
                plant_id INTEGER REFERENCES plants(id),
                project_id INTEGER REFERENCES projects(id),
                assignee_id INTEGER REFERENCES users(id),
                created_by INTEGER NOT NULL REFERENCES users(id),
                total_seconds INTEGER NOT NULL DEFAULT 0 CHECK (total_seconds >= 0),
                running_since TEXT,
                due_date TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS subtasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                done INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT ({now}),
                updated_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS activity_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_seconds INTEGER
            );

            CREATE TABLE IF NOT EXISTS activity_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                action TEXT NOT NULL
                    CHECK (action IN ('created', 'updated', 'started', 'resumed', 'paused',
                        'auto_paused', 'completed', 'cancelled', 'reopened', 'time_adjusted',
                        'subtask_added', 'subtask_completed', 'subtask_reopened',
                        'subtask_deleted')),
                message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS time_adjustments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id INTEGER NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id),
                previous_seconds INTEGER NOT NULL,
                new_seconds INTEGER NOT NULL CHECK (new_seconds >= 0),
                delta_seconds INTEGER NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE TABLE IF NOT EXISTS auth_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                token_hash TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT ({now}),
                expires_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL DEFAULT ({now})
            );

            CREATE INDEX IF NOT EXISTS idx_users_sector ON users(sector_id);
            CREATE INDEX IF NOT EXISTS idx_activities_sector ON activities(sector_id, status);
            CREATE INDEX IF NOT EXISTS idx_activities_assignee ON activities(assignee_id);
            CREATE INDEX IF NOT EXISTS idx_subtasks_activity ON subtasks(activity_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_activity ON activity_sessions(activity_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_started ON activity_sessions(started_at);
            CREATE INDEX IF NOT EXISTS idx_logs_activity ON activity_logs(activity_id);
            CREATE INDEX IF NOT EXISTS idx_logs_created ON activity_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_adjustments_activity ON time_adjustments(activity_id);
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_expiry ON auth_sessions(expires_at);

            -- Single running timer per user and per activity.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_user
                ON activity_sessions(user_id) WHERE ended_at IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_activity
                ON activity_sessions(activity_id) WHERE ended_at IS NULL;
            ",
            now = NOW_SQL
        );
        self.conn
            .execute_batch(&schema)
            .context("Failed to create tables")?;

        for table in TIMESTAMPED_TABLES {
            self.conn
                .execute_batch(&format!(
                    "CREATE TRIGGER IF NOT EXISTS trg_{table}_updated_at
                     AFTER UPDATE ON {table} FOR EACH ROW
                     WHEN NEW.updated_at = OLD.updated_at
                     BEGIN
                         UPDATE {table} SET updated_at = {now} WHERE id = NEW.id;
                     END;",
                    table = table,
                    now = NOW_SQL
                ))
                .with_context(|| format!("Failed to create updated_at trigger for {}", table))?;
        }

        Ok(())
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

/// Read a TEXT column into one of the model enums.
fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Turn a UNIQUE violation into a `Conflict`; pass anything else through.
fn unique_violation(err: rusqlite::Error, what: &str) -> anyhow::Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            TrackerError::Conflict(format!("{} already exists", what)).into()
        }
        _ => anyhow::Error::new(err).context(format!("Failed to write {}", what)),
    }
}

/// Run `UPDATE <table> SET <col> = ?, ... WHERE id = ?` for the given columns.
/// Returns the number of changed rows (0 when `sets` is empty).
fn apply_patch(
    conn: &Connection,
    table: &str,
    id: i64,
    sets: Vec<(&'static str, Value)>,
) -> rusqlite::Result<usize> {
    if sets.is_empty() {
        return Ok(0);
    }
    let assignments: Vec<String> = sets
        .iter()
        .enumerate()
        .map(|(i, (col, _))| format!("{} = ?{}", col, i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        table,
        assignments.join(", "),
        sets.len() + 1
    );
    let mut values: Vec<Value> = sets.into_iter().map(|(_, v)| v).collect();
    values.push(Value::Integer(id));
    conn.execute(&sql, params_from_iter(values))
}

fn opt_int(v: Option<i64>) -> Value {
    v.map(Value::Integer).unwrap_or(Value::Null)
}

fn opt_text(v: Option<String>) -> Value {
    v.map(Value::Text).unwrap_or(Value::Null)
}

fn required_text(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TrackerError::Validation(format!("{} must not be empty", field)).into());
    }
    Ok(trimmed.to_string())
}
