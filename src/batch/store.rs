//! DT-012: Durable row and write-back persistence.
//!
//! # Tables
//!
//! - **`job_rows`**: one record per `(job_id, row_number)` with its lifecycle
//!   status, idempotency key, external reference and artifact path.
//! - **`write_back_tasks`**: completed effects awaiting propagation,
//!   unique per `(job_id, row_number)`.
//!
//! # Durability
//!
//! WAL journal with `synchronous=FULL`: a transition that returned `Ok` is
//! on disk. Every status change is a compare-and-set
//! `UPDATE ... WHERE status = ?`, so two writers can never both move a row.
//! Completing a row and enqueueing its write-back share one transaction.
//!
//! # Concurrency
//!
//! The API is synchronous. Each call holds the connection mutex for a single
//! short statement or transaction and never across an `.await`.

use super::types::*;
use crate::tripwire::eventlog::now_iso8601;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS job_rows (
    job_id             TEXT    NOT NULL,
    row_number         INTEGER NOT NULL,
    status             TEXT    NOT NULL,
    idempotency_key    TEXT    NOT NULL,
    row_checksum       TEXT    NOT NULL,
    payload            TEXT    NOT NULL,
    external_reference TEXT,
    artifact_path      TEXT,
    error_code         TEXT,
    error_message      TEXT,
    recovery_attempts  INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT    NOT NULL,
    updated_at         TEXT    NOT NULL,
    PRIMARY KEY (job_id, row_number)
);
CREATE INDEX IF NOT EXISTS idx_job_rows_status ON job_rows (status);

CREATE TABLE IF NOT EXISTS write_back_tasks (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id             TEXT    NOT NULL,
    row_number         INTEGER NOT NULL,
    external_reference TEXT    NOT NULL,
    completed_at       TEXT    NOT NULL,
    status             TEXT    NOT NULL DEFAULT 'pending',
    retry_count        INTEGER NOT NULL DEFAULT 0,
    last_error         TEXT,
    UNIQUE (job_id, row_number)
);
CREATE INDEX IF NOT EXISTS idx_write_back_status ON write_back_tasks (status);
";

const ROW_COLUMNS: &str = "job_id, row_number, status, idempotency_key, row_checksum, payload, \
     external_reference, artifact_path, error_code, error_message, recovery_attempts, \
     created_at, updated_at";

const TASK_COLUMNS: &str =
    "id, job_id, row_number, external_reference, completed_at, status, retry_count, last_error";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("mutex poisoned: {0}")]
    MutexPoisoned(String),

    #[error("row {job_id}#{row_number} not found")]
    NotFound { job_id: String, row_number: u64 },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: RowStatus, to: RowStatus },

    /// The compare-and-set lost: the row was not in the expected state.
    #[error("row {job_id}#{row_number} is {actual}, expected {expected}")]
    Conflict {
        job_id: String,
        row_number: u64,
        expected: RowStatus,
        actual: RowStatus,
    },

    #[error("write-back task {0} not found or not in the expected state")]
    TaskConflict(i64),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::Database(format!("{}: {}", context, e))
}

// ============================================================================
// Contract
// ============================================================================

/// Durable row and queue persistence.
///
/// Every method that changes a row's status checks the current status in
/// the same statement. A lost race surfaces as [`StoreError::Conflict`].
pub trait RowStore: Send + Sync {
    /// Insert rows as `pending`. Existing `(job_id, row_number)` pairs are
    /// left untouched. Returns the number inserted.
    fn insert_rows(&self, rows: &[NewRow]) -> Result<usize, StoreError>;

    fn get_row(&self, job_id: &str, row_number: u64) -> Result<Option<RowRecord>, StoreError>;

    /// All rows of a job, by row number.
    fn job_rows(&self, job_id: &str) -> Result<Vec<RowRecord>, StoreError>;

    /// Rows in `status` across jobs (or one job), by job then row number.
    fn rows_in_status(
        &self,
        job_id: Option<&str>,
        status: RowStatus,
    ) -> Result<Vec<RowRecord>, StoreError>;

    fn summary(&self, job_id: &str) -> Result<JobSummary, StoreError>;

    fn job_ids(&self) -> Result<Vec<String>, StoreError>;

    /// `pending -> in_flight`. Must be durable before the external call.
    fn begin_dispatch(&self, job_id: &str, row_number: u64) -> Result<(), StoreError>;

    /// Persist the reference returned by the gateway. Row must be in flight.
    fn record_external_reference(
        &self,
        job_id: &str,
        row_number: u64,
        external_reference: &str,
    ) -> Result<(), StoreError>;

    fn record_artifact(&self, job_id: &str, row_number: u64, path: &str) -> Result<(), StoreError>;

    /// `in_flight -> completed` and enqueue the write-back, atomically.
    /// Requires a recorded external reference.
    fn complete_row(&self, job_id: &str, row_number: u64) -> Result<(), StoreError>;

    /// `in_flight -> failed | needs_review` with an error.
    fn fail_row(
        &self,
        job_id: &str,
        row_number: u64,
        to: RowStatus,
        code: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Operator retry: `failed -> pending`, clearing the error.
    fn retry_row(&self, job_id: &str, row_number: u64) -> Result<(), StoreError>;

    /// Count one deferred recovery pass. Returns the new count.
    fn bump_recovery_attempts(&self, job_id: &str, row_number: u64) -> Result<u32, StoreError>;

    /// Pending write-backs in `(job_id, row_number)` order.
    fn pending_write_backs(&self, limit: usize) -> Result<Vec<WriteBackTask>, StoreError>;

    fn write_backs(&self, job_id: Option<&str>) -> Result<Vec<WriteBackTask>, StoreError>;

    fn complete_write_back(&self, id: i64) -> Result<(), StoreError>;

    /// Count a failed attempt; dead-letters once `max_retries` is reached.
    fn fail_write_back(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<WriteBackStatus, StoreError>;

    /// Operator action: `dead_letter -> pending` with a fresh retry budget.
    fn requeue_write_back(&self, id: i64) -> Result<(), StoreError>;
}

// ============================================================================
// SQLite implementation
// ============================================================================

/// SQLite-backed [`RowStore`].
#[derive(Debug, Clone)]
pub struct SqliteRowStore {
    conn: Arc<Mutex<Connection>>,
}

struct RawRow {
    job_id: String,
    row_number: i64,
    status: String,
    idempotency_key: String,
    row_checksum: String,
    payload: String,
    external_reference: Option<String>,
    artifact_path: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    recovery_attempts: i64,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn read(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: r.get(0)?,
            row_number: r.get(1)?,
            status: r.get(2)?,
            idempotency_key: r.get(3)?,
            row_checksum: r.get(4)?,
            payload: r.get(5)?,
            external_reference: r.get(6)?,
            artifact_path: r.get(7)?,
            error_code: r.get(8)?,
            error_message: r.get(9)?,
            recovery_attempts: r.get(10)?,
            created_at: r.get(11)?,
            updated_at: r.get(12)?,
        })
    }

    fn into_record(self) -> Result<RowRecord, StoreError> {
        let status = RowStatus::from_str_checked(&self.status).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "row {}#{} has unknown status '{}'",
                self.job_id, self.row_number, self.status
            ))
        })?;
        let payload = serde_json::from_str(&self.payload).map_err(|e| {
            StoreError::Corrupt(format!(
                "row {}#{} payload: {}",
                self.job_id, self.row_number, e
            ))
        })?;
        Ok(RowRecord {
            row_number: u64::try_from(self.row_number)
                .map_err(|_| StoreError::Corrupt(format!("negative row number {}", self.row_number)))?,
            job_id: self.job_id,
            status,
            idempotency_key: self.idempotency_key,
            row_checksum: self.row_checksum,
            payload,
            external_reference: self.external_reference,
            artifact_path: self.artifact_path,
            error_code: self.error_code,
            error_message: self.error_message,
            recovery_attempts: u32::try_from(self.recovery_attempts).unwrap_or(u32::MAX),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

type RawTask = (i64, String, i64, String, String, String, i64, Option<String>);

fn read_task(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawTask> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn into_task(raw: RawTask) -> Result<WriteBackTask, StoreError> {
    let (id, job_id, row_number, external_reference, completed_at, status, retry_count, last_error) =
        raw;
    Ok(WriteBackTask {
        id,
        job_id,
        row_number: u64::try_from(row_number)
            .map_err(|_| StoreError::Corrupt(format!("task {} negative row number", id)))?,
        external_reference,
        completed_at,
        status: WriteBackStatus::from_str_checked(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("task {} unknown status '{}'", id, status)))?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error,
    })
}

fn as_i64(row_number: u64) -> i64 {
    i64::try_from(row_number).unwrap_or(i64::MAX)
}

impl SqliteRowStore {
    /// Wrap an existing connection and ensure the schema.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::MutexPoisoned(format!("{e}")))?;
            guard
                .pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))
                .map_err(db("journal_mode"))?;
            guard
                .pragma_update(None, "synchronous", "FULL")
                .map_err(db("synchronous"))?;
            guard.execute_batch(SCHEMA_SQL).map_err(db("schema init failed"))?;
        }
        Ok(Self { conn })
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(db("open failed"))?;
        Self::new(Arc::new(Mutex::new(conn)))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db("open failed"))?;
        Self::new(Arc::new(Mutex::new(conn)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::MutexPoisoned(format!("{e}")))
    }

    fn current_status(
        conn: &Connection,
        job_id: &str,
        row_number: u64,
    ) -> Result<RowStatus, StoreError> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM job_rows WHERE job_id = ?1 AND row_number = ?2",
                params![job_id, as_i64(row_number)],
                |r| r.get(0),
            )
            .optional()
            .map_err(db("status lookup failed"))?;
        let status = status.ok_or_else(|| StoreError::NotFound {
            job_id: job_id.to_string(),
            row_number,
        })?;
        RowStatus::from_str_checked(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", status)))
    }

    /// Reject `to` unless the row's current status may move there.
    fn check_transition(
        conn: &Connection,
        job_id: &str,
        row_number: u64,
        to: RowStatus,
    ) -> Result<RowStatus, StoreError> {
        let from = Self::current_status(conn, job_id, row_number)?;
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }
        Ok(from)
    }

    /// Explain a zero-row compare-and-set.
    fn cas_miss(conn: &Connection, job_id: &str, row_number: u64, expected: RowStatus) -> StoreError {
        match Self::current_status(conn, job_id, row_number) {
            Ok(actual) => StoreError::Conflict {
                job_id: job_id.to_string(),
                row_number,
                expected,
                actual,
            },
            Err(e) => e,
        }
    }

    fn query_rows(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<RowRecord>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(sql).map_err(db("prepare failed"))?;
        let raws = stmt
            .query_map(args, RawRow::read)
            .map_err(db("query failed"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db("row read failed"))?;
        raws.into_iter().map(RawRow::into_record).collect()
    }

    fn query_tasks(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<WriteBackTask>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard.prepare(sql).map_err(db("prepare failed"))?;
        let raws = stmt
            .query_map(args, read_task)
            .map_err(db("query failed"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db("task read failed"))?;
        raws.into_iter().map(into_task).collect()
    }

    /// Update an in-flight row's column without changing its status.
    fn set_in_flight_field(
        &self,
        column: &'static str,
        job_id: &str,
        row_number: u64,
        value: &str,
    ) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let sql = format!(
            "UPDATE job_rows SET {} = ?1, updated_at = ?2 \
             WHERE job_id = ?3 AND row_number = ?4 AND status = 'in_flight'",
            column
        );
        let n = guard
            .execute(&sql, params![value, now_iso8601(), job_id, as_i64(row_number)])
            .map_err(db("update failed"))?;
        if n == 0 {
            return Err(Self::cas_miss(&guard, job_id, row_number, RowStatus::InFlight));
        }
        Ok(())
    }
}

impl RowStore for SqliteRowStore {
    fn insert_rows(&self, rows: &[NewRow]) -> Result<usize, StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db("begin transaction failed"))?;
        let now = now_iso8601();
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO job_rows \
                     (job_id, row_number, status, idempotency_key, row_checksum, payload, \
                      created_at, updated_at) \
                     VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
                )
                .map_err(db("prepare failed"))?;
            for row in rows {
                let payload = serde_json::to_string(&row.payload)
                    .map_err(|e| StoreError::Corrupt(format!("payload encode: {}", e)))?;
                inserted += stmt
                    .execute(params![
                        row.job_id,
                        as_i64(row.row_number),
                        row.idempotency_key,
                        row.row_checksum,
                        payload,
                        now
                    ])
                    .map_err(db("insert failed"))?;
            }
        }
        tx.commit().map_err(db("commit failed"))?;
        Ok(inserted)
    }

    fn get_row(&self, job_id: &str, row_number: u64) -> Result<Option<RowRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM job_rows WHERE job_id = ?1 AND row_number = ?2",
            ROW_COLUMNS
        );
        Ok(self
            .query_rows(&sql, &[&job_id, &as_i64(row_number)])?
            .into_iter()
            .next())
    }

    fn job_rows(&self, job_id: &str) -> Result<Vec<RowRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM job_rows WHERE job_id = ?1 ORDER BY row_number",
            ROW_COLUMNS
        );
        self.query_rows(&sql, &[&job_id])
    }

    fn rows_in_status(
        &self,
        job_id: Option<&str>,
        status: RowStatus,
    ) -> Result<Vec<RowRecord>, StoreError> {
        match job_id {
            Some(job) => {
                let sql = format!(
                    "SELECT {} FROM job_rows WHERE job_id = ?1 AND status = ?2 ORDER BY row_number",
                    ROW_COLUMNS
                );
                self.query_rows(&sql, &[&job, &status.as_str()])
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM job_rows WHERE status = ?1 ORDER BY job_id, row_number",
                    ROW_COLUMNS
                );
                self.query_rows(&sql, &[&status.as_str()])
            }
        }
    }

    fn summary(&self, job_id: &str) -> Result<JobSummary, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard
            .prepare("SELECT status, COUNT(*) FROM job_rows WHERE job_id = ?1 GROUP BY status")
            .map_err(db("prepare failed"))?;
        let counts = stmt
            .query_map(params![job_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(db("query failed"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db("count read failed"))?;
        let mut summary = JobSummary {
            job_id: job_id.to_string(),
            ..JobSummary::default()
        };
        for (status, n) in counts {
            let status = RowStatus::from_str_checked(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", status)))?;
            summary.count(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(summary)
    }

    fn job_ids(&self) -> Result<Vec<String>, StoreError> {
        let guard = self.lock()?;
        let mut stmt = guard
            .prepare("SELECT DISTINCT job_id FROM job_rows ORDER BY job_id")
            .map_err(db("prepare failed"))?;
        let ids = stmt
            .query_map([], |r| r.get(0))
            .map_err(db("query failed"))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db("job id read failed"))?;
        Ok(ids)
    }

    fn begin_dispatch(&self, job_id: &str, row_number: u64) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let n = guard
            .execute(
                "UPDATE job_rows SET status = 'in_flight', updated_at = ?1 \
                 WHERE job_id = ?2 AND row_number = ?3 AND status = 'pending'",
                params![now_iso8601(), job_id, as_i64(row_number)],
            )
            .map_err(db("dispatch update failed"))?;
        if n == 0 {
            return Err(Self::cas_miss(&guard, job_id, row_number, RowStatus::Pending));
        }
        Ok(())
    }

    fn record_external_reference(
        &self,
        job_id: &str,
        row_number: u64,
        external_reference: &str,
    ) -> Result<(), StoreError> {
        self.set_in_flight_field("external_reference", job_id, row_number, external_reference)
    }

    fn record_artifact(&self, job_id: &str, row_number: u64, path: &str) -> Result<(), StoreError> {
        self.set_in_flight_field("artifact_path", job_id, row_number, path)
    }

    fn complete_row(&self, job_id: &str, row_number: u64) -> Result<(), StoreError> {
        let mut guard = self.lock()?;
        let tx = guard.transaction().map_err(db("begin transaction failed"))?;
        let now = now_iso8601();
        let n = tx
            .execute(
                "UPDATE job_rows SET status = 'completed', error_code = NULL, \
                 error_message = NULL, updated_at = ?1 \
                 WHERE job_id = ?2 AND row_number = ?3 AND status = 'in_flight' \
                 AND external_reference IS NOT NULL",
                params![now, job_id, as_i64(row_number)],
            )
            .map_err(db("complete update failed"))?;
        if n == 0 {
            let err = match Self::current_status(&tx, job_id, row_number)? {
                RowStatus::InFlight => StoreError::Corrupt(format!(
                    "row {}#{} has no external reference to complete with",
                    job_id, row_number
                )),
                actual => StoreError::Conflict {
                    job_id: job_id.to_string(),
                    row_number,
                    expected: RowStatus::InFlight,
                    actual,
                },
            };
            return Err(err);
        }
        tx.execute(
            "INSERT OR IGNORE INTO write_back_tasks (job_id, row_number, external_reference, completed_at) \
             SELECT job_id, row_number, external_reference, ?1 FROM job_rows \
             WHERE job_id = ?2 AND row_number = ?3",
            params![now, job_id, as_i64(row_number)],
        )
        .map_err(db("write-back enqueue failed"))?;
        tx.commit().map_err(db("commit failed"))?;
        Ok(())
    }

    fn fail_row(
        &self,
        job_id: &str,
        row_number: u64,
        to: RowStatus,
        code: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        // Completion goes through complete_row so the write-back is enqueued.
        if to == RowStatus::Completed {
            return Err(StoreError::IllegalTransition {
                from: RowStatus::InFlight,
                to,
            });
        }
        let guard = self.lock()?;
        Self::check_transition(&guard, job_id, row_number, to)?;
        let n = guard
            .execute(
                "UPDATE job_rows SET status = ?1, error_code = ?2, error_message = ?3, updated_at = ?4 \
                 WHERE job_id = ?5 AND row_number = ?6 AND status = 'in_flight'",
                params![to.as_str(), code, message, now_iso8601(), job_id, as_i64(row_number)],
            )
            .map_err(db("fail update failed"))?;
        if n == 0 {
            return Err(Self::cas_miss(&guard, job_id, row_number, RowStatus::InFlight));
        }
        Ok(())
    }

    fn retry_row(&self, job_id: &str, row_number: u64) -> Result<(), StoreError> {
        let guard = self.lock()?;
        Self::check_transition(&guard, job_id, row_number, RowStatus::Pending)?;
        let n = guard
            .execute(
                "UPDATE job_rows SET status = 'pending', error_code = NULL, error_message = NULL, \
                 updated_at = ?1 WHERE job_id = ?2 AND row_number = ?3 AND status = 'failed'",
                params![now_iso8601(), job_id, as_i64(row_number)],
            )
            .map_err(db("retry update failed"))?;
        if n == 0 {
            return Err(Self::cas_miss(&guard, job_id, row_number, RowStatus::Failed));
        }
        Ok(())
    }

    fn bump_recovery_attempts(&self, job_id: &str, row_number: u64) -> Result<u32, StoreError> {
        let guard = self.lock()?;
        let attempts: Option<i64> = guard
            .query_row(
                "UPDATE job_rows SET recovery_attempts = recovery_attempts + 1, updated_at = ?1 \
                 WHERE job_id = ?2 AND row_number = ?3 AND status = 'in_flight' \
                 RETURNING recovery_attempts",
                params![now_iso8601(), job_id, as_i64(row_number)],
                |r| r.get(0),
            )
            .optional()
            .map_err(db("attempt update failed"))?;
        match attempts {
            Some(n) => Ok(u32::try_from(n).unwrap_or(u32::MAX)),
            None => Err(Self::cas_miss(&guard, job_id, row_number, RowStatus::InFlight)),
        }
    }

    fn pending_write_backs(&self, limit: usize) -> Result<Vec<WriteBackTask>, StoreError> {
        let sql = format!(
            "SELECT {} FROM write_back_tasks WHERE status = 'pending' \
             ORDER BY job_id, row_number LIMIT ?1",
            TASK_COLUMNS
        );
        self.query_tasks(&sql, &[&i64::try_from(limit).unwrap_or(i64::MAX)])
    }

    fn write_backs(&self, job_id: Option<&str>) -> Result<Vec<WriteBackTask>, StoreError> {
        match job_id {
            Some(job) => {
                let sql = format!(
                    "SELECT {} FROM write_back_tasks WHERE job_id = ?1 ORDER BY row_number",
                    TASK_COLUMNS
                );
                self.query_tasks(&sql, &[&job])
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM write_back_tasks ORDER BY job_id, row_number",
                    TASK_COLUMNS
                );
                self.query_tasks(&sql, &[])
            }
        }
    }

    fn complete_write_back(&self, id: i64) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let n = guard
            .execute(
                "UPDATE write_back_tasks SET status = 'completed', last_error = NULL \
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .map_err(db("write-back update failed"))?;
        if n == 0 {
            return Err(StoreError::TaskConflict(id));
        }
        Ok(())
    }

    fn fail_write_back(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<WriteBackStatus, StoreError> {
        let guard = self.lock()?;
        let status: Option<String> = guard
            .query_row(
                "UPDATE write_back_tasks SET retry_count = retry_count + 1, last_error = ?1, \
                 status = CASE WHEN retry_count + 1 >= ?2 THEN 'dead_letter' ELSE 'pending' END \
                 WHERE id = ?3 AND status = 'pending' RETURNING status",
                params![error, i64::from(max_retries), id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db("write-back failure update failed"))?;
        let status = status.ok_or(StoreError::TaskConflict(id))?;
        WriteBackStatus::from_str_checked(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("task {} unknown status '{}'", id, status)))
    }

    fn requeue_write_back(&self, id: i64) -> Result<(), StoreError> {
        let guard = self.lock()?;
        let n = guard
            .execute(
                "UPDATE write_back_tasks SET status = 'pending', retry_count = 0 \
                 WHERE id = ?1 AND status = 'dead_letter'",
                params![id],
            )
            .map_err(db("requeue failed"))?;
        if n == 0 {
            return Err(StoreError::TaskConflict(id));
        }
        Ok(())
    }
}
