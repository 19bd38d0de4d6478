//! DT-015: Append-only JSONL provenance event log, one file per job.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

/// Job ids name directories, so they are restricted to a single safe
/// path segment.
pub fn is_valid_job_id(job_id: &str) -> bool {
    JOB_ID.is_match(job_id)
}

/// Provenance events for a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Rows were selected by a compiled filter and planned into the job.
    JobPlanned {
        job_id: String,
        session_id: String,
        content_hash: String,
        rows: usize,
    },
    BatchStarted {
        job_id: String,
        pending: usize,
    },
    RowDispatched {
        job_id: String,
        row_number: u64,
        idempotency_key: String,
    },
    RowCompleted {
        job_id: String,
        row_number: u64,
        external_reference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artifact_hash: Option<String>,
    },
    RowFailed {
        job_id: String,
        row_number: u64,
        code: String,
        message: String,
    },
    RowNeedsReview {
        job_id: String,
        row_number: u64,
        code: String,
        message: String,
    },
    BatchFinished {
        job_id: String,
        completed: usize,
        failed: usize,
        needs_review: usize,
        not_dispatched: usize,
        cancelled: bool,
        duration_ms: u64,
    },
    RowRecovered {
        job_id: String,
        row_number: u64,
        tier: u8,
        outcome: String,
        detail: String,
    },
    StagingCleared {
        job_id: String,
        files: usize,
    },
    WriteBackApplied {
        job_id: String,
        row_number: u64,
        external_reference: String,
    },
    WriteBackDeadLettered {
        job_id: String,
        row_number: u64,
        error: String,
    },
}

/// Event with timestamp wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ExecutionEvent,
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Generate an ISO 8601 timestamp.
pub fn now_iso8601() -> String {
    format_iso8601(unix_now())
}

/// Format unix seconds as `YYYY-MM-DDTHH:MM:SSZ` (UTC, no chrono).
pub fn format_iso8601(secs: u64) -> String {
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    let mut y = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let leap = is_leap(y);
    let month_days = [
        31,
        if leap { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut m = 0;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md as i64 {
            m = i + 1;
            break;
        }
        remaining -= md as i64;
    }
    let d = remaining + 1;

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y, m, d, hours, minutes, seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a job ID.
pub fn generate_job_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("j-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Derive the event log path for a job.
pub fn event_log_path(state_dir: &Path, job_id: &str) -> Result<PathBuf, String> {
    if !is_valid_job_id(job_id) {
        return Err(format!("invalid job id '{}'", job_id));
    }
    Ok(state_dir.join(job_id).join("events.jsonl"))
}

/// Append an event to the job's event log.
pub fn append_event(state_dir: &Path, job_id: &str, event: ExecutionEvent) -> Result<(), String> {
    let path = event_log_path(state_dir, job_id)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read a job's events in append order. Missing log is empty.
pub fn read_events(state_dir: &Path, job_id: &str) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(state_dir, job_id)?;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| format!("{}:{}: invalid event: {}", path.display(), i + 1, e))
        })
        .collect()
}

/// Optional sink used by the executor, recovery and write-back worker.
/// Logging failures are reported through tracing and never fail a row.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    state_dir: Option<PathBuf>,
}

impl EventSink {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { state_dir: None }
    }

    pub fn emit(&self, job_id: &str, event: ExecutionEvent) {
        if let Some(dir) = &self.state_dir {
            if let Err(e) = append_event(dir, job_id, event) {
                tracing::warn!(job = job_id, error = %e, "event log append failed");
            }
        }
    }
}
