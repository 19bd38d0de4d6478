//! DT-011: Batch execution types: row lifecycle, write-back tasks, reports.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Row lifecycle
// ============================================================================

/// Per-row execution state.
///
/// ```text
/// pending -> in_flight -> completed | failed | needs_review
/// failed  -> pending          (explicit operator retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
    NeedsReview,
}

impl RowStatus {
    pub const ALL: [RowStatus; 5] = [
        RowStatus::Pending,
        RowStatus::InFlight,
        RowStatus::Completed,
        RowStatus::Failed,
        RowStatus::NeedsReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
        }
    }

    /// Unknown strings are rejected rather than defaulted.
    pub fn from_str_checked(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn can_transition_to(&self, to: RowStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Completed)
                | (Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::NeedsReview)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row ready to be planned into a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRow {
    pub job_id: String,
    pub row_number: u64,
    pub idempotency_key: String,
    pub row_checksum: String,
    pub payload: serde_json::Value,
}

/// Durable row record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub job_id: String,
    pub row_number: u64,
    pub status: RowStatus,
    pub idempotency_key: String,
    pub row_checksum: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub recovery_attempts: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Row counts per status for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub needs_review: usize,
}

impl JobSummary {
    pub fn count(&mut self, status: RowStatus, n: usize) {
        self.total += n;
        match status {
            RowStatus::Pending => self.pending += n,
            RowStatus::InFlight => self.in_flight += n,
            RowStatus::Completed => self.completed += n,
            RowStatus::Failed => self.failed += n,
            RowStatus::NeedsReview => self.needs_review += n,
        }
    }

    /// A job with in-flight rows was interrupted and must be recovered
    /// before anything else touches it.
    pub fn is_interrupted(&self) -> bool {
        self.in_flight > 0
    }
}

// ============================================================================
// Write-back queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteBackStatus {
    Pending,
    Completed,
    DeadLetter,
}

impl WriteBackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub fn from_str_checked(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

impl fmt::Display for WriteBackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed side effect to propagate to the system of record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBackTask {
    pub id: i64,
    pub job_id: String,
    pub row_number: u64,
    pub external_reference: String,
    pub completed_at: String,
    pub status: WriteBackStatus,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one executor run over a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_id: String,
    pub completed: usize,
    pub failed: usize,
    pub needs_review: usize,
    /// Rows left `pending` by cancellation.
    pub not_dispatched: usize,
    /// Rows whose post-dispatch write failed; they stay `in_flight`.
    pub stuck_in_flight: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Which recovery path handled a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTier {
    /// External reference recorded; verified with the gateway.
    VerifyReference,
    /// No reference; looked up by idempotency key.
    LookupByKey,
    /// Verification itself failed; decision deferred.
    Deferred,
}

impl RecoveryTier {
    pub fn number(&self) -> u8 {
        match self {
            Self::VerifyReference => 1,
            Self::LookupByKey => 2,
            Self::Deferred => 3,
        }
    }
}

impl fmt::Display for RecoveryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Completed,
    NeedsReview,
    StillInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredRow {
    pub row_number: u64,
    pub tier: RecoveryTier,
    pub outcome: RecoveryOutcome,
    pub idempotency_key: String,
    pub detail: String,
}

/// Per-job reconciliation report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub job_id: String,
    pub recovered: usize,
    pub needs_review: usize,
    pub unresolved: usize,
    pub rows: Vec<RecoveredRow>,
}

impl RecoveryReport {
    pub fn push(&mut self, row: RecoveredRow) {
        match row.outcome {
            RecoveryOutcome::Completed => self.recovered += 1,
            RecoveryOutcome::NeedsReview => self.needs_review += 1,
            RecoveryOutcome::StillInFlight => self.unresolved += 1,
        }
        self.rows.push(row);
    }
}
