//! DT-018: Startup reconciliation of interrupted rows.
//!
//! An `in_flight` row is one whose gateway call may or may not have taken
//! effect. Recovery only ever moves such a row to `completed` (effect
//! proven) or `needs_review` (effect unprovable); it never returns a row to
//! `pending`.
//!
//! | tier | evidence                  | gateway answer          | row          |
//! |------|---------------------------|-------------------------|--------------|
//! | 1    | external reference        | found                   | completed    |
//! | 1    | external reference        | not found               | needs_review |
//! | 2    | idempotency key only      | found                   | completed    |
//! | 2    | idempotency key only      | not found / unsupported | needs_review |
//! | 3    | verification call failed  | -                       | in_flight    |
//!
//! Tier-3 rows are retried on the next pass and escalate to `needs_review`
//! after `max_attempts` deferrals.

use super::artifacts::ArtifactStore;
use super::store::{RowStore, StoreError};
use super::types::*;
use crate::gateway::{Gateway, Lookup};
use crate::tripwire::eventlog::{EventSink, ExecutionEvent};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

pub const CODE_EFFECT_NOT_FOUND: &str = "EFFECT_NOT_FOUND";
pub const CODE_EFFECT_UNVERIFIABLE: &str = "EFFECT_UNVERIFIABLE";
pub const CODE_ARTIFACT_MISSING: &str = "ARTIFACT_MISSING";
pub const CODE_RECOVERY_EXHAUSTED: &str = "RECOVERY_ATTEMPTS_EXHAUSTED";

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] super::artifacts::ArtifactError),
}

/// Result of a full recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPass {
    pub reports: Vec<RecoveryReport>,
    pub staging_files_removed: usize,
}

pub struct RecoveryCoordinator {
    store: Arc<dyn RowStore>,
    gateway: Arc<dyn Gateway>,
    artifacts: Option<ArtifactStore>,
    events: EventSink,
    max_attempts: u32,
}

/// What one row's verification concluded, before it is persisted.
enum Verdict {
    Complete { reference: Option<String>, detail: String },
    Review { code: &'static str, detail: String },
    Defer { detail: String },
}

impl RecoveryCoordinator {
    pub fn new(store: Arc<dyn RowStore>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            store,
            gateway,
            artifacts: None,
            events: EventSink::disabled(),
            max_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Recover every job with in-flight rows, then clear orphaned staging.
    pub async fn recover_all(&self) -> Result<RecoveryPass, RecoveryError> {
        let jobs: BTreeSet<String> = self
            .store
            .rows_in_status(None, RowStatus::InFlight)?
            .into_iter()
            .map(|r| r.job_id)
            .collect();
        let mut pass = RecoveryPass::default();
        for job in &jobs {
            pass.reports.push(self.recover_job(job).await?);
        }
        pass.staging_files_removed = self.cleanup_staging()?;
        tracing::info!(
            jobs = pass.reports.len(),
            staging_removed = pass.staging_files_removed,
            "recovery pass finished"
        );
        Ok(pass)
    }

    /// Reconcile the in-flight rows of one job.
    pub async fn recover_job(&self, job_id: &str) -> Result<RecoveryReport, RecoveryError> {
        let rows = self.store.rows_in_status(Some(job_id), RowStatus::InFlight)?;
        let mut report = RecoveryReport {
            job_id: job_id.to_string(),
            ..RecoveryReport::default()
        };
        for row in rows {
            let (tier, verdict) = self.verify(&row).await;
            let recovered = self.apply(&row, tier, verdict);
            tracing::info!(
                job = job_id,
                row = row.row_number,
                tier = tier.number(),
                outcome = ?recovered.outcome,
                "row recovered"
            );
            self.events.emit(
                job_id,
                ExecutionEvent::RowRecovered {
                    job_id: job_id.to_string(),
                    row_number: row.row_number,
                    tier: tier.number(),
                    outcome: format!("{:?}", recovered.outcome),
                    detail: recovered.detail.clone(),
                },
            );
            report.push(recovered);
        }
        Ok(report)
    }

    async fn verify(&self, row: &RowRecord) -> (RecoveryTier, Verdict) {
        match &row.external_reference {
            Some(reference) => match self.gateway.query(reference).await {
                Ok(Lookup::Found { .. }) => {
                    let artifact_missing = match (&row.artifact_path, &self.artifacts) {
                        (Some(path), Some(store)) => !store.exists(path),
                        (Some(path), None) => !std::path::Path::new(path).is_file(),
                        (None, _) => false,
                    };
                    if artifact_missing {
                        (
                            RecoveryTier::VerifyReference,
                            Verdict::Review {
                                code: CODE_ARTIFACT_MISSING,
                                detail: format!(
                                    "effect {} exists but its artifact is missing",
                                    reference
                                ),
                            },
                        )
                    } else {
                        (
                            RecoveryTier::VerifyReference,
                            Verdict::Complete {
                                reference: None,
                                detail: format!("effect {} confirmed", reference),
                            },
                        )
                    }
                }
                Ok(Lookup::NotFound) => (
                    RecoveryTier::VerifyReference,
                    Verdict::Review {
                        code: CODE_EFFECT_NOT_FOUND,
                        detail: format!("gateway has no effect {}", reference),
                    },
                ),
                Ok(Lookup::Unsupported) => (
                    RecoveryTier::VerifyReference,
                    Verdict::Review {
                        code: CODE_EFFECT_UNVERIFIABLE,
                        detail: format!("gateway cannot verify {}", reference),
                    },
                ),
                Err(e) => (
                    RecoveryTier::Deferred,
                    Verdict::Defer {
                        detail: format!("verifying {}: {}", reference, e),
                    },
                ),
            },
            None => match self
                .gateway
                .find_by_idempotency_key(&row.idempotency_key)
                .await
            {
                Ok(Lookup::Found { external_reference }) => (
                    RecoveryTier::LookupByKey,
                    Verdict::Complete {
                        detail: format!("effect {} found by idempotency key", external_reference),
                        reference: Some(external_reference),
                    },
                ),
                Ok(Lookup::NotFound) => (
                    RecoveryTier::LookupByKey,
                    Verdict::Review {
                        code: CODE_EFFECT_NOT_FOUND,
                        detail: format!(
                            "no effect recorded for {}; check the gateway before retrying",
                            row.idempotency_key
                        ),
                    },
                ),
                Ok(Lookup::Unsupported) => (
                    RecoveryTier::LookupByKey,
                    Verdict::Review {
                        code: CODE_EFFECT_UNVERIFIABLE,
                        detail: format!(
                            "gateway cannot search by key; look up {} manually",
                            row.idempotency_key
                        ),
                    },
                ),
                Err(e) => (
                    RecoveryTier::Deferred,
                    Verdict::Defer {
                        detail: format!("looking up {}: {}", row.idempotency_key, e),
                    },
                ),
            },
        }
    }

    fn apply(&self, row: &RowRecord, tier: RecoveryTier, verdict: Verdict) -> RecoveredRow {
        let job = row.job_id.as_str();
        let n = row.row_number;
        let entry = |outcome, detail: String| RecoveredRow {
            row_number: n,
            tier,
            outcome,
            idempotency_key: row.idempotency_key.clone(),
            detail,
        };
        let review = |code: &str, detail: String| match self.store.fail_row(
            job,
            n,
            RowStatus::NeedsReview,
            code,
            &detail,
        ) {
            Ok(()) => entry(RecoveryOutcome::NeedsReview, detail),
            Err(e) => entry(
                RecoveryOutcome::StillInFlight,
                format!("{} (not persisted: {})", detail, e),
            ),
        };

        match verdict {
            Verdict::Complete { reference, detail } => {
                let persisted = match &reference {
                    Some(r) => self.store.record_external_reference(job, n, r),
                    None => Ok(()),
                }
                .and_then(|()| self.store.complete_row(job, n));
                match persisted {
                    Ok(()) => entry(RecoveryOutcome::Completed, detail),
                    Err(e) => entry(
                        RecoveryOutcome::StillInFlight,
                        format!("{} (not persisted: {})", detail, e),
                    ),
                }
            }
            Verdict::Review { code, detail } => review(code, detail),
            Verdict::Defer { detail } => match self.store.bump_recovery_attempts(job, n) {
                Ok(attempts) if attempts >= self.max_attempts => review(
                    CODE_RECOVERY_EXHAUSTED,
                    format!("{} after {} attempts: {}", CODE_RECOVERY_EXHAUSTED, attempts, detail),
                ),
                Ok(attempts) => entry(
                    RecoveryOutcome::StillInFlight,
                    format!("attempt {}/{}: {}", attempts, self.max_attempts, detail),
                ),
                Err(e) => entry(
                    RecoveryOutcome::StillInFlight,
                    format!("{} (attempt not counted: {})", detail, e),
                ),
            },
        }
    }

    /// Remove staged artifacts of jobs that have nothing left to reconcile.
    /// Jobs with `in_flight` or `needs_review` rows keep their staging.
    pub fn cleanup_staging(&self) -> Result<usize, RecoveryError> {
        let Some(artifacts) = &self.artifacts else {
            return Ok(0);
        };
        let mut removed = 0;
        for job in artifacts.staged_jobs()? {
            let summary = self.store.summary(&job)?;
            if summary.in_flight > 0 || summary.needs_review > 0 {
                tracing::debug!(job = %job, "staging kept for unresolved job");
                continue;
            }
            let files = artifacts.clear_staging(&job)?;
            removed += files;
            self.events.emit(
                &job,
                ExecutionEvent::StagingCleared {
                    job_id: job.clone(),
                    files,
                },
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::executor::Executor;
    use crate::batch::planner::plan_job;
    use crate::batch::store::SqliteRowStore;
    use crate::batch::testing::{source_rows, CrashingStore};
    use crate::gateway::memory::MemoryGateway;

    fn planned(rows: u64) -> Arc<SqliteRowStore> {
        let store = Arc::new(SqliteRowStore::open_in_memory().unwrap());
        plan_job(store.as_ref(), "job", &source_rows(rows)).unwrap();
        store
    }

    fn status(store: &SqliteRowStore, n: u64) -> RowStatus {
        store.get_row("job", n).unwrap().unwrap().status
    }

    /// Ten rows; the process dies while row 5 is in flight.
    async fn crash_on_row_5(gw: Arc<MemoryGateway>) -> Arc<SqliteRowStore> {
        let store = planned(10);
        let crashing = Arc::new(CrashingStore::new(store.clone()).crash_after_dispatch(5));
        let result = Executor::new(crashing, gw).run("job").await.unwrap();
        assert_eq!(result.completed, 9);
        assert_eq!(result.stuck_in_flight, 1);
        store
    }

    #[tokio::test]
    async fn test_dt018_crash_mid_batch_tier2_completes() {
        let gw = Arc::new(MemoryGateway::new().with_key_lookup());
        let store = crash_on_row_5(gw.clone()).await;
        assert_eq!(status(&store, 5), RowStatus::InFlight);

        let rc = RecoveryCoordinator::new(store.clone(), gw.clone());
        let report = rc.recover_job("job").await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.rows[0].tier, RecoveryTier::LookupByKey);

        let row5 = store.get_row("job", 5).unwrap().unwrap();
        assert_eq!(row5.status, RowStatus::Completed);
        assert!(row5.external_reference.is_some());
        for n in (1..=10).filter(|n| *n != 5) {
            assert_eq!(status(&store, n), RowStatus::Completed);
        }
        assert_eq!(store.write_backs(Some("job")).unwrap().len(), 10);
        // One effect per row; recovery never called create.
        assert_eq!(gw.effect_count(), 10);
        assert_eq!(gw.create_calls(), 10);
    }

    #[tokio::test]
    async fn test_dt018_crash_mid_batch_no_lookup_needs_review() {
        let gw = Arc::new(MemoryGateway::new());
        let store = crash_on_row_5(gw.clone()).await;
        let report = RecoveryCoordinator::new(store.clone(), gw)
            .recover_job("job")
            .await
            .unwrap();
        assert_eq!(report.needs_review, 1);
        let entry = &report.rows[0];
        assert_eq!(entry.row_number, 5);
        assert!(entry.idempotency_key.starts_with("job:5:"));
        assert_eq!(status(&store, 5), RowStatus::NeedsReview);
        assert_eq!(status(&store, 4), RowStatus::Completed);
        assert_eq!(status(&store, 6), RowStatus::Completed);
    }

    #[tokio::test]
    async fn test_dt018_tier1_confirmed_and_denied() {
        let store = planned(2);
        let gw = Arc::new(MemoryGateway::new());
        for n in [1, 2] {
            let key = store.get_row("job", n).unwrap().unwrap().idempotency_key;
            let reference = gw.seed_effect(&key);
            store.begin_dispatch("job", n).unwrap();
            store.record_external_reference("job", n, &reference).unwrap();
        }
        gw.void("EXT-000002");

        let report = RecoveryCoordinator::new(store.clone(), gw)
            .recover_job("job")
            .await
            .unwrap();
        assert_eq!((report.recovered, report.needs_review), (1, 1));
        assert!(report.rows.iter().all(|r| r.tier == RecoveryTier::VerifyReference));
        assert_eq!(status(&store, 1), RowStatus::Completed);
        let row2 = store.get_row("job", 2).unwrap().unwrap();
        assert_eq!(row2.status, RowStatus::NeedsReview);
        assert_eq!(row2.error_code.as_deref(), Some(CODE_EFFECT_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_dt018_no_reference_never_pending() {
        let store = planned(1);
        store.begin_dispatch("job", 1).unwrap();
        let gw = Arc::new(MemoryGateway::new().with_key_lookup());
        RecoveryCoordinator::new(store.clone(), gw)
            .recover_job("job")
            .await
            .unwrap();
        assert_eq!(status(&store, 1), RowStatus::NeedsReview);
    }

    #[tokio::test]
    async fn test_dt018_missing_artifact_needs_review() {
        let dir = tempfile::tempdir().unwrap();
        let store = planned(1);
        let gw = Arc::new(MemoryGateway::new());
        let key = store.get_row("job", 1).unwrap().unwrap().idempotency_key;
        let reference = gw.seed_effect(&key);
        store.begin_dispatch("job", 1).unwrap();
        store.record_external_reference("job", 1, &reference).unwrap();
        let gone = dir.path().join("artifacts/job/label.pdf");
        store.record_artifact("job", 1, &gone.to_string_lossy()).unwrap();

        let report = RecoveryCoordinator::new(store.clone(), gw)
            .with_artifacts(ArtifactStore::new(dir.path().join("artifacts")))
            .recover_job("job")
            .await
            .unwrap();
        assert_eq!(report.needs_review, 1);
        let row = store.get_row("job", 1).unwrap().unwrap();
        assert_eq!(row.error_code.as_deref(), Some(CODE_ARTIFACT_MISSING));
    }

    #[tokio::test]
    async fn test_dt018_tier3_defers_then_escalates() {
        let store = planned(1);
        store.begin_dispatch("job", 1).unwrap();
        store.record_external_reference("job", 1, "EXT-000001").unwrap();
        let gw = Arc::new(MemoryGateway::new());
        gw.set_query_unavailable(true);
        let rc = RecoveryCoordinator::new(store.clone(), gw).with_max_attempts(3);

        for attempt in 1..=2u32 {
            let report = rc.recover_job("job").await.unwrap();
            assert_eq!(report.unresolved, 1);
            assert_eq!(report.rows[0].tier, RecoveryTier::Deferred);
            let row = store.get_row("job", 1).unwrap().unwrap();
            assert_eq!(row.status, RowStatus::InFlight);
            assert_eq!(row.recovery_attempts, attempt);
        }
        let report = rc.recover_job("job").await.unwrap();
        assert_eq!(report.needs_review, 1);
        let row = store.get_row("job", 1).unwrap().unwrap();
        assert_eq!(row.error_code.as_deref(), Some(CODE_RECOVERY_EXHAUSTED));
    }

    #[tokio::test]
    async fn test_dt018_tier3_resolves_when_gateway_returns() {
        let store = planned(1);
        let gw = Arc::new(MemoryGateway::new());
        let key = store.get_row("job", 1).unwrap().unwrap().idempotency_key;
        let reference = gw.seed_effect(&key);
        store.begin_dispatch("job", 1).unwrap();
        store.record_external_reference("job", 1, &reference).unwrap();

        let rc = RecoveryCoordinator::new(store.clone(), gw.clone());
        gw.set_query_unavailable(true);
        assert_eq!(rc.recover_job("job").await.unwrap().unresolved, 1);
        gw.set_query_unavailable(false);
        assert_eq!(rc.recover_job("job").await.unwrap().recovered, 1);
        assert_eq!(status(&store, 1), RowStatus::Completed);
    }

    #[tokio::test]
    async fn test_dt018_staging_cleanup_respects_unresolved_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path());
        let store = Arc::new(SqliteRowStore::open_in_memory().unwrap());
        plan_job(store.as_ref(), "clean", &source_rows(1)).unwrap();
        plan_job(store.as_ref(), "stuck", &source_rows(1)).unwrap();
        store.begin_dispatch("stuck", 1).unwrap();
        artifacts.stage("clean", 1, "EXT-1", b"a").unwrap();
        artifacts.stage("stuck", 1, "EXT-2", b"b").unwrap();

        let gw = Arc::new(MemoryGateway::new());
        gw.set_query_unavailable(true);
        let rc = RecoveryCoordinator::new(store.clone(), gw).with_artifacts(artifacts.clone());
        let pass = rc.recover_all().await.unwrap();

        assert_eq!(pass.reports.len(), 1);
        assert_eq!(pass.reports[0].job_id, "stuck");
        assert_eq!(pass.staging_files_removed, 1);
        assert_eq!(artifacts.staged_jobs().unwrap(), vec!["stuck"]);
    }
}
