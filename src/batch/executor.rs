//! DT-017: Per-row execution around one side-effecting gateway call.
//!
//! Ordering per row:
//! 1. `pending -> in_flight` is durable before the gateway is called.
//! 2. The gateway reference is durable before the artifact is promoted.
//! 3. `completed` and its write-back task commit together.
//!
//! A crash between any two steps leaves the row `in_flight` with as much
//! evidence as was recorded, which is what recovery works from. The
//! executor never retries a row whose effect it cannot disprove.
//!
//! Store and artifact writes are synchronous and run on tokio's blocking
//! pool; only the gateway call runs on the async workers.

use super::artifacts::ArtifactStore;
use super::store::{RowStore, StoreError};
use super::types::{BatchResult, RowRecord, RowStatus};
use crate::gateway::{CreateReceipt, Gateway, GatewayError};
use crate::tripwire::eventlog::{EventSink, ExecutionEvent};
use crate::tripwire::hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Error code for a gateway call whose outcome is unknown.
pub const CODE_OUTCOME_UNKNOWN: &str = "OUTCOME_UNKNOWN";
pub const CODE_LOCAL_WRITE_FAILED: &str = "LOCAL_WRITE_FAILED";
pub const CODE_ARTIFACT_WRITE_FAILED: &str = "ARTIFACT_WRITE_FAILED";

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Rows are still `in_flight` from an earlier run.
    #[error("job {job_id} has {in_flight} in-flight row(s); run recovery first")]
    RecoveryRequired { job_id: String, in_flight: usize },

    #[error("concurrency must be > 0")]
    ZeroConcurrency,

    #[error("blocking store task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Completed,
    Failed,
    NeedsReview,
    NotDispatched,
    StuckInFlight,
}

/// Bounded-concurrency batch executor.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn RowStore>,
    gateway: Arc<dyn Gateway>,
    artifacts: Option<ArtifactStore>,
    events: EventSink,
    concurrency: usize,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(store: Arc<dyn RowStore>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            store,
            gateway,
            artifacts: None,
            events: EventSink::disabled(),
            concurrency: DEFAULT_CONCURRENCY,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Setting the flag stops new rows from entering `in_flight`.
    /// Rows already dispatched run to completion.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Dispatch every `pending` row of `job_id`.
    pub async fn run(&self, job_id: &str) -> Result<BatchResult, ExecError> {
        if self.concurrency == 0 {
            return Err(ExecError::ZeroConcurrency);
        }
        let store = Arc::clone(&self.store);
        let job = job_id.to_string();
        let (summary, pending) = task::spawn_blocking(move || {
            let summary = store.summary(&job)?;
            let pending = store.rows_in_status(Some(&job), RowStatus::Pending)?;
            Ok::<_, StoreError>((summary, pending))
        })
        .await??;
        if summary.is_interrupted() {
            return Err(ExecError::RecoveryRequired {
                job_id: job_id.to_string(),
                in_flight: summary.in_flight,
            });
        }

        let started = Instant::now();
        tracing::info!(job = job_id, pending = pending.len(), concurrency = self.concurrency, "batch started");
        self.events.emit(
            job_id,
            ExecutionEvent::BatchStarted {
                job_id: job_id.to_string(),
                pending: pending.len(),
            },
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for row in pending {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return RowOutcome::NotDispatched;
                };
                this.process_row(row).await
            });
        }

        let mut result = BatchResult {
            job_id: job_id.to_string(),
            ..BatchResult::default()
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(RowOutcome::Completed) => result.completed += 1,
                Ok(RowOutcome::Failed) => result.failed += 1,
                Ok(RowOutcome::NeedsReview) => result.needs_review += 1,
                Ok(RowOutcome::NotDispatched) => result.not_dispatched += 1,
                Ok(RowOutcome::StuckInFlight) => result.stuck_in_flight += 1,
                Err(e) => {
                    tracing::error!(job = job_id, error = %e, "row task aborted");
                    result.stuck_in_flight += 1;
                }
            }
        }
        result.cancelled = self.cancel.load(Ordering::SeqCst);
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        tracing::info!(
            job = job_id,
            completed = result.completed,
            failed = result.failed,
            needs_review = result.needs_review,
            not_dispatched = result.not_dispatched,
            "batch finished"
        );
        self.events.emit(
            job_id,
            ExecutionEvent::BatchFinished {
                job_id: job_id.to_string(),
                completed: result.completed,
                failed: result.failed,
                needs_review: result.needs_review,
                not_dispatched: result.not_dispatched,
                cancelled: result.cancelled,
                duration_ms: result.duration_ms,
            },
        );
        Ok(result)
    }

    async fn process_row(&self, row: RowRecord) -> RowOutcome {
        let job = row.job_id.clone();
        let n = row.row_number;
        if self.cancel.load(Ordering::SeqCst) {
            return RowOutcome::NotDispatched;
        }
        let dispatched = {
            let this = self.clone();
            let row = row.clone();
            task::spawn_blocking(move || this.dispatch(&row)).await
        };
        match dispatched {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(job = %job, row = n, error = %e, "row not dispatched");
                return RowOutcome::NotDispatched;
            }
            // The dispatch may have committed before the task died.
            Err(e) => {
                tracing::error!(job = %job, row = n, error = %e, "dispatch task aborted");
                return RowOutcome::StuckInFlight;
            }
        }

        let created = self.gateway.create(&row.payload, &row.idempotency_key).await;
        let this = self.clone();
        match task::spawn_blocking(move || this.record_outcome(&row, created)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job = %job, row = n, error = %e, "row task aborted after gateway call");
                RowOutcome::StuckInFlight
            }
        }
    }

    /// `pending -> in_flight`, then the dispatch event.
    fn dispatch(&self, row: &RowRecord) -> Result<(), StoreError> {
        let job = row.job_id.as_str();
        self.store.begin_dispatch(job, row.row_number)?;
        self.events.emit(
            job,
            ExecutionEvent::RowDispatched {
                job_id: job.to_string(),
                row_number: row.row_number,
                idempotency_key: row.idempotency_key.clone(),
            },
        );
        Ok(())
    }

    fn record_outcome(
        &self,
        row: &RowRecord,
        created: Result<CreateReceipt, GatewayError>,
    ) -> RowOutcome {
        match created {
            Ok(receipt) => self.finalize(row, receipt),
            Err(GatewayError::Rejected { code, message }) => {
                self.settle(row, RowStatus::Failed, &code, &message)
            }
            Err(GatewayError::Transport(message)) => {
                self.settle(row, RowStatus::NeedsReview, CODE_OUTCOME_UNKNOWN, &message)
            }
        }
    }

    fn finalize(&self, row: &RowRecord, receipt: CreateReceipt) -> RowOutcome {
        let job = row.job_id.as_str();
        let n = row.row_number;
        let reference = receipt.external_reference.as_str();

        if let Err(e) = self.store.record_external_reference(job, n, reference) {
            return self.settle(
                row,
                RowStatus::NeedsReview,
                CODE_LOCAL_WRITE_FAILED,
                &format!("effect {} created but not recorded: {}", reference, e),
            );
        }

        let mut artifact_hash = None;
        if let (Some(bytes), Some(artifacts)) = (receipt.artifact.as_deref(), &self.artifacts) {
            let promoted = artifacts
                .stage(job, n, reference, bytes)
                .and_then(|staged| artifacts.promote(job, &staged));
            let path = match promoted {
                Ok(p) => p,
                Err(e) => {
                    return self.settle(
                        row,
                        RowStatus::NeedsReview,
                        CODE_ARTIFACT_WRITE_FAILED,
                        &e.to_string(),
                    )
                }
            };
            artifact_hash = hasher::hash_file(&path).ok();
            if let Err(e) = self.store.record_artifact(job, n, &path.to_string_lossy()) {
                return self.settle(row, RowStatus::NeedsReview, CODE_LOCAL_WRITE_FAILED, &e.to_string());
            }
        }

        if let Err(e) = self.store.complete_row(job, n) {
            return self.settle(row, RowStatus::NeedsReview, CODE_LOCAL_WRITE_FAILED, &e.to_string());
        }
        tracing::debug!(job, row = n, reference, "row completed");
        self.events.emit(
            job,
            ExecutionEvent::RowCompleted {
                job_id: job.to_string(),
                row_number: n,
                external_reference: reference.to_string(),
                artifact_hash,
            },
        );
        RowOutcome::Completed
    }

    /// Move an in-flight row to `failed` or `needs_review`. If that write
    /// fails too, the row stays `in_flight` for recovery.
    fn settle(&self, row: &RowRecord, to: RowStatus, code: &str, message: &str) -> RowOutcome {
        let job = row.job_id.as_str();
        let n = row.row_number;
        if let Err(e) = self.store.fail_row(job, n, to, code, message) {
            tracing::error!(job, row = n, error = %e, "row left in flight");
            return RowOutcome::StuckInFlight;
        }
        tracing::warn!(job, row = n, status = %to, code, message, "row not completed");
        let event = if to == RowStatus::Failed {
            ExecutionEvent::RowFailed {
                job_id: job.to_string(),
                row_number: n,
                code: code.to_string(),
                message: message.to_string(),
            }
        } else {
            ExecutionEvent::RowNeedsReview {
                job_id: job.to_string(),
                row_number: n,
                code: code.to_string(),
                message: message.to_string(),
            }
        };
        self.events.emit(job, event);
        if to == RowStatus::Failed {
            RowOutcome::Failed
        } else {
            RowOutcome::NeedsReview
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::planner::plan_job;
    use crate::batch::store::SqliteRowStore;
    use crate::batch::testing::{source_rows, CrashingStore};
    use crate::batch::types::WriteBackStatus;
    use crate::gateway::memory::{CreateScript, MemoryGateway};
    use crate::tripwire::eventlog::read_events;

    fn setup(rows: u64) -> (Arc<SqliteRowStore>, Arc<MemoryGateway>) {
        let store = Arc::new(SqliteRowStore::open_in_memory().unwrap());
        plan_job(store.as_ref(), "job", &source_rows(rows)).unwrap();
        (store, Arc::new(MemoryGateway::new()))
    }

    fn key_prefix(row: u64) -> String {
        format!("job:{}:", row)
    }

    // One runtime thread: a store write that blocked it would keep the
    // second row from ever reaching complete_row while the first waits.
    #[tokio::test(flavor = "current_thread")]
    async fn test_dt017_store_writes_leave_runtime_free() {
        let (inner, gw) = setup(2);
        let store = Arc::new(CrashingStore::new(inner.clone()).rendezvous_on_complete(2));
        let result = Executor::new(store.clone(), gw)
            .with_concurrency(2)
            .run("job")
            .await
            .unwrap();
        assert!(store.rendezvous_met());
        assert_eq!(result.completed, 2);
        assert_eq!(inner.summary("job").unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_dt017_all_rows_complete() {
        let (store, gw) = setup(10);
        let result = Executor::new(store.clone(), gw.clone()).run("job").await.unwrap();
        assert_eq!(result.completed, 10);
        assert_eq!(gw.create_calls(), 10);
        assert!(store
            .job_rows("job")
            .unwrap()
            .iter()
            .all(|r| r.status == RowStatus::Completed && r.external_reference.is_some()));
        let tasks = store.write_backs(Some("job")).unwrap();
        assert_eq!(tasks.len(), 10);
        assert!(tasks.iter().all(|t| t.status == WriteBackStatus::Pending));
    }

    #[tokio::test]
    async fn test_dt017_gateway_outcomes() {
        let (store, gw) = setup(4);
        gw.script(
            key_prefix(2),
            CreateScript::Reject {
                code: "INVALID_ADDRESS".into(),
                message: "zip mismatch".into(),
            },
        );
        gw.script(key_prefix(3), CreateScript::TransportBeforeEffect);
        gw.script(key_prefix(4), CreateScript::TransportAfterEffect);

        let result = Executor::new(store.clone(), gw.clone()).run("job").await.unwrap();
        assert_eq!((result.completed, result.failed, result.needs_review), (1, 1, 2));

        let row = |n| store.get_row("job", n).unwrap().unwrap();
        assert_eq!(row(2).status, RowStatus::Failed);
        assert_eq!(row(2).error_code.as_deref(), Some("INVALID_ADDRESS"));
        assert_eq!(row(3).status, RowStatus::NeedsReview);
        assert_eq!(row(3).error_code.as_deref(), Some(CODE_OUTCOME_UNKNOWN));
        assert_eq!(row(4).status, RowStatus::NeedsReview);
        assert_eq!(store.write_backs(Some("job")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dt017_rerun_skips_settled_rows() {
        let (store, gw) = setup(3);
        gw.script(
            key_prefix(1),
            CreateScript::Reject {
                code: "X".into(),
                message: "no".into(),
            },
        );
        let exec = Executor::new(store.clone(), gw.clone());
        exec.run("job").await.unwrap();
        assert_eq!(gw.create_calls(), 3);

        let again = exec.run("job").await.unwrap();
        assert_eq!(again.completed + again.failed + again.needs_review, 0);
        assert_eq!(gw.create_calls(), 3);

        gw.clear_scripts();
        store.retry_row("job", 1).unwrap();
        let retried = exec.run("job").await.unwrap();
        assert_eq!(retried.completed, 1);
        assert_eq!(gw.create_calls(), 4);
    }

    #[tokio::test]
    async fn test_dt017_refuses_interrupted_job() {
        let (store, gw) = setup(2);
        store.begin_dispatch("job", 1).unwrap();
        let err = Executor::new(store.clone(), gw.clone()).run("job").await.unwrap_err();
        assert!(matches!(err, ExecError::RecoveryRequired { in_flight: 1, .. }));
        assert_eq!(gw.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_dt017_cancel_before_dispatch() {
        let (store, gw) = setup(5);
        let exec = Executor::new(store.clone(), gw.clone());
        exec.cancel_handle().store(true, Ordering::SeqCst);
        let result = exec.run("job").await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.not_dispatched, 5);
        assert_eq!(gw.create_calls(), 0);
        assert_eq!(store.summary("job").unwrap().pending, 5);
    }

    #[tokio::test]
    async fn test_dt017_zero_concurrency_rejected() {
        let (store, gw) = setup(1);
        let exec = Executor::new(store, gw).with_concurrency(0);
        assert!(matches!(exec.run("job").await, Err(ExecError::ZeroConcurrency)));
    }

    #[tokio::test]
    async fn test_dt017_artifacts_promoted_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = setup(2);
        let gw = Arc::new(MemoryGateway::new().with_artifacts());
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        let exec = Executor::new(store.clone(), gw)
            .with_artifacts(artifacts.clone())
            .with_events(EventSink::new(dir.path()))
            .with_concurrency(1);
        exec.run("job").await.unwrap();

        for r in store.job_rows("job").unwrap() {
            let path = r.artifact_path.expect("artifact recorded");
            assert!(artifacts.exists(&path));
        }
        assert!(artifacts.staged("job").unwrap().is_empty());

        let events = read_events(dir.path(), "job").unwrap();
        assert!(matches!(events.first().map(|e| &e.event), Some(ExecutionEvent::BatchStarted { pending: 2, .. })));
        assert!(events.iter().any(|e| matches!(
            &e.event,
            ExecutionEvent::RowCompleted { artifact_hash: Some(h), .. } if h.starts_with("blake3:")
        )));
        assert!(matches!(events.last().map(|e| &e.event), Some(ExecutionEvent::BatchFinished { completed: 2, .. })));
    }

    #[tokio::test]
    async fn test_dt017_local_failure_after_effect_needs_review() {
        let (inner, gw) = setup(3);
        let store = Arc::new(CrashingStore::new(inner.clone()).fail_complete(2));
        let result = Executor::new(store, gw.clone()).run("job").await.unwrap();
        assert_eq!((result.completed, result.needs_review), (2, 1));
        let row = inner.get_row("job", 2).unwrap().unwrap();
        assert_eq!(row.status, RowStatus::NeedsReview);
        assert_eq!(row.error_code.as_deref(), Some(CODE_LOCAL_WRITE_FAILED));
        assert!(row.external_reference.is_some());
    }

    #[tokio::test]
    async fn test_dt017_unwritable_row_stays_in_flight() {
        let (inner, gw) = setup(3);
        let store = Arc::new(CrashingStore::new(inner.clone()).crash_after_dispatch(2));
        let result = Executor::new(store, gw.clone()).run("job").await.unwrap();
        assert_eq!(result.completed, 2);
        assert_eq!(result.stuck_in_flight, 1);
        let row = inner.get_row("job", 2).unwrap().unwrap();
        assert_eq!(row.status, RowStatus::InFlight);
        assert!(row.external_reference.is_none());
        assert_eq!(gw.effect_count(), 3);
    }
}
