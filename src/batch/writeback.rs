//! DT-019: Durable write-back of external references to the system of record.
//!
//! Tasks are enqueued in the same transaction that completes a row, so a
//! completed row always has a task. The worker drains pending tasks in
//! `(job_id, row_number)` order. A failing task is retried on later drains
//! and dead-lettered after `max_retries` attempts; it never blocks the tasks
//! behind it.

use super::store::{RowStore, StoreError};
use super::types::{WriteBackStatus, WriteBackTask};
use crate::core::config::WriteBackConfig;
use crate::gateway::SystemOfRecord;
use crate::tripwire::eventlog::{EventSink, ExecutionEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Counts for one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub processed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Tasks whose outcome could not be written back to the store. They stay
    /// pending and are picked up again by the next drain.
    pub unrecorded: usize,
}

impl DrainSummary {
    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.failed == 0 && self.dead_lettered == 0 && self.unrecorded == 0
    }
}

pub struct WriteBackWorker {
    store: Arc<dyn RowStore>,
    sink: Arc<dyn SystemOfRecord>,
    events: EventSink,
    max_retries: u32,
    batch_size: usize,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl WriteBackWorker {
    pub fn new(store: Arc<dyn RowStore>, sink: Arc<dyn SystemOfRecord>) -> Self {
        Self::from_config(store, sink, &WriteBackConfig::default())
    }

    pub fn from_config(
        store: Arc<dyn RowStore>,
        sink: Arc<dyn SystemOfRecord>,
        config: &WriteBackConfig,
    ) -> Self {
        Self {
            store,
            sink,
            events: EventSink::disabled(),
            max_retries: config.max_retries.max(1),
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Returns a handle for requesting shutdown.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Apply every currently pending task once.
    pub async fn drain_once(&self) -> Result<DrainSummary, StoreError> {
        let tasks = self.store.pending_write_backs(self.batch_size)?;
        let mut summary = DrainSummary::default();
        for task in tasks {
            let recorded = match self.sink.apply(&task).await {
                Ok(()) => self.record_applied(&task, &mut summary),
                Err(e) => self.record_failure(&task, &e.to_string(), &mut summary),
            };
            if let Err(e) = recorded {
                summary.unrecorded += 1;
                warn!(
                    job = %task.job_id,
                    row = task.row_number,
                    task = task.id,
                    error = %e,
                    "write-back outcome not recorded; task stays pending"
                );
            }
        }
        Ok(summary)
    }

    fn record_applied(
        &self,
        task: &WriteBackTask,
        summary: &mut DrainSummary,
    ) -> Result<(), StoreError> {
        self.store.complete_write_back(task.id)?;
        summary.processed += 1;
        self.events.emit(
            &task.job_id,
            ExecutionEvent::WriteBackApplied {
                job_id: task.job_id.clone(),
                row_number: task.row_number,
                external_reference: task.external_reference.clone(),
            },
        );
        Ok(())
    }

    fn record_failure(
        &self,
        task: &WriteBackTask,
        error: &str,
        summary: &mut DrainSummary,
    ) -> Result<(), StoreError> {
        match self.store.fail_write_back(task.id, error, self.max_retries)? {
            WriteBackStatus::DeadLetter => {
                summary.dead_lettered += 1;
                warn!(
                    job = %task.job_id,
                    row = task.row_number,
                    error,
                    "write-back dead-lettered"
                );
                self.events.emit(
                    &task.job_id,
                    ExecutionEvent::WriteBackDeadLettered {
                        job_id: task.job_id.clone(),
                        row_number: task.row_number,
                        error: error.to_string(),
                    },
                );
            }
            _ => {
                summary.failed += 1;
                warn!(
                    job = %task.job_id,
                    row = task.row_number,
                    attempt = task.retry_count + 1,
                    error,
                    "write-back failed; will retry"
                );
            }
        }
        Ok(())
    }

    /// Drain until shutdown is requested.
    pub async fn run(&self) -> Result<(), StoreError> {
        info!(
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_size = self.batch_size,
            max_retries = self.max_retries,
            "write-back worker starting"
        );
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.drain_once().await {
                warn!(error = %e, "write-back drain failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        info!("write-back worker shutting down");
        Ok(())
    }
}
