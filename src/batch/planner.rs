//! DT-016: Turn selected source rows into pending job rows.
//!
//! Each row gets a checksum of its canonical payload and an idempotency key
//! `{job_id}:{row_number}:{checksum}`. The key is stable for a row snapshot,
//! so a replanned identical row maps to the same external effect while an
//! edited row gets a fresh key.

use super::store::{RowStore, StoreError};
use super::types::NewRow;
use crate::gateway::SourceRow;
use crate::tripwire::hasher;
use serde::{Deserialize, Serialize};

/// Idempotency key for one row snapshot.
pub fn idempotency_key(job_id: &str, row_number: u64, row_checksum: &str) -> String {
    format!("{}:{}:{}", job_id, row_number, row_checksum)
}

/// Plan rows without touching storage.
pub fn plan_rows(job_id: &str, rows: &[SourceRow]) -> Vec<NewRow> {
    rows.iter()
        .map(|r| {
            let row_checksum = hasher::row_checksum(&r.payload);
            NewRow {
                job_id: job_id.to_string(),
                row_number: r.row_number,
                idempotency_key: idempotency_key(job_id, r.row_number, &row_checksum),
                row_checksum,
                payload: r.payload.clone(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedJob {
    pub job_id: String,
    pub planned: usize,
    /// Rows new to the store; already-planned rows are left as they are.
    pub inserted: usize,
}

/// Plan and persist rows as `pending`.
pub fn plan_job(
    store: &dyn RowStore,
    job_id: &str,
    rows: &[SourceRow],
) -> Result<PlannedJob, StoreError> {
    let planned = plan_rows(job_id, rows);
    let inserted = store.insert_rows(&planned)?;
    tracing::info!(job = job_id, planned = planned.len(), inserted, "job planned");
    Ok(PlannedJob {
        job_id: job_id.to_string(),
        planned: planned.len(),
        inserted,
    })
}
