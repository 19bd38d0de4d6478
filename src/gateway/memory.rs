//! In-memory gateway, row source and system of record.
//!
//! The gateway honors idempotency keys the way a well-behaved remote would:
//! a second `create` with the same key returns the first effect's reference.
//! Scripts keyed by idempotency-key prefix inject rejections and transport
//! failures.

use super::{
    ApplyError, CreateReceipt, Gateway, GatewayError, Lookup, RowSource, SourceError, SourceRow,
    SystemOfRecord,
};
use crate::batch::types::WriteBackTask;
use crate::core::types::SqlParam;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Injected behavior for `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateScript {
    Reject { code: String, message: String },
    /// Fail before the effect happens.
    TransportBeforeEffect,
    /// Perform the effect, then fail to report it.
    TransportAfterEffect,
}

#[derive(Debug, Default)]
struct GatewayState {
    effects: BTreeMap<String, String>,
    by_key: BTreeMap<String, String>,
    scripts: Vec<(String, CreateScript)>,
    create_calls: usize,
    next_id: u64,
    query_unavailable: bool,
}

/// Deterministic gateway. References are `EXT-000001`, `EXT-000002`, ...
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<GatewayState>,
    key_lookup: bool,
    artifacts: bool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `find_by_idempotency_key` instead of reporting unsupported.
    pub fn with_key_lookup(mut self) -> Self {
        self.key_lookup = true;
        self
    }

    /// Return an artifact with every receipt.
    pub fn with_artifacts(mut self) -> Self {
        self.artifacts = true;
        self
    }

    /// Apply `script` to every create whose key starts with `key_prefix`.
    pub fn script(&self, key_prefix: impl Into<String>, script: CreateScript) {
        lock(&self.state).scripts.push((key_prefix.into(), script));
    }

    pub fn clear_scripts(&self) {
        lock(&self.state).scripts.clear();
    }

    /// Make `query` and key lookups fail with a transport error.
    pub fn set_query_unavailable(&self, unavailable: bool) {
        lock(&self.state).query_unavailable = unavailable;
    }

    /// Record an effect as if some earlier process had created it.
    pub fn seed_effect(&self, idempotency_key: &str) -> String {
        let mut st = lock(&self.state);
        Self::record(&mut st, idempotency_key)
    }

    /// Drop an effect (voided remotely).
    pub fn void(&self, external_reference: &str) {
        let mut st = lock(&self.state);
        st.effects.remove(external_reference);
        st.by_key.retain(|_, r| r != external_reference);
    }

    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    pub fn effect_count(&self) -> usize {
        lock(&self.state).effects.len()
    }

    pub fn reference_for(&self, idempotency_key: &str) -> Option<String> {
        lock(&self.state).by_key.get(idempotency_key).cloned()
    }

    fn record(st: &mut GatewayState, key: &str) -> String {
        if let Some(existing) = st.by_key.get(key) {
            return existing.clone();
        }
        st.next_id += 1;
        let reference = format!("EXT-{:06}", st.next_id);
        st.effects.insert(reference.clone(), key.to_string());
        st.by_key.insert(key.to_string(), reference.clone());
        reference
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn create(
        &self,
        _payload: &Value,
        idempotency_key: &str,
    ) -> Result<CreateReceipt, GatewayError> {
        let mut st = lock(&self.state);
        st.create_calls += 1;
        let script = st
            .scripts
            .iter()
            .find(|(prefix, _)| idempotency_key.starts_with(prefix.as_str()))
            .map(|(_, s)| s.clone());
        match script {
            Some(CreateScript::Reject { code, message }) => {
                Err(GatewayError::Rejected { code, message })
            }
            Some(CreateScript::TransportBeforeEffect) => {
                Err(GatewayError::Transport("connection reset".into()))
            }
            Some(CreateScript::TransportAfterEffect) => {
                Self::record(&mut st, idempotency_key);
                Err(GatewayError::Transport("response timed out".into()))
            }
            None => {
                let external_reference = Self::record(&mut st, idempotency_key);
                let artifact = self
                    .artifacts
                    .then(|| format!("ARTIFACT {}", external_reference).into_bytes());
                Ok(CreateReceipt {
                    external_reference,
                    artifact,
                })
            }
        }
    }

    async fn query(&self, external_reference: &str) -> Result<Lookup, GatewayError> {
        let st = lock(&self.state);
        if st.query_unavailable {
            return Err(GatewayError::Transport("gateway unavailable".into()));
        }
        Ok(if st.effects.contains_key(external_reference) {
            Lookup::Found {
                external_reference: external_reference.to_string(),
            }
        } else {
            Lookup::NotFound
        })
    }

    async fn find_by_idempotency_key(&self, idempotency_key: &str) -> Result<Lookup, GatewayError> {
        if !self.key_lookup {
            return Ok(Lookup::Unsupported);
        }
        let st = lock(&self.state);
        if st.query_unavailable {
            return Err(GatewayError::Transport("gateway unavailable".into()));
        }
        Ok(match st.by_key.get(idempotency_key) {
            Some(r) => Lookup::Found {
                external_reference: r.clone(),
            },
            None => Lookup::NotFound,
        })
    }
}

/// Fixed rows; records every predicate it is handed.
#[derive(Debug, Default)]
pub struct MemoryRowSource {
    rows: Vec<SourceRow>,
    seen: Mutex<Vec<(String, Vec<SqlParam>)>>,
}

impl MemoryRowSource {
    /// Rows are numbered from 1 in the order given.
    pub fn new(payloads: Vec<Value>) -> Self {
        let rows = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| SourceRow {
                row_number: i as u64 + 1,
                payload,
            })
            .collect();
        Self {
            rows,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<(String, Vec<SqlParam>)> {
        lock(&self.seen).clone()
    }
}

impl RowSource for MemoryRowSource {
    fn select(
        &self,
        where_sql: &str,
        params: &[SqlParam],
        limit: Option<usize>,
    ) -> Result<Vec<SourceRow>, SourceError> {
        lock(&self.seen).push((where_sql.to_string(), params.to_vec()));
        let n = limit.unwrap_or(self.rows.len());
        Ok(self.rows.iter().take(n).cloned().collect())
    }
}

/// Records applied references; rows in the failing set always error.
#[derive(Debug, Default)]
pub struct MemorySystemOfRecord {
    applied: Mutex<BTreeMap<(String, u64), String>>,
    failing: Mutex<BTreeSet<(String, u64)>>,
    attempts: Mutex<usize>,
}

impl MemorySystemOfRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_row(&self, job_id: &str, row_number: u64) {
        lock(&self.failing).insert((job_id.to_string(), row_number));
    }

    pub fn heal_row(&self, job_id: &str, row_number: u64) {
        lock(&self.failing).remove(&(job_id.to_string(), row_number));
    }

    pub fn applied(&self) -> BTreeMap<(String, u64), String> {
        lock(&self.applied).clone()
    }

    pub fn attempts(&self) -> usize {
        *lock(&self.attempts)
    }
}

#[async_trait]
impl SystemOfRecord for MemorySystemOfRecord {
    async fn apply(&self, task: &WriteBackTask) -> Result<(), ApplyError> {
        *lock(&self.attempts) += 1;
        let key = (task.job_id.clone(), task.row_number);
        if lock(&self.failing).contains(&key) {
            return Err(ApplyError(format!(
                "row {} of {} is locked",
                task.row_number, task.job_id
            )));
        }
        lock(&self.applied).insert(key, task.external_reference.clone());
        Ok(())
    }
}
