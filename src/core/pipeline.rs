//! DT-020: Entry points over raw JSON payloads.
//!
//! Every entry point runs in the same order: raw-query scan of the payload
//! tree, decode, provenance token check, compile. A failure at any step
//! short-circuits the rest, so a denied payload is never decoded and an
//! unauthorized spec never reaches the compiler or a row source.

use super::compiler;
use super::dictionary::CanonicalDictionary;
use super::error::FilterError;
use super::gate::{self, EntryPoint};
use super::parser;
use super::resolver::{self, ResolveContext};
use super::token::TokenService;
use super::types::{CompiledFilter, ResolvedFilterSpec, SchemaSnapshot};
use crate::batch::executor::{ExecError, Executor};
use crate::batch::planner::{self, PlannedJob};
use crate::batch::store::StoreError;
use crate::batch::types::BatchResult;
use crate::gateway::{RowSource, SourceError, SourceRow};
use crate::tripwire::eventlog::{self, ExecutionEvent};
use serde_json::Value;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl PipelineError {
    /// The filter error, when the request was denied before any row I/O.
    pub fn as_filter(&self) -> Option<&FilterError> {
        match self {
            Self::Filter(e) => Some(e),
            _ => None,
        }
    }
}

/// Rows selected by a compiled filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRows {
    pub compiled: CompiledFilter,
    pub rows: Vec<SourceRow>,
}

/// Outcome of `execute_batch`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub compiled: CompiledFilter,
    pub planned: PlannedJob,
    pub result: BatchResult,
}

/// Dictionary and token service shared by every request.
pub struct FilterPipeline {
    dict: CanonicalDictionary,
    tokens: TokenService,
}

impl FilterPipeline {
    pub fn new(dict: CanonicalDictionary, tokens: TokenService) -> Self {
        Self { dict, tokens }
    }

    pub fn dictionary(&self) -> &CanonicalDictionary {
        &self.dict
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// `{session_id, intent, confirmations?}` to a resolved spec.
    pub fn resolve_intent(
        &self,
        payload: &Value,
        schema: &SchemaSnapshot,
        now: u64,
    ) -> Result<ResolvedFilterSpec, FilterError> {
        gate::scan_payload(EntryPoint::ResolveIntent, payload)?;
        let req = parser::decode_resolve_request(payload)?;
        let ctx = ResolveContext {
            session_id: &req.session_id,
            confirmations: &req.confirmations,
            now,
        };
        let spec = resolver::resolve(&req.intent, schema, &self.dict, &self.tokens, &ctx)?;
        info!(session = %req.session_id, status = %spec.status, "resolve_intent");
        Ok(spec)
    }

    fn authorized_compile(
        &self,
        entry: EntryPoint,
        session_id: &str,
        spec: &ResolvedFilterSpec,
        schema: &SchemaSnapshot,
        now: u64,
    ) -> Result<CompiledFilter, FilterError> {
        gate::check_spec_token(entry, session_id, spec, self.dict.version(), &self.tokens, now)?;
        compiler::compile(spec, schema)
    }

    /// `{session_id, spec}` to a parameterized predicate.
    pub fn compile_filter(
        &self,
        payload: &Value,
        schema: &SchemaSnapshot,
        now: u64,
    ) -> Result<CompiledFilter, FilterError> {
        gate::scan_payload(EntryPoint::CompileFilter, payload)?;
        let req = parser::decode_compile_request(payload)?;
        let compiled =
            self.authorized_compile(EntryPoint::CompileFilter, &req.session_id, &req.spec, schema, now)?;
        info!(session = %req.session_id, content_hash = %compiled.content_hash, "compile_filter");
        Ok(compiled)
    }

    /// `{session_id, spec, limit?}`: compile, then select from `source`.
    pub fn fetch_rows(
        &self,
        payload: &Value,
        schema: &SchemaSnapshot,
        source: &dyn RowSource,
        now: u64,
    ) -> Result<FetchedRows, PipelineError> {
        gate::scan_payload(EntryPoint::FetchRows, payload)?;
        let req = parser::decode_fetch_request(payload)?;
        let compiled =
            self.authorized_compile(EntryPoint::FetchRows, &req.session_id, &req.spec, schema, now)?;
        let rows = source.select(&compiled.where_sql, &compiled.params, req.limit)?;
        info!(
            session = %req.session_id,
            content_hash = %compiled.content_hash,
            rows = rows.len(),
            "fetch_rows"
        );
        Ok(FetchedRows { compiled, rows })
    }

    /// `{session_id, spec, job_id?, limit?}`: compile, select, plan the
    /// selected rows into the executor's store and dispatch them.
    pub async fn execute_batch(
        &self,
        payload: &Value,
        schema: &SchemaSnapshot,
        source: &dyn RowSource,
        executor: &Executor,
        now: u64,
    ) -> Result<BatchRun, PipelineError> {
        gate::scan_payload(EntryPoint::ExecuteBatch, payload)?;
        let req = parser::decode_execute_request(payload)?;
        let compiled =
            self.authorized_compile(EntryPoint::ExecuteBatch, &req.session_id, &req.spec, schema, now)?;
        let rows = source.select(&compiled.where_sql, &compiled.params, req.limit)?;

        let job_id = req.job_id.unwrap_or_else(eventlog::generate_job_id);
        let planned = planner::plan_job(executor.store().as_ref(), &job_id, &rows)?;
        executor.events().emit(
            &job_id,
            ExecutionEvent::JobPlanned {
                job_id: job_id.clone(),
                session_id: req.session_id.clone(),
                content_hash: compiled.content_hash.clone(),
                rows: planned.planned,
            },
        );
        let result = executor.run(&job_id).await?;
        Ok(BatchRun {
            compiled,
            planned,
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::store::SqliteRowStore;
    use crate::core::error::FilterErrorCode;
    use crate::core::types::{ResolutionStatus, SqlParam};
    use crate::gateway::memory::{MemoryGateway, MemoryRowSource};
    use indexmap::IndexMap;
    use secrecy::SecretString;
    use serde_json::json;
    use std::sync::Arc;

    const NOW: u64 = 1_800_000_000;

    fn pipeline() -> FilterPipeline {
        let tokens =
            TokenService::new(SecretString::from("0123456789abcdef0123456789abcdef"), 600).unwrap();
        FilterPipeline::new(CanonicalDictionary::builtin(), tokens)
    }

    fn schema() -> SchemaSnapshot {
        let mut cols = IndexMap::new();
        for (c, t) in [("state", "VARCHAR"), ("city", "VARCHAR"), ("amount", "DOUBLE")] {
            cols.insert(c.to_string(), t.to_string());
        }
        SchemaSnapshot::new(cols)
    }

    fn resolve_payload(children: Value) -> Value {
        json!({"session_id": "s-1", "intent": {"root": {"logic": "AND", "children": children}}})
    }

    fn state_ca(p: &FilterPipeline) -> ResolvedFilterSpec {
        p.resolve_intent(
            &resolve_payload(json!([{"column": "state", "operator": "eq", "operands": ["CA"]}])),
            &schema(),
            NOW,
        )
        .unwrap()
    }

    fn spec_payload(spec: &ResolvedFilterSpec) -> Value {
        json!({"session_id": "s-1", "spec": serde_json::to_value(spec).unwrap()})
    }

    #[test]
    fn test_dt020_resolve_then_compile() {
        let p = pipeline();
        let spec = state_ca(&p);
        assert_eq!(spec.status, ResolutionStatus::Resolved);
        let compiled = p.compile_filter(&spec_payload(&spec), &schema(), NOW + 1).unwrap();
        assert_eq!(compiled.where_sql, "\"state\" = $1");
        assert_eq!(compiled.params, vec![SqlParam::Text("CA".into())]);
    }

    #[test]
    fn test_dt020_northeast_round_trip() {
        let p = pipeline();
        let reference = json!([{"semantic_key": "NORTHEAST", "target_column": "state"}]);
        let first = p.resolve_intent(&resolve_payload(reference.clone()), &schema(), NOW).unwrap();
        assert_eq!(first.status, ResolutionStatus::NeedsConfirmation);

        let err = p.compile_filter(&spec_payload(&first), &schema(), NOW).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::ConfirmationRequired);

        let mut confirm = resolve_payload(reference);
        confirm["confirmations"] = json!([first.resolution_token.clone().unwrap()]);
        let second = p.resolve_intent(&confirm, &schema(), NOW + 5).unwrap();
        assert_eq!(second.status, ResolutionStatus::Resolved);

        let compiled = p.compile_filter(&spec_payload(&second), &schema(), NOW + 6).unwrap();
        assert!(compiled.where_sql.starts_with("\"state\" IN ($1,"));
        assert_eq!(compiled.params.len(), 9);
    }

    #[test]
    fn test_dt020_flipped_status_rejected() {
        let p = pipeline();
        let reference = json!([{"semantic_key": "NORTHEAST", "target_column": "state"}]);
        let pending = p.resolve_intent(&resolve_payload(reference), &schema(), NOW).unwrap();
        let mut forged = pending.clone();
        forged.status = ResolutionStatus::Resolved;
        forged.pending_confirmations.clear();
        let err = p.compile_filter(&spec_payload(&forged), &schema(), NOW).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::ConfirmationRequired);
    }

    #[test]
    fn test_dt020_raw_query_denied_before_decode() {
        let p = pipeline();
        // Not even a well-formed request; the scan still runs first.
        let payload = json!({"nested": [{"deep": {"Raw_SQL": "DROP TABLE t"}}]});
        let err = p.compile_filter(&payload, &schema(), NOW).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::RawQueryDenied);
        let err = p.resolve_intent(&payload, &schema(), NOW).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::RawQueryDenied);
    }

    #[test]
    fn test_dt020_tampered_tree_rejected() {
        let p = pipeline();
        let spec = state_ca(&p);
        let mut payload = spec_payload(&spec);
        payload["spec"]["root"]["children"][0]["operands"][0] = json!({"type": "string", "value": "NY"});
        let err = p.compile_filter(&payload, &schema(), NOW).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::TokenHashMismatch);
    }

    #[test]
    fn test_dt020_schema_drift_after_resolve() {
        let p = pipeline();
        let spec = state_ca(&p);
        let mut drifted = schema();
        drifted.columns.insert("zip".into(), "VARCHAR".into());
        let drifted = SchemaSnapshot::new(drifted.columns);
        let err = p.compile_filter(&spec_payload(&spec), &drifted, NOW).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::SchemaChanged);
    }

    #[test]
    fn test_dt020_fetch_rows_uses_compiled_predicate() {
        let p = pipeline();
        let spec = state_ca(&p);
        let source = MemoryRowSource::new(vec![json!({"state": "CA"}), json!({"state": "CA"})]);
        let mut payload = spec_payload(&spec);
        payload["limit"] = json!(1);
        let fetched = p.fetch_rows(&payload, &schema(), &source, NOW).unwrap();
        assert_eq!(fetched.rows.len(), 1);
        let queries = source.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].0, fetched.compiled.where_sql);
    }

    #[test]
    fn test_dt020_fetch_without_token_never_selects() {
        let p = pipeline();
        let mut spec = state_ca(&p);
        spec.resolution_token = None;
        let source = MemoryRowSource::new(vec![json!({"state": "CA"})]);
        let err = p
            .fetch_rows(&spec_payload(&spec), &schema(), &source, NOW)
            .unwrap_err();
        assert_eq!(
            err.as_filter().map(|e| e.code),
            Some(FilterErrorCode::TokenInvalidOrExpired)
        );
        assert!(source.queries().is_empty());
    }

    #[tokio::test]
    async fn test_dt020_execute_batch_rejects_traversing_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state");
        let p = pipeline();
        let spec = state_ca(&p);
        let source = MemoryRowSource::new(vec![json!({"state": "CA"})]);
        let store = Arc::new(SqliteRowStore::open_in_memory().unwrap());
        let gw = Arc::new(MemoryGateway::new());
        let executor = Executor::new(store.clone(), gw.clone())
            .with_events(crate::tripwire::eventlog::EventSink::new(&state));

        let mut payload = spec_payload(&spec);
        payload["job_id"] = json!("../escape");
        let err = p
            .execute_batch(&payload, &schema(), &source, &executor, NOW)
            .await
            .unwrap_err();
        assert_eq!(
            err.as_filter().map(|e| e.code),
            Some(FilterErrorCode::InvalidRequest)
        );
        assert!(!dir.path().join("escape").exists());
        assert!(source.queries().is_empty());
        assert_eq!(gw.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_dt020_execute_batch_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline();
        let spec = state_ca(&p);
        let source = MemoryRowSource::new((0..4).map(|i| json!({"state": "CA", "n": i})).collect());
        let store = Arc::new(SqliteRowStore::open_in_memory().unwrap());
        let gw = Arc::new(MemoryGateway::new());
        let executor = Executor::new(store.clone(), gw.clone())
            .with_events(crate::tripwire::eventlog::EventSink::new(dir.path()));

        let mut payload = spec_payload(&spec);
        payload["job_id"] = json!("job-e2e");
        let run = p
            .execute_batch(&payload, &schema(), &source, &executor, NOW)
            .await
            .unwrap();
        assert_eq!(run.planned.planned, 4);
        assert_eq!(run.result.completed, 4);
        assert_eq!(gw.effect_count(), 4);

        let events = eventlog::read_events(dir.path(), "job-e2e").unwrap();
        assert!(matches!(events[0].event, ExecutionEvent::JobPlanned { rows: 4, .. }));

        // Same job again: nothing new to plan or dispatch.
        let again = p
            .execute_batch(&payload, &schema(), &source, &executor, NOW)
            .await
            .unwrap();
        assert_eq!(again.planned.inserted, 0);
        assert_eq!(again.result.completed, 0);
        assert_eq!(gw.create_calls(), 4);
    }
}
