//! External collaborators: the side-effecting gateway, the row source and
//! the system of record that completed effects are written back to.
//!
//! Only the contracts live here. [`memory`] carries in-process
//! implementations for tests and dry runs.

pub mod memory;

use crate::batch::types::WriteBackTask;
use crate::core::types::SqlParam;
use async_trait::async_trait;
use serde_json::Value;

/// Gateway failure, split by what it tells us about the side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The gateway refused the request. No effect happened.
    #[error("rejected [{code}]: {message}")]
    Rejected { code: String, message: String },

    /// The call did not complete. The effect may or may not exist.
    #[error("transport: {0}")]
    Transport(String),
}

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReceipt {
    pub external_reference: String,
    /// Document produced by the effect (e.g. a label), if any.
    pub artifact: Option<Vec<u8>>,
}

/// Answer to "does this effect exist?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found { external_reference: String },
    NotFound,
    /// The gateway cannot answer this kind of question.
    Unsupported,
}

/// The external system whose calls have side effects.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Perform the effect. `idempotency_key` is stable for a given row
    /// snapshot; gateways that honor it will not duplicate the effect.
    async fn create(&self, payload: &Value, idempotency_key: &str)
        -> Result<CreateReceipt, GatewayError>;

    /// Check whether an effect with this reference exists.
    async fn query(&self, external_reference: &str) -> Result<Lookup, GatewayError>;

    /// Find an effect by the key it was created with.
    async fn find_by_idempotency_key(&self, _idempotency_key: &str) -> Result<Lookup, GatewayError> {
        Ok(Lookup::Unsupported)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("row source: {0}")]
pub struct SourceError(pub String);

/// A selected source row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 1-based position in the source.
    pub row_number: u64,
    pub payload: Value,
}

/// Where rows come from. Receives only compiled predicates.
pub trait RowSource: Send + Sync {
    fn select(
        &self,
        where_sql: &str,
        params: &[SqlParam],
        limit: Option<usize>,
    ) -> Result<Vec<SourceRow>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("write-back: {0}")]
pub struct ApplyError(pub String);

/// Receives external references for completed rows.
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    async fn apply(&self, task: &WriteBackTask) -> Result<(), ApplyError>;
}
