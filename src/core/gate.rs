//! DT-009: Enforcement gate.
//!
//! Runs before any decoding on every entry point. Two checks:
//! 1. No payload may carry raw query text under any key, at any depth.
//! 2. Compile-side entry points require a RESOLVED provenance token bound
//!    to the submitted tree.

use super::canonical;
use super::error::{FilterError, FilterErrorCode};
use super::token::{TokenBinding, TokenClaims, TokenService};
use super::types::{ResolutionStatus, ResolvedFilterSpec};
use serde_json::Value;
use std::fmt;

/// Keys whose presence means a caller tried to hand us query text.
pub const BANNED_KEYS: [&str; 5] = ["sql", "raw_sql", "query", "where_clause", "where_sql"];

/// Operations the gate fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    ResolveIntent,
    CompileFilter,
    FetchRows,
    ExecuteBatch,
}

impl EntryPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveIntent => "resolve_intent",
            Self::CompileFilter => "compile_filter",
            Self::FetchRows => "fetch_rows",
            Self::ExecuteBatch => "execute_batch",
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn find_banned(value: &Value, path: &mut Vec<String>) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let lower = key.to_lowercase();
                path.push(key.clone());
                if BANNED_KEYS.contains(&lower.as_str()) {
                    return Some(path.join("."));
                }
                if let Some(hit) = find_banned(child, path) {
                    return Some(hit);
                }
                path.pop();
            }
            None
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                if let Some(hit) = find_banned(item, path) {
                    return Some(hit);
                }
                path.pop();
            }
            None
        }
        _ => None,
    }
}

/// Reject payloads carrying raw query keys anywhere in the tree.
pub fn scan_payload(entry: EntryPoint, payload: &Value) -> Result<(), FilterError> {
    if let Some(path) = find_banned(payload, &mut Vec::new()) {
        tracing::warn!(entry = %entry, path = %path, "raw query key denied");
        return Err(FilterError::new(
            FilterErrorCode::RawQueryDenied,
            format!("{} does not accept query text (found '{}')", entry, path),
        ));
    }
    Ok(())
}

/// Validate the provenance token on a spec about to be compiled.
///
/// The expected binding uses the spec hash recomputed from the submitted
/// tree and the server's current dictionary version, so an edited tree or
/// a dictionary rollover both fail here.
pub fn check_spec_token(
    entry: EntryPoint,
    session_id: &str,
    spec: &ResolvedFilterSpec,
    dict_version: &str,
    tokens: &TokenService,
    now: u64,
) -> Result<TokenClaims, FilterError> {
    let token = spec.resolution_token.as_deref().ok_or_else(|| {
        FilterError::new(
            FilterErrorCode::TokenInvalidOrExpired,
            format!("{} requires a resolution token", entry),
        )
    })?;
    let expected = TokenBinding {
        session_id: session_id.to_string(),
        schema_signature: spec.schema_signature.clone(),
        dict_version: dict_version.to_string(),
        resolved_spec_hash: canonical::spec_hash(&spec.root),
        status: ResolutionStatus::Resolved,
    };
    tokens.validate(token, &expected, now).inspect_err(|e| {
        tracing::warn!(entry = %entry, session = session_id, code = %e.code, "token rejected");
    })
}
