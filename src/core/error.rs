//! DT-002: Typed denial reasons for resolution, compilation and gating.
//!
//! Every failure that can reach a caller of the filter pipeline is one of a
//! fixed set of codes. Callers surface these as denials and re-issue a
//! corrected intent; nothing downstream may override one.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Enumerable reason a filter request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterErrorCode {
    UnknownColumn,
    UnknownCanonicalTerm,
    AmbiguousTerm,
    InvalidOperator,
    TypeMismatch,
    SchemaChanged,
    MissingTargetColumn,
    InvalidArity,
    MissingOperand,
    EmptyInList,
    TokenInvalidOrExpired,
    TokenHashMismatch,
    ConfirmationRequired,
    StructuralLimitExceeded,
    RawQueryDenied,
    InvalidRequest,
}

impl FilterErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownColumn => "UNKNOWN_COLUMN",
            Self::UnknownCanonicalTerm => "UNKNOWN_CANONICAL_TERM",
            Self::AmbiguousTerm => "AMBIGUOUS_TERM",
            Self::InvalidOperator => "INVALID_OPERATOR",
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::SchemaChanged => "SCHEMA_CHANGED",
            Self::MissingTargetColumn => "MISSING_TARGET_COLUMN",
            Self::InvalidArity => "INVALID_ARITY",
            Self::MissingOperand => "MISSING_OPERAND",
            Self::EmptyInList => "EMPTY_IN_LIST",
            Self::TokenInvalidOrExpired => "TOKEN_INVALID_OR_EXPIRED",
            Self::TokenHashMismatch => "TOKEN_HASH_MISMATCH",
            Self::ConfirmationRequired => "CONFIRMATION_REQUIRED",
            Self::StructuralLimitExceeded => "STRUCTURAL_LIMIT_EXCEEDED",
            Self::RawQueryDenied => "RAW_QUERY_DENIED",
            Self::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl fmt::Display for FilterErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A denial: code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct FilterError {
    pub code: FilterErrorCode,
    pub message: String,
}

impl FilterError {
    pub fn new(code: FilterErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_column(column: &str) -> Self {
        Self::new(
            FilterErrorCode::UnknownColumn,
            format!("column '{}' is not in the schema", column),
        )
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(FilterErrorCode::StructuralLimitExceeded, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(FilterErrorCode::InvalidRequest, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dt002_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&FilterErrorCode::EmptyInList).unwrap();
        assert_eq!(json, "\"EMPTY_IN_LIST\"");
        let back: FilterErrorCode = serde_json::from_str("\"TOKEN_HASH_MISMATCH\"").unwrap();
        assert_eq!(back, FilterErrorCode::TokenHashMismatch);
    }

    #[test]
    fn test_dt002_display_matches_serde_name() {
        for code in [
            FilterErrorCode::UnknownColumn,
            FilterErrorCode::SchemaChanged,
            FilterErrorCode::RawQueryDenied,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.to_string());
        }
    }

    #[test]
    fn test_dt002_error_display() {
        let e = FilterError::unknown_column("zip");
        assert_eq!(e.to_string(), "[UNKNOWN_COLUMN] column 'zip' is not in the schema");
    }
}
