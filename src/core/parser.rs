//! DT-003: Parsing and validation.
//!
//! - detent.yaml config and schema snapshots (YAML)
//! - entry-point request payloads (JSON) into typed requests, with every
//!   structural problem reported as a typed `FilterError`

use super::config::DetentConfig;
use super::error::{FilterError, FilterErrorCode};
use super::types::*;
use crate::tripwire::eventlog::is_valid_job_id;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ============================================================================
// Config
// ============================================================================

/// Parse a detent.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<DetentConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a detent.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<DetentConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &DetentConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        push(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        ));
    }
    if config.token.secret_env.trim().is_empty() {
        push("token.secret_env must name an environment variable".to_string());
    }
    if config.token.ttl_seconds == 0 {
        push("token.ttl_seconds must be > 0".to_string());
    }
    if config.execution.concurrency == 0 {
        push("execution.concurrency must be > 0".to_string());
    }
    if config.execution.max_recovery_attempts == 0 {
        push("execution.max_recovery_attempts must be > 0".to_string());
    }
    if config.write_back.max_retries == 0 {
        push("write_back.max_retries must be > 0".to_string());
    }
    if config.write_back.batch_size == 0 {
        push("write_back.batch_size must be > 0".to_string());
    }
    if config.state_dir.as_os_str().is_empty() {
        push("state_dir must not be empty".to_string());
    }

    errors
}

// ============================================================================
// Schema snapshots
// ============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    columns: IndexMap<String, String>,
}

/// Parse a schema snapshot: `columns: {name: TYPE}`.
pub fn parse_schema(yaml: &str) -> Result<SchemaSnapshot, String> {
    let file: SchemaFile =
        serde_yaml_ng::from_str(yaml).map_err(|e| format!("schema parse error: {}", e))?;
    if file.columns.is_empty() {
        return Err("schema must declare at least one column".to_string());
    }
    Ok(SchemaSnapshot::new(file.columns))
}

pub fn parse_schema_file(path: &Path) -> Result<SchemaSnapshot, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_schema(&content)
}

// ============================================================================
// Intent tree
// ============================================================================

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, FilterError> {
    value
        .as_object()
        .ok_or_else(|| FilterError::invalid_request(format!("{} must be an object", what)))
}

fn required_str<'a>(obj: &'a Map<String, Value>, key: &str, what: &str) -> Result<&'a str, FilterError> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| FilterError::invalid_request(format!("{} requires string field '{}'", what, key)))
}

fn deny_unknown(obj: &Map<String, Value>, allowed: &[&str], what: &str) -> Result<(), FilterError> {
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(k) => Err(FilterError::invalid_request(format!(
            "unexpected field '{}' in {}",
            k, what
        ))),
        None => Ok(()),
    }
}

/// `{"root": <group>}`.
pub fn parse_intent(value: &Value) -> Result<FilterIntent, FilterError> {
    let obj = as_object(value, "intent")?;
    deny_unknown(obj, &["root"], "intent")?;
    let root = obj
        .get("root")
        .ok_or_else(|| FilterError::invalid_request("intent requires 'root'"))?;
    Ok(FilterIntent {
        root: parse_group(root, 1)?,
    })
}

/// Parse a group at `depth` (root is 1).
pub fn parse_group(value: &Value, depth: usize) -> Result<FilterGroup, FilterError> {
    if depth > MAX_GROUP_DEPTH {
        return Err(FilterError::structural(format!(
            "group nesting exceeds max depth {}",
            MAX_GROUP_DEPTH
        )));
    }
    let obj = as_object(value, "group")?;
    deny_unknown(obj, &["kind", "logic", "children"], "group")?;
    let logic = match required_str(obj, "logic", "group")? {
        "AND" | "and" => LogicalOperator::And,
        "OR" | "or" => LogicalOperator::Or,
        other => {
            return Err(FilterError::new(
                FilterErrorCode::InvalidOperator,
                format!("unknown group logic '{}'", other),
            ))
        }
    };
    let children = obj
        .get("children")
        .and_then(|v| v.as_array())
        .ok_or_else(|| FilterError::invalid_request("group requires array field 'children'"))?;
    let children = children
        .iter()
        .map(|c| parse_node(c, depth))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FilterGroup { logic, children })
}

/// Parse one child of a group at `depth`. `kind` may be omitted and is
/// then inferred from the fields present.
fn parse_node(value: &Value, depth: usize) -> Result<FilterNode, FilterError> {
    let obj = as_object(value, "node")?;
    let kind = match obj.get("kind").and_then(|k| k.as_str()) {
        Some(k) => k,
        None if obj.contains_key("logic") => "group",
        None if obj.contains_key("semantic_key") => "reference",
        None => "condition",
    };
    match kind {
        "condition" => parse_condition(obj).map(FilterNode::Condition),
        "reference" => {
            deny_unknown(obj, &["kind", "semantic_key", "target_column"], "reference")?;
            Ok(FilterNode::Reference(SemanticReference {
                semantic_key: required_str(obj, "semantic_key", "reference")?.to_string(),
                target_column: required_str(obj, "target_column", "reference")?.to_string(),
            }))
        }
        "group" => parse_group(value, depth + 1).map(FilterNode::Group),
        other => Err(FilterError::invalid_request(format!(
            "unknown node kind '{}'",
            other
        ))),
    }
}

fn parse_condition(obj: &Map<String, Value>) -> Result<FilterCondition, FilterError> {
    deny_unknown(obj, &["kind", "column", "operator", "operands"], "condition")?;
    let column = required_str(obj, "column", "condition")?.to_string();
    let operator: FilterOperator = required_str(obj, "operator", "condition")?.parse()?;
    let operands = match obj.get("operands") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(parse_literal)
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(FilterError::invalid_request(
                "condition 'operands' must be an array",
            ))
        }
    };
    Ok(FilterCondition {
        column,
        operator,
        operands,
    })
}

fn is_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() < 10 {
        return false;
    }
    let digits = |r: std::ops::Range<usize>| b[r].iter().all(|c| c.is_ascii_digit());
    let shape = digits(0..4) && b[4] == b'-' && digits(5..7) && b[7] == b'-' && digits(8..10);
    if !shape || (b.len() > 10 && b[10] != b'T' && b[10] != b' ') {
        return false;
    }
    let num = |r: std::ops::Range<usize>| {
        b[r].iter().fold(0u32, |acc, c| acc * 10 + u32::from(c - b'0'))
    };
    let (year, month, day) = (num(0..4), num(5..7), num(8..10));
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    let days_in_month = match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => return false,
    };
    (1..=days_in_month).contains(&day)
}

/// `{"type": T, "value": V}`, or a bare JSON scalar.
pub fn parse_literal(value: &Value) -> Result<TypedLiteral, FilterError> {
    let mismatch = |msg: String| FilterError::new(FilterErrorCode::TypeMismatch, msg);
    match value {
        Value::String(s) => Ok(TypedLiteral::String(s.clone())),
        Value::Number(n) => Ok(TypedLiteral::Number(n.clone())),
        Value::Bool(b) => Ok(TypedLiteral::Boolean(*b)),
        Value::Object(obj) => {
            deny_unknown(obj, &["type", "value"], "literal")?;
            let tag = required_str(obj, "type", "literal")?;
            match (tag, obj.get("value")) {
                ("string", Some(Value::String(s))) => Ok(TypedLiteral::String(s.clone())),
                ("number", Some(Value::Number(n))) => Ok(TypedLiteral::Number(n.clone())),
                ("boolean", Some(Value::Bool(b))) => Ok(TypedLiteral::Boolean(*b)),
                ("date", Some(Value::String(s))) if is_iso_date(s) => {
                    Ok(TypedLiteral::Date(s.clone()))
                }
                ("string" | "number" | "boolean" | "date", other) => Err(mismatch(format!(
                    "literal of type {} cannot hold {}",
                    tag,
                    other.unwrap_or(&Value::Null)
                ))),
                (other, _) => Err(mismatch(format!("unknown literal type '{}'", other))),
            }
        }
        other => Err(mismatch(format!("operand {} is not a typed literal", other))),
    }
}

// ============================================================================
// Entry-point requests
// ============================================================================

fn session_id(obj: &Map<String, Value>) -> Result<String, FilterError> {
    let sid = required_str(obj, "session_id", "request")?;
    if sid.trim().is_empty() {
        return Err(FilterError::invalid_request("session_id must not be empty"));
    }
    Ok(sid.to_string())
}

/// `{session_id, intent, confirmations?}`.
pub fn decode_resolve_request(value: &Value) -> Result<ResolveRequest, FilterError> {
    let obj = as_object(value, "request")?;
    deny_unknown(obj, &["session_id", "intent", "confirmations"], "resolve request")?;
    let intent = parse_intent(
        obj.get("intent")
            .ok_or_else(|| FilterError::invalid_request("request requires 'intent'"))?,
    )?;
    let confirmations = match obj.get("confirmations") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => serde_json::from_value::<Vec<String>>(v.clone()).map_err(|e| {
            FilterError::invalid_request(format!("confirmations must be strings: {}", e))
        })?,
    };
    Ok(ResolveRequest {
        session_id: session_id(obj)?,
        intent,
        confirmations,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SpecEnvelope {
    status: ResolutionStatus,
    root: Value,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    resolution_token: Option<String>,
    #[serde(default)]
    pending_confirmations: Vec<PendingConfirmation>,
    #[serde(default)]
    unresolved_terms: Vec<UnresolvedTerm>,
    schema_signature: String,
    dict_version: String,
    resolved_spec_hash: String,
}

/// Decode a resolved spec handed back by a client.
pub fn decode_spec(value: &Value) -> Result<ResolvedFilterSpec, FilterError> {
    let env: SpecEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| FilterError::invalid_request(format!("malformed spec: {}", e)))?;
    Ok(ResolvedFilterSpec {
        status: env.status,
        root: parse_group(&env.root, 1)?,
        explanation: env.explanation,
        resolution_token: env.resolution_token,
        pending_confirmations: env.pending_confirmations,
        unresolved_terms: env.unresolved_terms,
        schema_signature: env.schema_signature,
        dict_version: env.dict_version,
        resolved_spec_hash: env.resolved_spec_hash,
    })
}

/// `{session_id, spec}`.
pub fn decode_compile_request(value: &Value) -> Result<CompileRequest, FilterError> {
    let obj = as_object(value, "request")?;
    deny_unknown(obj, &["session_id", "spec"], "compile request")?;
    let spec = decode_spec(
        obj.get("spec")
            .ok_or_else(|| FilterError::invalid_request("request requires 'spec'"))?,
    )?;
    Ok(CompileRequest {
        session_id: session_id(obj)?,
        spec,
    })
}

fn required_spec(obj: &Map<String, Value>) -> Result<ResolvedFilterSpec, FilterError> {
    decode_spec(
        obj.get("spec")
            .ok_or_else(|| FilterError::invalid_request("request requires 'spec'"))?,
    )
}

fn optional_limit(obj: &Map<String, Value>) -> Result<Option<usize>, FilterError> {
    match obj.get("limit") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| FilterError::invalid_request("limit must be a non-negative integer")),
    }
}

/// `{session_id, spec, limit?}`.
pub fn decode_fetch_request(value: &Value) -> Result<FetchRowsRequest, FilterError> {
    let obj = as_object(value, "request")?;
    deny_unknown(obj, &["session_id", "spec", "limit"], "fetch request")?;
    Ok(FetchRowsRequest {
        spec: required_spec(obj)?,
        limit: optional_limit(obj)?,
        session_id: session_id(obj)?,
    })
}

/// `{session_id, spec, job_id?, limit?}`.
pub fn decode_execute_request(value: &Value) -> Result<ExecuteBatchRequest, FilterError> {
    let obj = as_object(value, "request")?;
    deny_unknown(obj, &["session_id", "spec", "job_id", "limit"], "execute request")?;
    let job_id = match obj.get("job_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(j)) if is_valid_job_id(j) => Some(j.clone()),
        Some(_) => {
            return Err(FilterError::invalid_request(
                "job_id must be 1-64 characters of [A-Za-z0-9_-]",
            ))
        }
    };
    Ok(ExecuteBatchRequest {
        spec: required_spec(obj)?,
        limit: optional_limit(obj)?,
        session_id: session_id(obj)?,
        job_id,
    })
}
