//! DT-001: Filter AST, schema snapshot, and pipeline result types.
//!
//! The intent tree is a closed sum type (`FilterNode`) so every consumer
//! matches exhaustively. All types derive Serialize/Deserialize for JSON
//! transport and JsonSchema so entry points can publish their request shape.

use crate::core::error::{FilterError, FilterErrorCode};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Structural limits
// ============================================================================

/// Maximum group nesting. The root group is depth 1.
pub const MAX_GROUP_DEPTH: usize = 4;

/// Maximum number of leaf conditions after expansion.
pub const MAX_CONDITIONS: usize = 50;

/// Maximum operands in a single `in` / `not_in` list.
pub const MAX_IN_CARDINALITY: usize = 100;

/// Maximum positional parameters in one compiled filter.
pub const MAX_TOTAL_PARAMS: usize = 500;

// ============================================================================
// Operators
// ============================================================================

/// Comparison operator. Each has a fixed arity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    ContainsCi,
    StartsWithCi,
    EndsWithCi,
    IsNull,
    IsNotNull,
    IsBlank,
    IsNotBlank,
    Between,
}

/// Operand count an operator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeastOne,
    AtMostOne,
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exactly(k) => n == *k,
            Arity::AtLeastOne => n >= 1,
            Arity::AtMostOne => n <= 1,
        }
    }
}

impl FilterOperator {
    pub const ALL: [FilterOperator; 16] = [
        Self::Eq,
        Self::Neq,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::In,
        Self::NotIn,
        Self::ContainsCi,
        Self::StartsWithCi,
        Self::EndsWithCi,
        Self::IsNull,
        Self::IsNotNull,
        Self::IsBlank,
        Self::IsNotBlank,
        Self::Between,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::ContainsCi => "contains_ci",
            Self::StartsWithCi => "starts_with_ci",
            Self::EndsWithCi => "ends_with_ci",
            Self::IsNull => "is_null",
            Self::IsNotNull => "is_not_null",
            Self::IsBlank => "is_blank",
            Self::IsNotBlank => "is_not_blank",
            Self::Between => "between",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Self::In | Self::NotIn => Arity::AtLeastOne,
            Self::IsNull | Self::IsNotNull | Self::IsBlank | Self::IsNotBlank => Arity::AtMostOne,
            Self::Between => Arity::Exactly(2),
            _ => Arity::Exactly(1),
        }
    }

    /// Operators that compare magnitudes and need an orderable column.
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Self::Gt | Self::Gte | Self::Lt | Self::Lte | Self::Between
        )
    }

    /// Case-insensitive pattern operators.
    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::ContainsCi | Self::StartsWithCi | Self::EndsWithCi)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOperator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|op| op.as_str() == s)
            .copied()
            .ok_or_else(|| {
                FilterError::new(
                    FilterErrorCode::InvalidOperator,
                    format!("unknown operator '{}'", s),
                )
            })
    }
}

/// Boolean connective of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

impl LogicalOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Literals and parameters
// ============================================================================

/// A typed operand: `{"type": "string", "value": "CA"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TypedLiteral {
    String(String),
    Number(serde_json::Number),
    Boolean(bool),
    /// ISO-8601 date, optionally with a time suffix.
    Date(String),
}

impl TypedLiteral {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::Date(_) => "date",
        }
    }

    /// Plain rendering, used for canonical ordering and explanations.
    pub fn render(&self) -> String {
        match self {
            Self::String(s) | Self::Date(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }

    /// Lower to a positional parameter value.
    pub fn to_param(&self) -> SqlParam {
        match self {
            Self::String(s) | Self::Date(s) => SqlParam::Text(s.clone()),
            Self::Number(n) => SqlParam::Number(n.clone()),
            Self::Boolean(b) => SqlParam::Bool(*b),
        }
    }
}

/// A bound parameter in a compiled filter. Serializes as a bare JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SqlParam {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

// ============================================================================
// Intent AST
// ============================================================================

/// `column operator operands`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub operands: Vec<TypedLiteral>,
}

impl FilterCondition {
    pub fn new(column: impl Into<String>, operator: FilterOperator) -> Self {
        Self {
            column: column.into(),
            operator,
            operands: Vec::new(),
        }
    }

    pub fn with_operands(mut self, operands: Vec<TypedLiteral>) -> Self {
        self.operands = operands;
        self
    }
}

/// A dictionary term to expand against a target column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SemanticReference {
    pub semantic_key: String,
    pub target_column: String,
}

/// One node of the intent tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterNode {
    Condition(FilterCondition),
    Reference(SemanticReference),
    Group(FilterGroup),
}

/// `logic` over one or more children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FilterGroup {
    pub logic: LogicalOperator,
    pub children: Vec<FilterNode>,
}

impl FilterGroup {
    pub fn and(children: Vec<FilterNode>) -> Self {
        Self {
            logic: LogicalOperator::And,
            children,
        }
    }

    pub fn or(children: Vec<FilterNode>) -> Self {
        Self {
            logic: LogicalOperator::Or,
            children,
        }
    }
}

/// Typed intent produced by the front end. Never raw query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FilterIntent {
    pub root: FilterGroup,
}

impl fmt::Display for FilterCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.operands.iter().map(|o| o.render()).collect();
        match self.operator.arity() {
            Arity::AtMostOne => write!(f, "{} {}", self.column, self.operator),
            Arity::AtLeastOne => write!(
                f,
                "{} {} [{}]",
                self.column,
                self.operator,
                rendered.join(", ")
            ),
            Arity::Exactly(_) => write!(f, "{} {} {}", self.column, self.operator, rendered.join(" and ")),
        }
    }
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterNode::Condition(c) => write!(f, "{}", c),
            FilterNode::Reference(r) => write!(f, "{} on {}", r.semantic_key, r.target_column),
            FilterNode::Group(g) => write!(f, "({})", g),
        }
    }
}

impl fmt::Display for FilterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.children.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(&format!(" {} ", self.logic)))
    }
}

// ============================================================================
// Schema snapshot
// ============================================================================

/// Column set and types at resolution time, plus the signature binding them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaSnapshot {
    pub columns: IndexMap<String, String>,
    pub signature: String,
}

impl SchemaSnapshot {
    pub fn new(columns: IndexMap<String, String>) -> Self {
        let signature = crate::tripwire::hasher::schema_signature(&columns);
        Self { columns, signature }
    }

    /// Columns without type information (types recorded as `UNKNOWN`).
    pub fn untyped<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            names
                .into_iter()
                .map(|n| (n.into(), "UNKNOWN".to_string()))
                .collect(),
        )
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column_type(&self, name: &str) -> Option<&str> {
        self.columns.get(name).map(|s| s.as_str())
    }

    /// Columns whose name equals any pattern, compared case-insensitively.
    pub fn match_columns(&self, patterns: &[String]) -> Vec<String> {
        self.columns
            .keys()
            .filter(|c| {
                let lower = c.to_lowercase();
                patterns.iter().any(|p| p.to_lowercase() == lower)
            })
            .cloned()
            .collect()
    }
}

// ============================================================================
// Resolution output
// ============================================================================

/// Aggregated result status. Ordered so that `max` is worst-of.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Resolved,
    NeedsConfirmation,
    Unresolved,
}

impl ResolutionStatus {
    /// `UNRESOLVED > NEEDS_CONFIRMATION > RESOLVED`.
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "RESOLVED",
            Self::NeedsConfirmation => "NEEDS_CONFIRMATION",
            Self::Unresolved => "UNRESOLVED",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambiguity class of a dictionary term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Tier {
    A,
    B,
    C,
}

/// A Tier-B expansion awaiting explicit approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PendingConfirmation {
    pub semantic_key: String,
    pub target_column: String,
    pub expansion: FilterNode,
    pub description: String,
}

/// Alternative a Tier-C term might have meant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Suggestion {
    pub key: String,
    pub description: String,
}

/// A Tier-C term with no expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UnresolvedTerm {
    pub semantic_key: String,
    pub target_column: String,
    pub suggestions: Vec<Suggestion>,
}

/// Resolver output. Only `RESOLVED` specs may be compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedFilterSpec {
    pub status: ResolutionStatus,
    pub root: FilterGroup,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_confirmations: Vec<PendingConfirmation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_terms: Vec<UnresolvedTerm>,
    pub schema_signature: String,
    pub dict_version: String,
    /// SHA-256 of the canonical resolved tree.
    pub resolved_spec_hash: String,
}

// ============================================================================
// Compilation output
// ============================================================================

/// Compiled filter audit object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompiledFilter {
    /// Parameterized predicate using `$N` placeholders.
    pub where_sql: String,
    pub params: Vec<SqlParam>,
    /// Sorted, de-duplicated.
    pub columns_used: Vec<String>,
    pub explanation: String,
    pub schema_signature: String,
    pub dict_version: String,
    pub compiler_version: String,
    /// SHA-256 of canonical `{where_sql, params}`.
    pub content_hash: String,
}

// ============================================================================
// Entry-point requests
// ============================================================================

/// `resolve_intent` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResolveRequest {
    pub session_id: String,
    pub intent: FilterIntent,
    /// Confirmation tokens returned by a prior NEEDS_CONFIRMATION result.
    #[serde(default)]
    pub confirmations: Vec<String>,
}

/// `compile_filter` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompileRequest {
    pub session_id: String,
    pub spec: ResolvedFilterSpec,
}

/// `fetch_rows` request: compile then select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FetchRowsRequest {
    pub session_id: String,
    pub spec: ResolvedFilterSpec,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `execute_batch` request: compile, select, plan and dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteBatchRequest {
    pub session_id: String,
    pub spec: ResolvedFilterSpec,
    /// Reusing a job id resumes that job instead of planning a new one.
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dt001_operator_roundtrip_all() {
        for op in FilterOperator::ALL {
            let parsed: FilterOperator = op.as_str().parse().unwrap();
            assert_eq!(parsed, op);
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op.as_str()));
        }
    }

    #[test]
    fn test_dt001_operator_unknown() {
        let err = "like".parse::<FilterOperator>().unwrap_err();
        assert_eq!(err.code, FilterErrorCode::InvalidOperator);
    }

    #[test]
    fn test_dt001_arity() {
        assert!(FilterOperator::Eq.arity().accepts(1));
        assert!(!FilterOperator::Eq.arity().accepts(2));
        assert!(FilterOperator::In.arity().accepts(7));
        assert!(!FilterOperator::In.arity().accepts(0));
        assert!(FilterOperator::IsNull.arity().accepts(0));
        assert!(FilterOperator::IsBlank.arity().accepts(1));
        assert!(!FilterOperator::IsBlank.arity().accepts(2));
        assert!(FilterOperator::Between.arity().accepts(2));
        assert!(!FilterOperator::Between.arity().accepts(1));
    }

    #[test]
    fn test_dt001_literal_wire_shape() {
        let lit = TypedLiteral::string("CA");
        let json = serde_json::to_value(&lit).unwrap();
        assert_eq!(json, serde_json::json!({"type": "string", "value": "CA"}));

        let n: TypedLiteral =
            serde_json::from_value(serde_json::json!({"type": "number", "value": 12.5})).unwrap();
        assert_eq!(n.render(), "12.5");
    }

    #[test]
    fn test_dt001_node_discriminant() {
        let node = FilterNode::Reference(SemanticReference {
            semantic_key: "NORTHEAST".into(),
            target_column: "state".into(),
        });
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "reference");
        let back: FilterNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_dt001_status_worst_of() {
        use ResolutionStatus::*;
        assert_eq!(Resolved.worst(NeedsConfirmation), NeedsConfirmation);
        assert_eq!(NeedsConfirmation.worst(Unresolved), Unresolved);
        assert_eq!(Unresolved.worst(Resolved), Unresolved);
        assert_eq!(Resolved.worst(Resolved), Resolved);
    }

    #[test]
    fn test_dt001_schema_match_columns_case_insensitive() {
        let schema = SchemaSnapshot::untyped(["Company", "state", "zip"]);
        let hits = schema.match_columns(&["company".into(), "business_name".into()]);
        assert_eq!(hits, vec!["Company".to_string()]);
    }

    #[test]
    fn test_dt001_schema_signature_depends_on_types() {
        let mut a = IndexMap::new();
        a.insert("amount".to_string(), "DOUBLE".to_string());
        let mut b = IndexMap::new();
        b.insert("amount".to_string(), "VARCHAR".to_string());
        assert_ne!(SchemaSnapshot::new(a).signature, SchemaSnapshot::new(b).signature);
    }

    #[test]
    fn test_dt001_condition_display() {
        let c = FilterCondition::new("state", FilterOperator::In).with_operands(vec![
            TypedLiteral::string("CA"),
            TypedLiteral::string("NY"),
        ]);
        assert_eq!(c.to_string(), "state in [CA, NY]");
        let n = FilterCondition::new("company", FilterOperator::IsBlank);
        assert_eq!(n.to_string(), "company is_blank");
    }
}
