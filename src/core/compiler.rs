//! DT-008: Filter compiler: resolved tree to parameterized predicate.
//!
//! One placeholder counter is threaded through the whole walk, so `$N` and
//! `params[N-1]` always agree. Every literal becomes a positional parameter;
//! the only text ever spliced into `where_sql` is a quoted column name that
//! exists in the schema snapshot. Output targets the DuckDB dialect.

use super::canonical;
use super::error::{FilterError, FilterErrorCode};
use super::resolver::validate_condition;
use super::types::*;
use crate::tripwire::hasher;
use serde_json::{json, Value};
use std::collections::BTreeSet;

pub const COMPILER_VERSION: &str = "filter_compiler_v2";

const NUMERIC_TYPES: [&str; 11] = [
    "INTEGER", "INT", "BIGINT", "SMALLINT", "TINYINT", "HUGEINT", "DOUBLE", "FLOAT", "REAL",
    "DECIMAL", "NUMERIC",
];

const TEMPORAL_TYPES: [&str; 4] = ["DATE", "TIMESTAMP", "TIMESTAMP WITH TIME ZONE", "TIMESTAMPTZ"];

const STRING_TYPES: [&str; 3] = ["VARCHAR", "TEXT", "STRING"];

/// Text columns whose name suggests they hold money or quantities.
const NUMERIC_TEXT_HINTS: [&str; 9] = [
    "amount", "price", "total", "subtotal", "cost", "value", "tax", "discount", "balance",
];

// ============================================================================
// Column typing
// ============================================================================

/// `DECIMAL(10,2)` -> `DECIMAL`. `None` for unknown types.
fn base_type(schema: &SchemaSnapshot, column: &str) -> Option<String> {
    let raw = schema.column_type(column)?.to_uppercase();
    let base = raw.split('(').next().unwrap_or("").trim().to_string();
    if base.is_empty() || base == "UNKNOWN" {
        None
    } else {
        Some(base)
    }
}

fn is_numeric_text(column: &str, ty: Option<&str>) -> bool {
    match ty {
        Some(t) if STRING_TYPES.contains(&t) => {
            let lower = column.to_lowercase();
            NUMERIC_TEXT_HINTS.iter().any(|h| lower.contains(h))
        }
        _ => false,
    }
}

fn check_type_compat(cond: &FilterCondition, ty: Option<&str>) -> Result<(), FilterError> {
    let Some(t) = ty else {
        return Ok(());
    };
    let op = cond.operator;
    if op.is_ordering() {
        let orderable = NUMERIC_TYPES.contains(&t) || TEMPORAL_TYPES.contains(&t);
        if !orderable && !is_numeric_text(&cond.column, ty) {
            return Err(FilterError::new(
                FilterErrorCode::TypeMismatch,
                format!(
                    "operator {} needs a numeric or date column; '{}' is {}",
                    op, cond.column, t
                ),
            ));
        }
    }
    if op.is_pattern() && !STRING_TYPES.contains(&t) {
        return Err(FilterError::new(
            FilterErrorCode::TypeMismatch,
            format!(
                "operator {} needs a text column; '{}' is {}",
                op, cond.column, t
            ),
        ));
    }
    Ok(())
}

fn quote_ident(column: &str) -> String {
    format!("\"{}\"", column.replace('"', "\"\""))
}

/// Escape `\`, `%`, `_` so the literal matches itself under ILIKE.
pub fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn coerce_numeric(lit: &TypedLiteral, column: &str) -> Result<SqlParam, FilterError> {
    let mismatch = || {
        FilterError::new(
            FilterErrorCode::TypeMismatch,
            format!("column '{}' expects a numeric literal for ordering", column),
        )
    };
    match lit {
        TypedLiteral::Number(n) => Ok(SqlParam::Number(n.clone())),
        TypedLiteral::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',' && *c != '$').collect();
            let f: f64 = cleaned.parse().map_err(|_| mismatch())?;
            serde_json::Number::from_f64(f)
                .map(SqlParam::Number)
                .ok_or_else(mismatch)
        }
        TypedLiteral::Boolean(_) | TypedLiteral::Date(_) => Err(mismatch()),
    }
}

fn param_value(p: &SqlParam) -> Value {
    match p {
        SqlParam::Text(s) => Value::String(s.clone()),
        SqlParam::Number(n) => Value::Number(n.clone()),
        SqlParam::Bool(b) => Value::Bool(*b),
    }
}

/// SHA-256 of canonical `{where_sql, params}`; params keep their order.
pub fn compiled_hash(where_sql: &str, params: &[SqlParam]) -> String {
    hasher::content_hash(&json!({
        "where_sql": where_sql,
        "params": params.iter().map(param_value).collect::<Vec<_>>(),
    }))
}

// ============================================================================
// Lowering
// ============================================================================

struct Lowering<'a> {
    schema: &'a SchemaSnapshot,
    params: Vec<SqlParam>,
    columns: BTreeSet<String>,
    conditions: usize,
}

impl Lowering<'_> {
    fn bind(&mut self, p: SqlParam) -> Result<String, FilterError> {
        if self.params.len() >= MAX_TOTAL_PARAMS {
            return Err(FilterError::structural(format!(
                "more than {} parameters",
                MAX_TOTAL_PARAMS
            )));
        }
        self.params.push(p);
        Ok(format!("${}", self.params.len()))
    }

    fn group(&mut self, group: &FilterGroup, depth: usize) -> Result<String, FilterError> {
        if depth > MAX_GROUP_DEPTH {
            return Err(FilterError::structural(format!(
                "group nesting exceeds max depth {}",
                MAX_GROUP_DEPTH
            )));
        }
        if group.children.is_empty() {
            return Err(FilterError::new(
                FilterErrorCode::InvalidArity,
                format!("{} group has no children", group.logic),
            ));
        }
        let mut parts = Vec::with_capacity(group.children.len());
        for child in &group.children {
            let sql = match child {
                FilterNode::Condition(c) => self.condition(c)?,
                FilterNode::Group(g) => format!("({})", self.group(g, depth + 1)?),
                FilterNode::Reference(r) => {
                    return Err(FilterError::new(
                        FilterErrorCode::UnknownCanonicalTerm,
                        format!("unexpanded semantic reference '{}'", r.semantic_key),
                    ))
                }
            };
            parts.push(sql);
        }
        Ok(parts.join(&format!(" {} ", group.logic)))
    }

    fn condition(&mut self, cond: &FilterCondition) -> Result<String, FilterError> {
        validate_condition(cond, self.schema)?;
        self.conditions += 1;
        if self.conditions > MAX_CONDITIONS {
            return Err(FilterError::structural(format!(
                "more than {} conditions",
                MAX_CONDITIONS
            )));
        }
        let ty = base_type(self.schema, &cond.column);
        check_type_compat(cond, ty.as_deref())?;
        self.columns.insert(cond.column.clone());

        let col = quote_ident(&cond.column);
        let numeric_text = is_numeric_text(&cond.column, ty.as_deref());
        let ordering_col = if numeric_text {
            format!(
                "TRY_CAST(REPLACE(REPLACE(TRIM(COALESCE({}, '')), '$', ''), ',', '') AS DOUBLE)",
                col
            )
        } else {
            col.clone()
        };
        let ordering_param = |lit: &TypedLiteral| {
            if numeric_text {
                coerce_numeric(lit, &cond.column)
            } else {
                Ok(lit.to_param())
            }
        };

        let sql = match cond.operator {
            FilterOperator::Eq => format!("{} = {}", col, self.bind(cond.operands[0].to_param())?),
            FilterOperator::Neq => {
                format!("{} != {}", col, self.bind(cond.operands[0].to_param())?)
            }
            FilterOperator::Gt | FilterOperator::Gte | FilterOperator::Lt | FilterOperator::Lte => {
                let sym = match cond.operator {
                    FilterOperator::Gt => ">",
                    FilterOperator::Gte => ">=",
                    FilterOperator::Lt => "<",
                    _ => "<=",
                };
                let p = self.bind(ordering_param(&cond.operands[0])?)?;
                format!("{} {} {}", ordering_col, sym, p)
            }
            FilterOperator::Between => {
                let lo = self.bind(ordering_param(&cond.operands[0])?)?;
                let hi = self.bind(ordering_param(&cond.operands[1])?)?;
                format!("{} BETWEEN {} AND {}", ordering_col, lo, hi)
            }
            FilterOperator::In | FilterOperator::NotIn => {
                let canon = canonical::canonicalize_condition(cond);
                if canon.operands.len() > MAX_IN_CARDINALITY {
                    return Err(FilterError::structural(format!(
                        "{} list on '{}' has {} values, max {}",
                        cond.operator,
                        cond.column,
                        canon.operands.len(),
                        MAX_IN_CARDINALITY
                    )));
                }
                let mut slots = Vec::with_capacity(canon.operands.len());
                for lit in &canon.operands {
                    slots.push(self.bind(lit.to_param())?);
                }
                let kw = if cond.operator == FilterOperator::In {
                    "IN"
                } else {
                    "NOT IN"
                };
                format!("{} {} ({})", col, kw, slots.join(","))
            }
            FilterOperator::ContainsCi | FilterOperator::StartsWithCi | FilterOperator::EndsWithCi => {
                let escaped = escape_like(&cond.operands[0].render());
                let pattern = match cond.operator {
                    FilterOperator::ContainsCi => format!("%{}%", escaped),
                    FilterOperator::StartsWithCi => format!("{}%", escaped),
                    _ => format!("%{}", escaped),
                };
                let p = self.bind(SqlParam::Text(pattern))?;
                format!("{} ILIKE {} ESCAPE '\\'", col, p)
            }
            FilterOperator::IsNull => format!("{} IS NULL", col),
            FilterOperator::IsNotNull => format!("{} IS NOT NULL", col),
            FilterOperator::IsBlank | FilterOperator::IsNotBlank => {
                let cmp = if cond.operator == FilterOperator::IsBlank {
                    "="
                } else {
                    "!="
                };
                let p = self.bind(SqlParam::Text(String::new()))?;
                format!(
                    "(TRIM(CAST(COALESCE({}, '') AS VARCHAR)) {} {})",
                    col, cmp, p
                )
            }
        };
        Ok(sql)
    }
}

// ============================================================================
// Explanation
// ============================================================================

fn label(cond: &FilterCondition) -> String {
    let v = |i: usize| cond.operands.get(i).map(|o| o.render()).unwrap_or_default();
    let c = &cond.column;
    match cond.operator {
        FilterOperator::Eq => format!("{} equals {}", c, v(0)),
        FilterOperator::Neq => format!("{} not equal to {}", c, v(0)),
        FilterOperator::Gt => format!("{} greater than {}", c, v(0)),
        FilterOperator::Gte => format!("{} >= {}", c, v(0)),
        FilterOperator::Lt => format!("{} less than {}", c, v(0)),
        FilterOperator::Lte => format!("{} <= {}", c, v(0)),
        FilterOperator::In | FilterOperator::NotIn => {
            let canon = canonical::canonicalize_condition(cond);
            let values: Vec<String> = canon.operands.iter().map(|o| o.render()).collect();
            let word = if cond.operator == FilterOperator::In {
                "in"
            } else {
                "not in"
            };
            format!("{} {} [{}]", c, word, values.join(", "))
        }
        FilterOperator::ContainsCi => format!("{} contains '{}' (case-insensitive)", c, v(0)),
        FilterOperator::StartsWithCi => format!("{} starts with '{}' (case-insensitive)", c, v(0)),
        FilterOperator::EndsWithCi => format!("{} ends with '{}' (case-insensitive)", c, v(0)),
        FilterOperator::IsNull => format!("{} is null", c),
        FilterOperator::IsNotNull => format!("{} is not null", c),
        FilterOperator::IsBlank => format!("{} is blank (null or empty)", c),
        FilterOperator::IsNotBlank => format!("{} is not blank", c),
        FilterOperator::Between => format!("{} between {} and {}", c, v(0), v(1)),
    }
}

fn explain_group(group: &FilterGroup) -> String {
    let parts: Vec<String> = group
        .children
        .iter()
        .filter_map(|child| match child {
            FilterNode::Condition(c) => Some(label(c)),
            FilterNode::Group(g) => Some(explain_group(g)),
            FilterNode::Reference(_) => None,
        })
        .collect();
    match parts.len() {
        0 => String::new(),
        1 => parts.into_iter().next().unwrap_or_default(),
        _ => format!("({})", parts.join(&format!(" {} ", group.logic))),
    }
}

// ============================================================================
// Entry
// ============================================================================

/// Compile a RESOLVED spec against the runtime schema snapshot.
pub fn compile(spec: &ResolvedFilterSpec, schema: &SchemaSnapshot) -> Result<CompiledFilter, FilterError> {
    if spec.status != ResolutionStatus::Resolved {
        return Err(FilterError::new(
            FilterErrorCode::ConfirmationRequired,
            format!("spec is {}, only RESOLVED specs compile", spec.status),
        ));
    }
    if spec.schema_signature != schema.signature {
        return Err(FilterError::new(
            FilterErrorCode::SchemaChanged,
            "schema changed since the filter was resolved",
        ));
    }

    let root = canonical::canonicalize_group(&spec.root);
    let mut lowering = Lowering {
        schema,
        params: Vec::new(),
        columns: BTreeSet::new(),
        conditions: 0,
    };
    let where_sql = lowering.group(&root, 1)?;
    let content_hash = compiled_hash(&where_sql, &lowering.params);

    tracing::debug!(
        params = lowering.params.len(),
        columns = lowering.columns.len(),
        hash = %content_hash,
        "filter compiled"
    );

    Ok(CompiledFilter {
        where_sql,
        params: lowering.params,
        columns_used: lowering.columns.into_iter().collect(),
        explanation: format!("Filter: {}", explain_group(&root)),
        schema_signature: schema.signature.clone(),
        dict_version: spec.dict_version.clone(),
        compiler_version: COMPILER_VERSION.to_string(),
        content_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use proptest::prelude::*;

    fn schema() -> SchemaSnapshot {
        let mut cols = IndexMap::new();
        for (c, t) in [
            ("state", "VARCHAR"),
            ("city", "VARCHAR"),
            ("company", "VARCHAR"),
            ("weight_oz", "DOUBLE"),
            ("order_total", "VARCHAR"),
            ("ship_date", "DATE"),
            ("notes", "UNKNOWN"),
        ] {
            cols.insert(c.to_string(), t.to_string());
        }
        SchemaSnapshot::new(cols)
    }

    fn spec(root: FilterGroup) -> ResolvedFilterSpec {
        let s = schema();
        ResolvedFilterSpec {
            status: ResolutionStatus::Resolved,
            resolved_spec_hash: canonical::spec_hash(&root),
            root,
            explanation: String::new(),
            resolution_token: None,
            pending_confirmations: vec![],
            unresolved_terms: vec![],
            schema_signature: s.signature,
            dict_version: "canonical_dict_v1".into(),
        }
    }

    fn cond(col: &str, op: FilterOperator, vals: &[&str]) -> FilterNode {
        FilterNode::Condition(
            FilterCondition::new(col, op)
                .with_operands(vals.iter().map(|v| TypedLiteral::string(*v)).collect()),
        )
    }

    fn dates(col: &str, a: &str, b: &str) -> FilterNode {
        FilterNode::Condition(
            FilterCondition::new(col, FilterOperator::Between).with_operands(vec![
                TypedLiteral::Date(a.into()),
                TypedLiteral::Date(b.into()),
            ]),
        )
    }

    fn compile_root(root: FilterGroup) -> Result<CompiledFilter, FilterError> {
        compile(&spec(root), &schema())
    }

    #[test]
    fn test_dt008_in_list_scenario() {
        let out = compile_root(FilterGroup::and(vec![cond(
            "state",
            FilterOperator::In,
            &["NY", "CA"],
        )]))
        .unwrap();
        assert_eq!(out.where_sql, "\"state\" IN ($1,$2)");
        assert_eq!(
            out.params,
            vec![SqlParam::Text("CA".into()), SqlParam::Text("NY".into())]
        );
        assert_eq!(out.columns_used, vec!["state".to_string()]);
        assert_eq!(out.explanation, "Filter: state in [CA, NY]");
        assert!(out.content_hash.starts_with("sha256:"));
    }

    #[test]
    fn test_dt008_in_list_commutative() {
        let a = compile_root(FilterGroup::and(vec![cond("state", FilterOperator::In, &["NY", "CA"])]))
            .unwrap();
        let b = compile_root(FilterGroup::and(vec![cond("state", FilterOperator::In, &["CA", "NY"])]))
            .unwrap();
        assert_eq!(a.where_sql, b.where_sql);
        assert_eq!(a.params, b.params);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_dt008_between_order_sensitive() {
        let a = compile_root(FilterGroup::and(vec![dates("ship_date", "2026-01-01", "2026-02-01")]))
            .unwrap();
        let b = compile_root(FilterGroup::and(vec![dates("ship_date", "2026-02-01", "2026-01-01")]))
            .unwrap();
        assert_eq!(a.where_sql, "\"ship_date\" BETWEEN $1 AND $2");
        assert_eq!(a.where_sql, b.where_sql);
        assert_ne!(a.params, b.params);
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a.params[0], SqlParam::Text("2026-01-01".into()));
    }

    #[test]
    fn test_dt008_nested_groups_and_counter() {
        let root = FilterGroup::and(vec![
            cond("state", FilterOperator::Eq, &["CA"]),
            FilterNode::Group(FilterGroup::or(vec![
                cond("city", FilterOperator::StartsWithCi, &["San"]),
                cond("company", FilterOperator::IsNotBlank, &[]),
            ])),
        ]);
        let out = compile_root(root).unwrap();
        assert_eq!(
            out.where_sql,
            "(\"city\" ILIKE $1 ESCAPE '\\' OR (TRIM(CAST(COALESCE(\"company\", '') AS VARCHAR)) != $2)) AND \"state\" = $3"
        );
        assert_eq!(
            out.params,
            vec![
                SqlParam::Text("San%".into()),
                SqlParam::Text(String::new()),
                SqlParam::Text("CA".into())
            ]
        );
        assert_eq!(out.columns_used, vec!["city", "company", "state"]);
    }

    #[test]
    fn test_dt008_like_escaping() {
        assert_eq!(escape_like(r"50%_off\now"), r"50\%\_off\\now");
        let out = compile_root(FilterGroup::and(vec![cond(
            "company",
            FilterOperator::ContainsCi,
            &["100%"],
        )]))
        .unwrap();
        assert_eq!(out.params, vec![SqlParam::Text(r"%100\%%".into())]);
    }

    #[test]
    fn test_dt008_null_tests_take_no_params() {
        let out = compile_root(FilterGroup::or(vec![
            cond("city", FilterOperator::IsNull, &[]),
            cond("state", FilterOperator::IsNotNull, &[]),
        ]))
        .unwrap();
        assert_eq!(out.where_sql, "\"city\" IS NULL OR \"state\" IS NOT NULL");
        assert!(out.params.is_empty());
    }

    #[test]
    fn test_dt008_numeric_text_ordering() {
        let out = compile_root(FilterGroup::and(vec![cond(
            "order_total",
            FilterOperator::Gte,
            &["$1,250.50"],
        )]))
        .unwrap();
        assert!(out.where_sql.starts_with("TRY_CAST(REPLACE(REPLACE(TRIM(COALESCE(\"order_total\""));
        assert!(out.where_sql.ends_with("AS DOUBLE) >= $1"));
        assert_eq!(out.params[0].to_string(), "1250.5");

        let err = compile_root(FilterGroup::and(vec![cond(
            "order_total",
            FilterOperator::Gt,
            &["lots"],
        )]))
        .unwrap_err();
        assert_eq!(err.code, FilterErrorCode::TypeMismatch);
    }

    #[test]
    fn test_dt008_type_mismatch() {
        let err = compile_root(FilterGroup::and(vec![cond("city", FilterOperator::Gt, &["M"])]))
            .unwrap_err();
        assert_eq!(err.code, FilterErrorCode::TypeMismatch);
        let err = compile_root(FilterGroup::and(vec![cond(
            "weight_oz",
            FilterOperator::ContainsCi,
            &["1"],
        )]))
        .unwrap_err();
        assert_eq!(err.code, FilterErrorCode::TypeMismatch);
        // Unknown types are not checked.
        assert!(compile_root(FilterGroup::and(vec![cond("notes", FilterOperator::Gt, &["a"])])).is_ok());
    }

    #[test]
    fn test_dt008_entry_guards() {
        let mut s = spec(FilterGroup::and(vec![cond("state", FilterOperator::Eq, &["CA"])]));
        s.status = ResolutionStatus::NeedsConfirmation;
        assert_eq!(
            compile(&s, &schema()).unwrap_err().code,
            FilterErrorCode::ConfirmationRequired
        );

        let s = spec(FilterGroup::and(vec![cond("state", FilterOperator::Eq, &["CA"])]));
        let changed = SchemaSnapshot::untyped(["state"]);
        assert_eq!(
            compile(&s, &changed).unwrap_err().code,
            FilterErrorCode::SchemaChanged
        );
    }

    #[test]
    fn test_dt008_unexpanded_reference() {
        let root = FilterGroup::and(vec![FilterNode::Reference(SemanticReference {
            semantic_key: "gulf".into(),
            target_column: "state".into(),
        })]);
        assert_eq!(
            compile_root(root).unwrap_err().code,
            FilterErrorCode::UnknownCanonicalTerm
        );
    }

    #[test]
    fn test_dt008_structural_limits() {
        let vals: Vec<String> = (0..=MAX_IN_CARDINALITY).map(|i| format!("v{:03}", i)).collect();
        let refs: Vec<&str> = vals.iter().map(|s| s.as_str()).collect();
        let err = compile_root(FilterGroup::and(vec![cond("city", FilterOperator::In, &refs)]))
            .unwrap_err();
        assert_eq!(err.code, FilterErrorCode::StructuralLimitExceeded);

        let many: Vec<FilterNode> = (0..=MAX_CONDITIONS)
            .map(|i| cond("city", FilterOperator::Eq, &[format!("c{}", i).as_str()]))
            .collect();
        let err = compile_root(FilterGroup::or(many)).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::StructuralLimitExceeded);

        // 6 lists of 90 values: under every per-node limit, over the param cap.
        let lists: Vec<FilterNode> = (0..6)
            .map(|k| {
                let vals: Vec<String> = (0..90).map(|i| format!("k{}v{:02}", k, i)).collect();
                let refs: Vec<&str> = vals.iter().map(|s| s.as_str()).collect();
                cond("city", FilterOperator::NotIn, &refs)
            })
            .collect();
        let err = compile_root(FilterGroup::and(lists)).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::StructuralLimitExceeded);

        let mut node = cond("state", FilterOperator::Eq, &["CA"]);
        for _ in 0..MAX_GROUP_DEPTH {
            node = FilterNode::Group(FilterGroup::and(vec![node]));
        }
        let err = compile_root(FilterGroup::and(vec![node])).unwrap_err();
        assert_eq!(err.code, FilterErrorCode::StructuralLimitExceeded);
    }

    #[test]
    fn test_dt008_literals_never_inlined() {
        let out = compile_root(FilterGroup::and(vec![cond(
            "city",
            FilterOperator::Eq,
            &["x' OR '1'='1"],
        )]))
        .unwrap();
        assert_eq!(out.where_sql, "\"city\" = $1");
        assert_eq!(out.params, vec![SqlParam::Text("x' OR '1'='1".into())]);
    }

    proptest! {
        #[test]
        fn prop_dt008_permuted_children_compile_identically(
            states in proptest::collection::vec("[A-Z]{2}", 1..8),
            cities in proptest::collection::vec("[a-z]{1,8}", 1..5),
            rot in 0usize..16,
        ) {
            let s_refs: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
            let mut children: Vec<FilterNode> = cities
                .iter()
                .map(|c| cond("city", FilterOperator::Neq, &[c.as_str()]))
                .collect();
            children.push(cond("state", FilterOperator::In, &s_refs));
            let a = compile_root(FilterGroup::and(children.clone())).unwrap();

            let mut permuted = children;
            let k = rot % permuted.len();
            permuted.rotate_left(k);
            let mut rev_states = s_refs.clone();
            rev_states.reverse();
            if let Some(FilterNode::Condition(c)) = permuted.iter_mut().find(|n| matches!(n, FilterNode::Condition(c) if c.operator == FilterOperator::In)) {
                c.operands = rev_states.iter().map(|v| TypedLiteral::string(*v)).collect();
            }
            let b = compile_root(FilterGroup::and(permuted)).unwrap();

            prop_assert_eq!(&a.where_sql, &b.where_sql);
            prop_assert_eq!(&a.params, &b.params);
            prop_assert_eq!(&a.content_hash, &b.content_hash);
        }

        #[test]
        fn prop_dt008_placeholders_match_params(n in 1usize..40) {
            let vals: Vec<String> = (0..n).map(|i| format!("v{}", i)).collect();
            let refs: Vec<&str> = vals.iter().map(|s| s.as_str()).collect();
            let out = compile_root(FilterGroup::and(vec![
                cond("city", FilterOperator::NotIn, &refs),
                cond("state", FilterOperator::Eq, &["CA"]),
            ])).unwrap();
            let placeholders = out.where_sql.matches('$').count();
            prop_assert_eq!(placeholders, out.params.len());
            let last = format!("${}", out.params.len());
            prop_assert!(out.where_sql.contains(&last));
        }
    }
}
