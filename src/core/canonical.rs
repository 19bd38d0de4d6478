//! DT-005: Canonical form of the filter tree.
//!
//! Logically equal trees canonicalize to the same structure: set operands
//! sorted and de-duplicated, group children sorted by their canonical
//! serialization. `between` operands keep authored order.

use crate::core::types::{FilterCondition, FilterGroup, FilterNode, TypedLiteral};
use crate::tripwire::hasher;
use serde_json::{json, Value};

/// JSON value of a literal, identical to its serde form.
pub fn literal_value(lit: &TypedLiteral) -> Value {
    let value = match lit {
        TypedLiteral::String(s) | TypedLiteral::Date(s) => Value::String(s.clone()),
        TypedLiteral::Number(n) => Value::Number(n.clone()),
        TypedLiteral::Boolean(b) => Value::Bool(*b),
    };
    json!({"type": lit.type_tag(), "value": value})
}

/// JSON value of a node, identical to its serde form.
pub fn node_value(node: &FilterNode) -> Value {
    match node {
        FilterNode::Condition(c) => json!({
            "kind": "condition",
            "column": c.column,
            "operator": c.operator.as_str(),
            "operands": c.operands.iter().map(literal_value).collect::<Vec<_>>(),
        }),
        FilterNode::Reference(r) => json!({
            "kind": "reference",
            "semantic_key": r.semantic_key,
            "target_column": r.target_column,
        }),
        FilterNode::Group(g) => {
            let mut v = group_value(g);
            if let Value::Object(map) = &mut v {
                map.insert("kind".to_string(), Value::String("group".to_string()));
            }
            v
        }
    }
}

/// JSON value of a group (no `kind` discriminant, as at the root).
pub fn group_value(group: &FilterGroup) -> Value {
    json!({
        "logic": group.logic.as_str(),
        "children": group.children.iter().map(node_value).collect::<Vec<_>>(),
    })
}

fn literal_order_key(lit: &TypedLiteral) -> (String, &'static str) {
    (lit.render(), lit.type_tag())
}

/// Sort and de-duplicate set operands; everything else is untouched.
pub fn canonicalize_condition(cond: &FilterCondition) -> FilterCondition {
    let mut out = cond.clone();
    if cond.operator.is_set() {
        out.operands
            .sort_by(|a, b| literal_order_key(a).cmp(&literal_order_key(b)));
        out.operands.dedup();
    }
    out
}

pub fn canonicalize_node(node: &FilterNode) -> FilterNode {
    match node {
        FilterNode::Condition(c) => FilterNode::Condition(canonicalize_condition(c)),
        FilterNode::Reference(r) => FilterNode::Reference(r.clone()),
        FilterNode::Group(g) => FilterNode::Group(canonicalize_group(g)),
    }
}

/// Canonicalize recursively, then order children by serialized form.
pub fn canonicalize_group(group: &FilterGroup) -> FilterGroup {
    let mut keyed: Vec<(String, FilterNode)> = group
        .children
        .iter()
        .map(|child| {
            let canon = canonicalize_node(child);
            (hasher::canonical_json(&node_value(&canon)), canon)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    FilterGroup {
        logic: group.logic,
        children: keyed.into_iter().map(|(_, n)| n).collect(),
    }
}

/// SHA-256 of the canonical tree. Input is canonicalized first.
pub fn spec_hash(root: &FilterGroup) -> String {
    hasher::content_hash(&group_value(&canonicalize_group(root)))
}
