//! DT-006: Semantic resolution of filter intent.
//!
//! Expands semantic references through the canonical dictionary, validates
//! conditions against the schema snapshot, canonicalizes the tree, and
//! aggregates status worst-of-children. Tier-A terms expand silently,
//! Tier-B terms expand but need a confirmation token, Tier-C terms are left
//! unexpanded with suggestions.
//!
//! Pure apart from token minting, which depends only on the secret and the
//! `now` passed in.

use super::canonical;
use super::dictionary::{CanonicalDictionary, TermClass};
use super::error::{FilterError, FilterErrorCode};
use super::token::{TokenBinding, TokenService};
use super::types::*;

/// Per-call context. Nothing here is shared between calls.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub session_id: &'a str,
    /// Tokens from earlier NEEDS_CONFIRMATION results.
    pub confirmations: &'a [String],
    /// Unix seconds.
    pub now: u64,
}

#[derive(Default)]
struct Findings {
    pending: Vec<PendingConfirmation>,
    unresolved: Vec<UnresolvedTerm>,
}

/// Check a condition's column and operand count.
pub fn validate_condition(cond: &FilterCondition, schema: &SchemaSnapshot) -> Result<(), FilterError> {
    if !schema.has_column(&cond.column) {
        return Err(FilterError::unknown_column(&cond.column));
    }
    let n = cond.operands.len();
    if cond.operator.arity().accepts(n) {
        return Ok(());
    }
    let code = match (cond.operator.arity(), n) {
        (Arity::AtLeastOne, 0) => FilterErrorCode::EmptyInList,
        (Arity::Exactly(_), 0) => FilterErrorCode::MissingOperand,
        _ => FilterErrorCode::InvalidArity,
    };
    let expected = match cond.operator.arity() {
        Arity::Exactly(k) => format!("exactly {}", k),
        Arity::AtLeastOne => "at least 1".to_string(),
        Arity::AtMostOne => "at most 1".to_string(),
    };
    Err(FilterError::new(
        code,
        format!(
            "operator {} on '{}' takes {} operand(s), got {}",
            cond.operator, cond.column, expected, n
        ),
    ))
}

fn resolve_reference(
    reference: &SemanticReference,
    schema: &SchemaSnapshot,
    dict: &CanonicalDictionary,
    findings: &mut Findings,
) -> Result<(FilterNode, ResolutionStatus), FilterError> {
    let require_target = || {
        if schema.has_column(&reference.target_column) {
            Ok(())
        } else {
            Err(FilterError::unknown_column(&reference.target_column))
        }
    };

    match dict.classify(&reference.semantic_key) {
        TermClass::State { code } => {
            require_target()?;
            let cond = FilterCondition::new(&reference.target_column, FilterOperator::Eq)
                .with_operands(vec![TypedLiteral::string(code)]);
            Ok((FilterNode::Condition(cond), ResolutionStatus::Resolved))
        }
        TermClass::Region { key, states } => {
            require_target()?;
            let cond = canonical::canonicalize_condition(
                &FilterCondition::new(&reference.target_column, FilterOperator::In)
                    .with_operands(states.iter().map(TypedLiteral::string).collect()),
            );
            let node = FilterNode::Condition(cond);
            findings.pending.push(PendingConfirmation {
                semantic_key: reference.semantic_key.clone(),
                target_column: reference.target_column.clone(),
                expansion: node.clone(),
                description: format!("region {} expands to {} states: {}", key, states.len(), node),
            });
            Ok((node, ResolutionStatus::NeedsConfirmation))
        }
        TermClass::Predicate { key, predicate } => {
            let matches = schema.match_columns(&predicate.column_patterns);
            let column = match matches.as_slice() {
                [] => {
                    return Err(FilterError::new(
                        FilterErrorCode::MissingTargetColumn,
                        format!(
                            "{} needs one of [{}] in the schema",
                            key,
                            predicate.column_patterns.join(", ")
                        ),
                    ))
                }
                [only] => only.clone(),
                many => {
                    return Err(FilterError::new(
                        FilterErrorCode::AmbiguousTerm,
                        format!("{} matches several columns: {}", key, many.join(", ")),
                    ))
                }
            };
            let node = FilterNode::Condition(FilterCondition::new(
                column,
                predicate.expansion.operator(),
            ));
            findings.pending.push(PendingConfirmation {
                semantic_key: reference.semantic_key.clone(),
                target_column: reference.target_column.clone(),
                expansion: node.clone(),
                description: format!("{}: {} ({})", key, predicate.description, node),
            });
            Ok((node, ResolutionStatus::NeedsConfirmation))
        }
        TermClass::Unknown => {
            findings.unresolved.push(UnresolvedTerm {
                semantic_key: reference.semantic_key.clone(),
                target_column: reference.target_column.clone(),
                suggestions: dict.suggest(&reference.semantic_key),
            });
            Ok((
                FilterNode::Reference(reference.clone()),
                ResolutionStatus::Unresolved,
            ))
        }
    }
}

fn resolve_group(
    group: &FilterGroup,
    depth: usize,
    schema: &SchemaSnapshot,
    dict: &CanonicalDictionary,
    findings: &mut Findings,
) -> Result<(FilterGroup, ResolutionStatus), FilterError> {
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

    let mut status = ResolutionStatus::Resolved;
    let mut children = Vec::with_capacity(group.children.len());
    for child in &group.children {
        let (node, child_status) = match child {
            FilterNode::Condition(c) => {
                validate_condition(c, schema)?;
                (FilterNode::Condition(c.clone()), ResolutionStatus::Resolved)
            }
            FilterNode::Reference(r) => resolve_reference(r, schema, dict, findings)?,
            FilterNode::Group(g) => {
                let (g, s) = resolve_group(g, depth + 1, schema, dict, findings)?;
                (FilterNode::Group(g), s)
            }
        };
        status = status.worst(child_status);
        children.push(node);
    }

    let resolved = FilterGroup {
        logic: group.logic,
        children,
    };
    Ok((canonical::canonicalize_group(&resolved), status))
}

/// Resolve an intent against a schema snapshot.
///
/// Errors are final denials. A non-empty `ctx.confirmations` that fails to
/// validate for a Tier-B result is a denial, not a fallback to a fresh
/// NEEDS_CONFIRMATION.
pub fn resolve(
    intent: &FilterIntent,
    schema: &SchemaSnapshot,
    dict: &CanonicalDictionary,
    tokens: &TokenService,
    ctx: &ResolveContext<'_>,
) -> Result<ResolvedFilterSpec, FilterError> {
    let mut findings = Findings::default();
    let (root, mut status) = resolve_group(&intent.root, 1, schema, dict, &mut findings)?;
    let resolved_spec_hash = canonical::spec_hash(&root);

    let binding = |status: ResolutionStatus| TokenBinding {
        session_id: ctx.session_id.to_string(),
        schema_signature: schema.signature.clone(),
        dict_version: dict.version().to_string(),
        resolved_spec_hash: resolved_spec_hash.clone(),
        status,
    };

    if status == ResolutionStatus::NeedsConfirmation && !ctx.confirmations.is_empty() {
        let expected = binding(ResolutionStatus::NeedsConfirmation);
        let mut last_err = None;
        for tok in ctx.confirmations {
            match tokens.validate(tok, &expected, ctx.now) {
                Ok(_) => {
                    last_err = None;
                    status = ResolutionStatus::Resolved;
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        if let Some(e) = last_err {
            tracing::warn!(session = ctx.session_id, code = %e.code, "confirmation rejected");
            return Err(e);
        }
        tracing::info!(session = ctx.session_id, "tier-B expansion confirmed");
        findings.pending.clear();
    }

    let resolution_token = match status {
        ResolutionStatus::Unresolved => None,
        s => Some(tokens.mint(&binding(s), ctx.now)),
    };
    let explanation = explain(status, &root, &findings);

    tracing::debug!(
        session = ctx.session_id,
        status = %status,
        spec_hash = %resolved_spec_hash,
        "intent resolved"
    );

    Ok(ResolvedFilterSpec {
        status,
        root,
        explanation,
        resolution_token,
        pending_confirmations: findings.pending,
        unresolved_terms: findings.unresolved,
        schema_signature: schema.signature.clone(),
        dict_version: dict.version().to_string(),
        resolved_spec_hash,
    })
}

fn explain(status: ResolutionStatus, root: &FilterGroup, findings: &Findings) -> String {
    match status {
        ResolutionStatus::Resolved => format!("Filter: {}", root),
        ResolutionStatus::NeedsConfirmation => {
            let items: Vec<&str> = findings
                .pending
                .iter()
                .map(|p| p.description.as_str())
                .collect();
            format!("Confirmation required: {}", items.join("; "))
        }
        ResolutionStatus::Unresolved => {
            let items: Vec<String> = findings
                .unresolved
                .iter()
                .map(|u| {
                    let keys: Vec<&str> = u.suggestions.iter().map(|s| s.key.as_str()).collect();
                    format!("'{}' (did you mean {}?)", u.semantic_key, keys.join(", "))
                })
                .collect();
            format!("Unrecognized terms: {}", items.join("; "))
        }
    }
}
