//! Metadata tier: rebuilds relationship edges from each entity's stored
//! metadata document and filters in memory.
//!
//! Related entities are expected as nested objects (or arrays of objects)
//! keyed by relationship name or target type, e.g.
//! `{"status": "ACTIVE", "author": {"fullName": "John Smith"}}`. Flattened
//! keys (`"author.fullName"`) are accepted too. Matching is any-of over
//! arrays; negated operators negate the positive match.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::{
    normalize_entity_type, ExecutionStage, FilterCondition, FilterOperator, FilterValue,
    RelationshipQueryPlan,
};
use crate::query::guards::METADATA_SCAN_CAP;
use crate::query::traversal::{traversal_context, TraversalExecutor, TraversalRequest};
use crate::store::EntityStore;

/// A filter together with the alternative metadata prefixes it may live under.
struct ScopedCondition<'a> {
    scopes: Vec<Vec<String>>,
    condition: &'a FilterCondition,
}

pub struct MetadataTraversalExecutor {
    store: Arc<dyn EntityStore>,
    scan_cap: usize,
}

impl MetadataTraversalExecutor {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            scan_cap: METADATA_SCAN_CAP,
        }
    }

    pub fn with_scan_cap(mut self, scan_cap: usize) -> Self {
        self.scan_cap = scan_cap.max(1);
        self
    }
}

impl TraversalExecutor for MetadataTraversalExecutor {
    fn stage(&self) -> ExecutionStage {
        ExecutionStage::FallbackMetadata
    }

    fn execute(&self, request: &TraversalRequest<'_>) -> RelQueryResult<Vec<String>> {
        let stage = self.stage();
        let plan = request.plan;
        let fail = |reason: String| RelQueryError::RelationshipTraversal(traversal_context(stage, plan, reason));

        let candidates = self
            .store
            .scan_entities(&plan.primary_entity_type, self.scan_cap)
            .map_err(|e| fail(e.to_string()))?;
        let conditions = scoped_conditions(plan);
        if conditions.is_empty() {
            return Ok(candidates
                .into_iter()
                .take(request.limit)
                .map(|entity| entity.entity_id)
                .collect());
        }

        let mut matches = Vec::new();
        for entity in candidates {
            let Some(raw) = entity.metadata.as_deref().filter(|m| !m.trim().is_empty()) else {
                continue;
            };
            let document: Map<String, Value> = serde_json::from_str(raw).map_err(|e| {
                fail(format!("malformed metadata on {}:{}: {e}", entity.entity_type, entity.entity_id))
            })?;
            if conditions.iter().all(|scoped| {
                let found = lookup(&document, &scoped.scopes, &scoped.condition.field);
                evaluate(scoped.condition, &found)
            }) {
                matches.push(entity.entity_id);
                if matches.len() >= request.limit {
                    break;
                }
            }
        }
        debug!(results = matches.len(), "metadata traversal finished");
        Ok(matches)
    }
}

/// Direct filters plus every hop's conditions, each with its metadata scopes.
fn scoped_conditions(plan: &RelationshipQueryPlan) -> Vec<ScopedCondition<'_>> {
    let primary = normalize_entity_type(&plan.primary_entity_type);
    let mut scopes_by_type: HashMap<String, Vec<Vec<String>>> = HashMap::from([(primary, vec![Vec::new()])]);
    let mut merged = Vec::new();

    for path in &plan.relationship_paths {
        let from = normalize_entity_type(&path.from_entity_type);
        let to = normalize_entity_type(&path.to_entity_type);
        let parents = scopes_by_type.get(&from).cloned().unwrap_or_else(|| vec![Vec::new()]);
        let mut scopes = Vec::new();
        for parent in &parents {
            for segment in path.relationship_name().into_iter().chain([to.as_str()]) {
                let mut scope = parent.clone();
                scope.push(segment.to_string());
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
        }
        for condition in &path.conditions {
            merged.push(ScopedCondition {
                scopes: scopes.clone(),
                condition,
            });
        }
        scopes_by_type.entry(to).or_insert(scopes);
    }

    for (entity, filters) in &plan.direct_filters {
        let entity = normalize_entity_type(entity);
        let scopes = scopes_by_type
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| vec![vec![entity.clone()]]);
        for condition in filters {
            merged.push(ScopedCondition {
                scopes: scopes.clone(),
                condition,
            });
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Walk `segments` through nested objects, flattening arrays on the way.
fn navigate<'a>(root: &'a Map<String, Value>, segments: &[&str]) -> Vec<&'a Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Vec::new();
    };
    let mut current: Vec<&Value> = match root.get(*first) {
        Some(v) => vec![v],
        None => return Vec::new(),
    };
    for segment in rest {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => next.extend(map.get(*segment)),
                Value::Array(items) => {
                    for item in items {
                        if let Value::Object(map) = item {
                            next.extend(map.get(*segment));
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    let mut flattened = Vec::new();
    for value in current {
        match value {
            Value::Array(items) => flattened.extend(items.iter()),
            other => flattened.push(other),
        }
    }
    flattened
}

/// Resolve `field` under each scope first, then at top level by exact key,
/// dotted path, suffix after the last dot, and dot-condensed key.
fn lookup<'a>(document: &'a Map<String, Value>, scopes: &[Vec<String>], field: &str) -> Vec<&'a Value> {
    let field = field.trim();
    let field_segments: Vec<&str> = field.split('.').collect();

    for scope in scopes.iter().filter(|s| !s.is_empty()) {
        let mut segments: Vec<&str> = scope.iter().map(String::as_str).collect();
        segments.extend(field_segments.iter().copied());
        let found = navigate(document, &segments);
        if !found.is_empty() {
            return found;
        }
        let flat_key = format!("{}.{field}", scope.join("."));
        if let Some(v) = document.get(&flat_key) {
            return navigate_value(v);
        }
    }

    if let Some(v) = document.get(field) {
        return navigate_value(v);
    }
    if field_segments.len() > 1 {
        let found = navigate(document, &field_segments);
        if !found.is_empty() {
            return found;
        }
        if let Some(suffix) = field_segments.last() {
            if let Some(v) = document.get(*suffix) {
                return navigate_value(v);
            }
        }
        if let Some(v) = document.get(&field.replace('.', "")) {
            return navigate_value(v);
        }
    }
    Vec::new()
}

fn navigate_value(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn normalized(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_ascii_lowercase()),
        other => Some(other.to_string().trim().to_ascii_lowercase()),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Numeric when both sides are numbers, else case-insensitive text order.
fn compare(candidate: &Value, expected: &FilterValue) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(candidate), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    let left = normalized(candidate)?;
    let right = expected.normalized_text()?;
    Some(left.cmp(&right))
}

fn equals(candidate: &Value, expected: &FilterValue) -> bool {
    if let (Some(a), Some(b)) = (numeric(candidate), expected.as_f64()) {
        if matches!(candidate, Value::Number(_)) {
            return a == b;
        }
    }
    match (normalized(candidate), expected.normalized_text()) {
        (Some(left), Some(right)) => left == right,
        (None, None) => true,
        _ => false,
    }
}

fn contains(candidate: &Value, expected: &FilterValue) -> bool {
    match (normalized(candidate), expected.normalized_text()) {
        (Some(haystack), Some(needle)) => haystack.contains(&needle.replace('%', "")),
        _ => false,
    }
}

fn one_of(candidate: &Value, expected: &FilterValue) -> bool {
    match expected {
        FilterValue::List(options) => options.iter().any(|option| equals(candidate, option)),
        single => equals(candidate, single),
    }
}

fn any_match(found: &[&Value], test: impl Fn(&Value) -> bool) -> bool {
    found.iter().any(|v| test(v))
}

fn evaluate(condition: &FilterCondition, found: &[&Value]) -> bool {
    let expected = &condition.value;
    match condition.operator {
        FilterOperator::Equals => any_match(found, |v| equals(v, expected)),
        FilterOperator::NotEquals => !any_match(found, |v| equals(v, expected)),
        FilterOperator::GreaterThan => {
            any_match(found, |v| compare(v, expected) == Some(Ordering::Greater))
        }
        FilterOperator::GreaterThanOrEqual => any_match(found, |v| {
            matches!(compare(v, expected), Some(Ordering::Greater | Ordering::Equal))
        }),
        FilterOperator::LessThan => any_match(found, |v| compare(v, expected) == Some(Ordering::Less)),
        FilterOperator::LessThanOrEqual => any_match(found, |v| {
            matches!(compare(v, expected), Some(Ordering::Less | Ordering::Equal))
        }),
        FilterOperator::Like | FilterOperator::Ilike => any_match(found, |v| contains(v, expected)),
        FilterOperator::In => any_match(found, |v| one_of(v, expected)),
        FilterOperator::NotIn => !any_match(found, |v| one_of(v, expected)),
        FilterOperator::Between => {
            let Some(upper) = &condition.secondary_value else {
                return false;
            };
            any_match(found, |v| {
                matches!(compare(v, expected), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(v, upper), Some(Ordering::Less | Ordering::Equal))
            })
        }
        FilterOperator::Exists => any_match(found, |v| !v.is_null()),
        FilterOperator::NotExists => !any_match(found, |v| !v.is_null()),
    }
}
