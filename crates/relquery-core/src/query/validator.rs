//! Guardrails applied to every plan before it is executed, cached or not.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::ValidationMode;
use crate::errors::{ErrorContext, RelQueryError, RelQueryResult};
use crate::models::{normalize_entity_type, FilterCondition, FilterOperator, FilterValue, RelationshipQueryPlan};
use crate::query::guards::{
    clamp_depth, MAX_FILTERS_PER_PLAN, MAX_IN_LIST_VALUES, MAX_QUERY_LENGTH, MAX_RELATIONSHIP_PATHS,
};
use crate::schema::SchemaRegistry;

pub const VALIDATION_STAGE: &str = "VALIDATION";

static INJECTION_SIGNATURES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("ddl", r"(?i)\b(drop|truncate|alter|create)\s+(table|database|schema|index|view)\b"),
        ("delete", r"(?i)\bdelete\s+from\b"),
        ("insert", r"(?i)\binsert\s+into\b"),
        ("update", r"(?i)\bupdate\s+\w+\s+set\b"),
        ("union-select", r"(?i)\bunion\s+(all\s+)?select\b"),
        ("tautology", r"(?i)\b(or|and)\s+'?1'?\s*=\s*'?1\b"),
        ("terminator-comment", r";\s*(--|/\*|#)"),
        ("stacked-statement", r"(?i);\s*(drop|delete|insert|update|alter|create|truncate|exec)\b"),
        ("catalog-probe", r"(?i)\b(information_schema|sqlite_master|sqlite_schema|pg_catalog)\b"),
        ("procedure", r"(?i)\bexec(ute)?\s+(xp|sp)_\w+"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).unwrap()))
    .collect()
});

static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").unwrap());

/// Name of the first injection signature matched by `text`, if any.
pub fn injection_signature(text: &str) -> Option<&'static str> {
    INJECTION_SIGNATURES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(name, _)| *name)
}

pub fn is_valid_field(field: &str) -> bool {
    FIELD_RE.is_match(field)
}

pub struct QueryValidator {
    registry: Arc<SchemaRegistry>,
    max_traversal_depth: usize,
}

impl QueryValidator {
    pub fn new(registry: Arc<SchemaRegistry>, max_traversal_depth: usize) -> Self {
        Self {
            registry,
            max_traversal_depth: clamp_depth(max_traversal_depth),
        }
    }

    /// Reject unsafe or schema-inconsistent plans. Pure check, no side effects.
    pub fn validate(&self, plan: &RelationshipQueryPlan, mode: ValidationMode) -> RelQueryResult<()> {
        self.check(plan, mode).map_err(|reason| {
            let candidates: Vec<String> = plan.candidate_entity_types.iter().cloned().collect();
            RelQueryError::Validation(
                ErrorContext::new(VALIDATION_STAGE, &plan.original_query)
                    .with_entity(Some(&plan.primary_entity_type), &candidates)
                    .with_reason(format!("{reason} [{}]", mode.as_str())),
            )
        })
    }

    fn check(&self, plan: &RelationshipQueryPlan, mode: ValidationMode) -> Result<(), String> {
        let strict = mode == ValidationMode::Strict;

        // Query text
        let text = plan.original_query.trim();
        if text.is_empty() {
            return Err("original query text is blank".into());
        }
        if text.len() > MAX_QUERY_LENGTH {
            return Err(format!("original query text exceeds {MAX_QUERY_LENGTH} bytes"));
        }
        if let Some(signature) = injection_signature(text) {
            return Err(format!("query text matches injection signature '{signature}'"));
        }
        if let Some(signature) = plan.semantic_query.as_deref().and_then(injection_signature) {
            return Err(format!("semantic query matches injection signature '{signature}'"));
        }

        // Entity types
        let primary = normalize_entity_type(&plan.primary_entity_type);
        if primary.is_empty() {
            return Err("primary entity type is blank".into());
        }
        if !self.registry.has_entity_type(&primary) {
            return Err(format!("primary entity type '{primary}' is not registered"));
        }
        if !plan.candidate_entity_types.is_empty() {
            let candidates: Vec<String> = plan
                .candidate_entity_types
                .iter()
                .map(|c| normalize_entity_type(c))
                .collect();
            if !candidates.contains(&primary) {
                return Err(format!("candidate entity types omit primary type '{primary}'"));
            }
            if strict {
                if let Some(unknown) = candidates.iter().find(|c| !self.registry.has_entity_type(c)) {
                    return Err(format!("candidate entity type '{unknown}' is not registered"));
                }
            }
        }
        if plan.limit == 0 {
            return Err("limit must be greater than zero".into());
        }

        // Relationship paths
        if plan.relationship_paths.len() > MAX_RELATIONSHIP_PATHS {
            return Err(format!(
                "plan has {} relationship paths, maximum is {MAX_RELATIONSHIP_PATHS}",
                plan.relationship_paths.len()
            ));
        }
        let mut depth: HashMap<String, usize> = HashMap::from([(primary.clone(), 0)]);
        for (index, path) in plan.relationship_paths.iter().enumerate() {
            let from = normalize_entity_type(&path.from_entity_type);
            let to = normalize_entity_type(&path.to_entity_type);
            if from.is_empty() || to.is_empty() {
                return Err(format!("relationship path #{index} has a blank from/to entity type"));
            }
            let hop_depth = match depth.get(&from) {
                Some(d) => d + 1,
                None if strict => {
                    return Err(format!(
                        "relationship path #{index} starts at '{from}', which the plan never reaches"
                    ))
                }
                None => 1,
            };
            if hop_depth > self.max_traversal_depth {
                return Err(format!(
                    "relationship path #{index} reaches depth {hop_depth}, maximum is {}",
                    self.max_traversal_depth
                ));
            }
            depth
                .entry(to.clone())
                .and_modify(|d| *d = (*d).min(hop_depth))
                .or_insert(hop_depth);

            if strict {
                for endpoint in [&from, &to] {
                    if !self.registry.has_entity_type(endpoint) {
                        return Err(format!("relationship path #{index} uses unregistered type '{endpoint}'"));
                    }
                }
                let Some(name) = path.relationship_name() else {
                    return Err(format!("relationship path #{index} ({from} -> {to}) lacks a relationship type"));
                };
                if self.registry.resolve_hop(&from, &to, name, path.direction).is_none() {
                    return Err(format!(
                        "relationship '{name}' from '{from}' to '{to}' is not registered"
                    ));
                }
            }
            for condition in &path.conditions {
                check_condition(condition)?;
            }
        }

        // Direct filters
        let mut total_filters: usize = plan.relationship_paths.iter().map(|p| p.conditions.len()).sum();
        for (entity, filters) in &plan.direct_filters {
            let entity = normalize_entity_type(entity);
            if entity.is_empty() {
                return Err("direct filter has a blank entity type".into());
            }
            if strict && !filters.is_empty() && !depth.contains_key(&entity) {
                return Err(format!("direct filters target '{entity}', which the plan never reaches"));
            }
            for condition in filters {
                check_condition(condition)?;
            }
            total_filters += filters.len();
        }
        if total_filters > MAX_FILTERS_PER_PLAN {
            return Err(format!("plan has {total_filters} filters, maximum is {MAX_FILTERS_PER_PLAN}"));
        }
        Ok(())
    }
}

fn check_condition(condition: &FilterCondition) -> Result<(), String> {
    let field = condition.field.trim();
    if !is_valid_field(field) {
        return Err(format!("filter field '{field}' is not a valid identifier"));
    }
    match condition.operator {
        FilterOperator::Exists | FilterOperator::NotExists => Ok(()),
        FilterOperator::In | FilterOperator::NotIn => match &condition.value {
            FilterValue::List(items) if !items.is_empty() && items.len() <= MAX_IN_LIST_VALUES => Ok(()),
            FilterValue::List(items) if items.is_empty() => {
                Err(format!("{} filter on '{field}' has an empty list", condition.operator.as_str()))
            }
            FilterValue::List(_) => Err(format!(
                "{} filter on '{field}' exceeds {MAX_IN_LIST_VALUES} values",
                condition.operator.as_str()
            )),
            _ => Err(format!("{} filter on '{field}' needs a list value", condition.operator.as_str())),
        },
        FilterOperator::Between => match &condition.secondary_value {
            Some(upper) if !condition.value.is_null() && !upper.is_null() => Ok(()),
            _ => Err(format!("BETWEEN filter on '{field}' needs two bounds")),
        },
        _ if condition.value.is_null() => {
            Err(format!("{} filter on '{field}' has no value", condition.operator.as_str()))
        }
        _ if matches!(condition.value, FilterValue::List(_)) => Err(format!(
            "{} filter on '{field}' does not accept a list",
            condition.operator.as_str()
        )),
        _ => Ok(()),
    }
}
