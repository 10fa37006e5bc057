//! Oracle response parsing and payload normalization.
//!
//! The oracle is asked for a JSON plan but routinely returns prose around it,
//! shorthand filters (`{"price": "<= 100"}`, `"price BETWEEN 10 AND 20"`),
//! plural or aliased entity slugs and entity-prefixed field names. Everything
//! here rewrites the raw JSON into the shape [`RelationshipQueryPlan`]
//! deserializes from. Nothing is invented: a payload that still does not
//! parse is a planning error.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::PlannerConfig;
use crate::errors::{ErrorContext, RelQueryError, RelQueryResult};
use crate::models::{normalize_entity_type, FilterOperator, RelationshipDirection, RelationshipQueryPlan};
use crate::query::guards::{clamp_limit, DEFAULT_TRAVERSAL_DEPTH, MAX_RESULT_LIMIT};
use crate::schema::SchemaRegistry;

pub const PLANNING_STAGE: &str = "PLANNING";

static BINARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([\w\-.]+)\s*(>=|<=|!=|<>|==|=|>|<)\s*(.+)$").unwrap());
static BINARY_NO_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(>=|<=|!=|<>|==|=|>|<)\s*(.+)$").unwrap());
static BETWEEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([\w\-.]+)\s+BETWEEN\s+(.+)\s+AND\s+(.+)$").unwrap());
static BETWEEN_NO_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^BETWEEN\s+(.+)\s+AND\s+(.+)$").unwrap());
static IN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([\w\-.]+)\s+IN\s*\((.+)\)$").unwrap());
static IN_NO_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^IN\s*\((.+)\)$").unwrap());
static INTEGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+$").unwrap());
static FLOAT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d*\.\d+$").unwrap());
static QUARTER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)q([1-4])\s*(20\d{2})").unwrap());

pub(crate) fn planning_error(query: &str, reason: impl Into<String>) -> RelQueryError {
    RelQueryError::QueryPlanning(ErrorContext::new(PLANNING_STAGE, query).with_reason(reason))
}

/// Substring from the first `{` to the last `}`.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse an oracle response into a plan for `query`.
///
/// `default_primary` fills a missing primary type (the first entity hint, if
/// the caller gave any); `default_limit` fills a missing or zero limit.
pub fn parse_plan(
    raw: &str,
    query: &str,
    default_primary: Option<&str>,
    default_limit: usize,
    registry: &SchemaRegistry,
    config: &PlannerConfig,
) -> RelQueryResult<RelationshipQueryPlan> {
    let payload = extract_json_object(raw)
        .ok_or_else(|| planning_error(query, "oracle response contained no JSON object"))?;
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| planning_error(query, format!("oracle response is not valid JSON: {e}")))?;
    let Value::Object(mut root) = value else {
        return Err(planning_error(query, "oracle payload is not a JSON object"));
    };

    root.insert("originalQuery".into(), Value::String(query.to_string()));
    let has_primary = root
        .get("primaryEntityType")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty());
    if !has_primary {
        if let Some(primary) = default_primary {
            root.insert("primaryEntityType".into(), Value::String(primary.to_string()));
        }
    }
    let limit = root.get("limit").and_then(Value::as_u64).filter(|l| *l > 0);
    let limit = limit.map_or(clamp_limit(default_limit, MAX_RESULT_LIMIT), |l| {
        clamp_limit(l as usize, MAX_RESULT_LIMIT)
    });
    root.insert("limit".into(), json!(limit));

    if config.normalization_enabled {
        PayloadNormalizer::new(registry, config).normalize(&mut root, query);
    }

    let mut plan: RelationshipQueryPlan = serde_json::from_value(Value::Object(root))
        .map_err(|e| planning_error(query, format!("oracle payload does not describe a plan: {e}")))?;
    plan.confidence = plan.confidence.map(|c| if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) });
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

struct PayloadNormalizer<'a> {
    registry: &'a SchemaRegistry,
    config: &'a PlannerConfig,
}

impl<'a> PayloadNormalizer<'a> {
    fn new(registry: &'a SchemaRegistry, config: &'a PlannerConfig) -> Self {
        Self { registry, config }
    }

    fn normalize(&self, root: &mut Map<String, Value>, query: &str) {
        for key in ["queryStrategy", "returnMode"] {
            upper_enum(root, key);
        }

        let primary = root
            .get("primaryEntityType")
            .and_then(Value::as_str)
            .map(|p| self.canonical_slug(p));
        if let Some(primary) = &primary {
            root.insert("primaryEntityType".into(), Value::String(primary.clone()));
        }
        self.normalize_candidates(root, primary.as_deref());

        let mut direct = self.normalize_filter_map(root.remove("directFilters"));
        self.normalize_paths(root, &mut direct);
        let relationship_filters = root.remove("relationshipFilters");
        let leftovers = self.merge_relationship_filters(root, relationship_filters);
        for (entity, filters) in leftovers {
            append_filters(&mut direct, &entity, filters);
        }

        if let (Some(field), Some(primary)) = (self.config.quarter_date_field.as_deref(), primary.as_deref()) {
            apply_quarter_range(&mut direct, primary, field, query);
        }
        if !direct.is_empty() {
            root.insert("directFilters".into(), Value::Object(direct));
        }
    }

    /// Registered type for `slug`, trying plural forms and relationship
    /// field names before giving up and returning the lower-cased input.
    fn canonical_slug(&self, slug: &str) -> String {
        let normalized = normalize_entity_type(slug);
        if self.registry.has_entity_type(&normalized) {
            return normalized;
        }
        let singulars = [
            normalized.strip_suffix("ies").map(|s| format!("{s}y")),
            normalized.strip_suffix("es").map(str::to_string),
            normalized.strip_suffix('s').map(str::to_string),
        ];
        for candidate in singulars.into_iter().flatten() {
            if self.registry.has_entity_type(&candidate) {
                return candidate;
            }
        }
        let key = condense(&normalized);
        for mapping in self.registry.all_relationship_mappings() {
            if condense(&mapping.field_name) == key {
                return mapping.to_entity_type;
            }
        }
        normalized
    }

    fn normalize_candidates(&self, root: &mut Map<String, Value>, primary: Option<&str>) {
        let mut candidates: Vec<String> = match root.get("candidateEntityTypes") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(|s| self.canonical_slug(s))
                .collect(),
            Some(Value::String(single)) => vec![self.canonical_slug(single)],
            _ => Vec::new(),
        };
        if let Some(primary) = primary {
            candidates.push(primary.to_string());
        }
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        root.insert("candidateEntityTypes".into(), json!(candidates));
    }

    fn normalize_filter_map(&self, raw: Option<Value>) -> Map<String, Value> {
        let mut rebuilt = Map::new();
        let Some(Value::Object(entries)) = raw else {
            return rebuilt;
        };
        for (key, value) in entries {
            let entity = self.canonical_slug(&key);
            let filters = self.normalize_filters(&value, Some(&entity), None);
            append_filters(&mut rebuilt, &entity, filters);
        }
        rebuilt
    }

    fn normalize_paths(&self, root: &mut Map<String, Value>, direct: &mut Map<String, Value>) {
        let Some(Value::Array(paths)) = root.get_mut("relationshipPaths") else {
            return;
        };
        let mut expanded = Vec::with_capacity(paths.len());
        for mut value in std::mem::take(paths) {
            let Some(path) = value.as_object_mut() else {
                expanded.push(value);
                continue;
            };
            upper_enum(path, "direction");
            let from = path
                .get("fromEntityType")
                .and_then(Value::as_str)
                .map(|s| self.canonical_slug(s))
                .unwrap_or_default();
            let to = path
                .get("toEntityType")
                .and_then(Value::as_str)
                .map(|s| self.canonical_slug(s))
                .unwrap_or_default();
            path.insert("fromEntityType".into(), Value::String(from.clone()));
            path.insert("toEntityType".into(), Value::String(to.clone()));

            let named = path
                .get("relationshipType")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let relationship = named.or_else(|| {
                let edge = self
                    .registry
                    .unique_edge_between(&from, &to)
                    .or_else(|| self.registry.unique_edge_between(&to, &from))?;
                debug!(from = %from, to = %to, field = %edge.field_name, "filled relationship type from schema");
                Some(edge.field_name)
            });
            let relationship = match relationship {
                Some(name) => Some(name),
                None => self.bridge(path, &from, &to, &mut expanded),
            };
            if let Some(name) = &relationship {
                path.insert("relationshipType".into(), Value::String(name.clone()));
            }

            let raw_conditions = path.remove("conditions").unwrap_or(Value::Null);
            let mut kept = Vec::new();
            for condition in self.normalize_filters(&raw_conditions, Some(&to), relationship.as_deref()) {
                match self.reroute_target(&condition, &to, relationship.as_deref()) {
                    Some((entity, stripped)) => append_filters(direct, &entity, vec![stripped]),
                    None => kept.push(condition),
                }
            }
            if !kept.is_empty() {
                path.insert("conditions".into(), Value::Array(kept));
            }
            expanded.push(value);
        }
        *paths = expanded;
    }

    /// Expand an unnamed hop with no direct edge into the shortest chain the
    /// schema allows. Leading links go to `out`; `path` becomes the last link
    /// and keeps its conditions.
    fn bridge(&self, path: &mut Map<String, Value>, from: &str, to: &str, out: &mut Vec<Value>) -> Option<String> {
        let chain = self.registry.find_path(from, to, DEFAULT_TRAVERSAL_DEPTH)?;
        if chain.len() < 2 {
            return None;
        }
        let mut current = from.to_string();
        for hop in &chain {
            let next = if hop.stored_forward {
                hop.mapping.to_entity_type.clone()
            } else {
                hop.mapping.from_entity_type.clone()
            };
            let direction = if hop.stored_forward {
                RelationshipDirection::Forward
            } else {
                RelationshipDirection::Reverse
            };
            if next == to {
                path.insert("fromEntityType".into(), Value::String(current));
                path.insert("direction".into(), Value::String(direction.as_str().into()));
                break;
            }
            out.push(json!({
                "fromEntityType": current,
                "toEntityType": next,
                "relationshipType": hop.mapping.field_name,
                "direction": direction.as_str(),
                "optional": hop.mapping.optional,
            }));
            current = next;
        }
        let last = chain.last()?;
        debug!(from = %from, to = %to, hops = chain.len(), "bridged hop through schema path");
        Some(last.mapping.field_name.clone())
    }

    /// A hop condition whose field is prefixed by a different registered
    /// entity belongs to that entity's direct filters.
    fn reroute_target(&self, condition: &Value, hop_target: &str, relationship: Option<&str>) -> Option<(String, Value)> {
        let field = condition.get("field")?.as_str()?;
        let (prefix, rest) = field.split_once('.')?;
        let entity = self.canonical_slug(prefix);
        let same_hop = entity == hop_target || relationship.is_some_and(|r| condense(r) == condense(prefix));
        if same_hop || !self.registry.has_entity_type(&entity) {
            return None;
        }
        let mut moved = condition.clone();
        moved["field"] = Value::String(rest.to_string());
        Some((entity, moved))
    }

    /// Attach `relationshipFilters` to the hops that reach their entity;
    /// returns the ones no hop reaches.
    fn merge_relationship_filters(&self, root: &mut Map<String, Value>, raw: Option<Value>) -> Vec<(String, Vec<Value>)> {
        let mut leftovers = Vec::new();
        let Some(Value::Object(entries)) = raw else {
            return leftovers;
        };
        for (key, value) in entries {
            let entity = self.canonical_slug(&key);
            let filters = self.normalize_filters(&value, Some(&entity), None);
            if filters.is_empty() {
                continue;
            }
            let mut applied = false;
            if let Some(Value::Array(paths)) = root.get_mut("relationshipPaths") {
                for path in paths.iter_mut().filter_map(Value::as_object_mut) {
                    if path.get("toEntityType").and_then(Value::as_str) != Some(entity.as_str()) {
                        continue;
                    }
                    let slot = path
                        .entry("conditions")
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(conditions) = slot {
                        conditions.extend(filters.iter().cloned());
                        applied = true;
                    }
                }
            }
            if !applied {
                leftovers.push((entity, filters));
            }
        }
        leftovers
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    fn normalize_filters(&self, raw: &Value, entity: Option<&str>, alias: Option<&str>) -> Vec<Value> {
        let mut out = Vec::new();
        match raw {
            Value::Array(items) => {
                for item in items {
                    out.extend(self.normalize_filters(item, entity, alias));
                }
            }
            Value::Object(map) if map.contains_key("field") => {
                out.extend(self.fix_condition(map.clone(), entity, alias));
            }
            Value::Object(map) => {
                for (field, value) in map {
                    out.extend(self.from_key_value(field, value, entity, alias));
                }
            }
            Value::String(expression) => {
                out.extend(self.parse_expression(expression, None, entity, alias));
            }
            _ => {}
        }
        out
    }

    fn fix_condition(&self, mut map: Map<String, Value>, entity: Option<&str>, alias: Option<&str>) -> Option<Value> {
        let field = map.get("field")?.as_str()?.trim().to_string();
        if field.is_empty() {
            return None;
        }
        map.insert("field".into(), Value::String(strip_prefix(&field, entity, alias)));
        map.remove("entityType");
        if let Some(op) = map.get("operator").and_then(Value::as_str).map(canonical_operator) {
            map.insert("operator".into(), Value::String(op));
        }
        let is_between = map.get("operator").and_then(Value::as_str) == Some("BETWEEN");
        if is_between && !map.contains_key("secondaryValue") {
            if let Some(Value::Array(bounds)) = map.get("value").cloned() {
                if bounds.len() >= 2 {
                    map.insert("value".into(), bounds[0].clone());
                    map.insert("secondaryValue".into(), bounds[1].clone());
                }
            }
        }
        Some(Value::Object(map))
    }

    fn from_key_value(&self, field: &str, value: &Value, entity: Option<&str>, alias: Option<&str>) -> Option<Value> {
        match value {
            Value::Null => None,
            Value::String(text) => {
                let text = text.trim();
                if starts_with_operator(text) {
                    self.parse_expression(text, Some(field), entity, alias)
                } else {
                    Some(self.condition(field, FilterOperator::Equals, literal(text), None, entity, alias))
                }
            }
            Value::Array(items) => {
                let values: Vec<Value> = items.iter().filter(|v| !v.is_null()).cloned().collect();
                Some(self.condition(field, FilterOperator::In, Value::Array(values), None, entity, alias))
            }
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("field".into(), Value::String(field.to_string()));
                self.fix_condition(map, entity, alias)
            }
            scalar => Some(self.condition(field, FilterOperator::Equals, scalar.clone(), None, entity, alias)),
        }
    }

    fn parse_expression(
        &self,
        expression: &str,
        explicit_field: Option<&str>,
        entity: Option<&str>,
        alias: Option<&str>,
    ) -> Option<Value> {
        let text = expression.trim();
        if text.is_empty() {
            return None;
        }
        let build = |field: &str, op, value, secondary| Some(self.condition(field, op, value, secondary, entity, alias));

        if let Some(caps) = BETWEEN_RE.captures(text) {
            let field = explicit_field.unwrap_or(&caps[1]);
            return build(field, FilterOperator::Between, literal(&caps[2]), Some(literal(&caps[3])));
        }
        if let Some(field) = explicit_field {
            if let Some(caps) = BETWEEN_NO_FIELD_RE.captures(text) {
                return build(field, FilterOperator::Between, literal(&caps[1]), Some(literal(&caps[2])));
            }
        }
        if let Some(caps) = IN_RE.captures(text) {
            let field = explicit_field.unwrap_or(&caps[1]);
            return build(field, FilterOperator::In, csv_values(&caps[2]), None);
        }
        if let Some(field) = explicit_field {
            if let Some(caps) = IN_NO_FIELD_RE.captures(text) {
                return build(field, FilterOperator::In, csv_values(&caps[1]), None);
            }
        }
        if let Some(caps) = BINARY_RE.captures(text) {
            let field = explicit_field.unwrap_or(&caps[1]);
            let op = FilterOperator::from_symbol(&caps[2]).unwrap_or(FilterOperator::Equals);
            return build(field, op, literal(&caps[3]), None);
        }
        if let Some(field) = explicit_field {
            if let Some(caps) = BINARY_NO_FIELD_RE.captures(text) {
                let op = FilterOperator::from_symbol(&caps[1]).unwrap_or(FilterOperator::Equals);
                return build(field, op, literal(&caps[2]), None);
            }
            return build(field, FilterOperator::Equals, literal(text), None);
        }
        None
    }

    fn condition(
        &self,
        field: &str,
        operator: FilterOperator,
        value: Value,
        secondary: Option<Value>,
        entity: Option<&str>,
        alias: Option<&str>,
    ) -> Value {
        let mut map = Map::new();
        map.insert("field".into(), Value::String(strip_prefix(field.trim(), entity, alias)));
        map.insert("operator".into(), Value::String(operator.as_str().to_string()));
        map.insert("value".into(), value);
        if let Some(secondary) = secondary {
            map.insert("secondaryValue".into(), secondary);
        }
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn condense(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn upper_enum(map: &mut Map<String, Value>, key: &str) {
    let canonical = map
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_uppercase().replace([' ', '-'], "_"));
    if let Some(canonical) = canonical {
        map.insert(key.to_string(), Value::String(canonical));
    }
}

/// Operator name from a symbol or a loosely spelled name (`"<="`, `"not in"`).
fn canonical_operator(raw: &str) -> String {
    if let Some(op) = FilterOperator::from_symbol(raw) {
        return op.as_str().to_string();
    }
    let upper = raw.trim().to_uppercase().replace([' ', '-'], "_");
    match upper.as_str() {
        "EQ" | "EQUAL" | "IS" => "EQUALS".into(),
        "NE" | "NEQ" | "NOT_EQUAL" => "NOT_EQUALS".into(),
        "GT" => "GREATER_THAN".into(),
        "GTE" | "GE" => "GREATER_THAN_OR_EQUAL".into(),
        "LT" => "LESS_THAN".into(),
        "LTE" | "LE" => "LESS_THAN_OR_EQUAL".into(),
        "CONTAINS" => "ILIKE".into(),
        _ => upper,
    }
}

fn starts_with_operator(text: &str) -> bool {
    let upper = text.trim_start().to_uppercase();
    upper.starts_with('>')
        || upper.starts_with('<')
        || upper.starts_with("!=")
        || upper.starts_with('=')
        || upper.starts_with("BETWEEN ")
        || upper.starts_with("IN ")
        || upper.starts_with("IN(")
}

/// Drop a leading `entity.` or `relationship.` qualifier.
fn strip_prefix(field: &str, entity: Option<&str>, alias: Option<&str>) -> String {
    let Some((prefix, rest)) = field.split_once('.') else {
        return field.to_string();
    };
    let prefix_key = condense(prefix);
    let matches_entity = entity.is_some_and(|e| {
        let key = condense(e);
        prefix_key == key || prefix_key.strip_suffix('s') == Some(key.as_str())
    });
    let matches_alias = alias.is_some_and(|a| condense(a) == prefix_key);
    if (matches_entity || matches_alias) && !rest.is_empty() {
        rest.to_string()
    } else {
        field.to_string()
    }
}

fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    let quoted = trimmed.len() >= 2
        && ((trimmed.starts_with('"') && trimmed.ends_with('"'))
            || (trimmed.starts_with('\'') && trimmed.ends_with('\'')));
    if quoted {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

/// Typed JSON value for a literal written inside an expression.
fn literal(raw: &str) -> Value {
    let text = strip_quotes(raw);
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
        return Value::Bool(text.eq_ignore_ascii_case("true"));
    }
    if text.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if INTEGER_RE.is_match(text) {
        if let Ok(i) = text.parse::<i64>() {
            return json!(i);
        }
    }
    if FLOAT_RE.is_match(text) {
        if let Ok(f) = text.parse::<f64>() {
            return json!(f);
        }
    }
    Value::String(text.to_string())
}

fn csv_values(csv: &str) -> Value {
    Value::Array(
        csv.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(literal)
            .filter(|v| !v.is_null())
            .collect(),
    )
}

fn append_filters(target: &mut Map<String, Value>, entity: &str, filters: Vec<Value>) {
    if filters.is_empty() || entity.is_empty() {
        return;
    }
    let slot = target
        .entry(entity.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::Array(existing) = slot {
        existing.extend(filters);
    }
}

/// `Qn YYYY` in the query adds an inclusive range on `field`, unless the
/// plan already filters that field.
fn apply_quarter_range(direct: &mut Map<String, Value>, entity: &str, field: &str, query: &str) {
    let Some(caps) = QUARTER_RE.captures(query) else {
        return;
    };
    let (Ok(quarter), Ok(year)) = (caps[1].parse::<u32>(), caps[2].parse::<u32>()) else {
        return;
    };
    let already = direct
        .get(entity)
        .and_then(Value::as_array)
        .is_some_and(|filters| filters.iter().any(|f| f.get("field").and_then(Value::as_str) == Some(field)));
    if already {
        return;
    }
    let start_month = (quarter - 1) * 3 + 1;
    let end_month = start_month + 2;
    let end_day = match end_month {
        3 | 12 => 31,
        _ => 30,
    };
    let range = json!({
        "field": field,
        "operator": "BETWEEN",
        "value": format!("{year}-{start_month:02}-01T00:00:00"),
        "secondaryValue": format!("{year}-{end_month:02}-{end_day:02}T23:59:59"),
    });
    append_filters(direct, entity, vec![range]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationMode;
    use crate::models::FilterValue;
    use crate::query::guards::DEFAULT_RESULT_LIMIT;
    use crate::query::validator::QueryValidator;
    use crate::testing::seeded_registry;

    fn parse(raw: &str) -> RelQueryResult<RelationshipQueryPlan> {
        parse_plan(raw, "the query", None, DEFAULT_RESULT_LIMIT, &seeded_registry(), &PlannerConfig::default())
    }

    #[test]
    fn extracts_object_from_prose() {
        assert_eq!(extract_json_object("Sure! {\"a\": {\"b\": 1}} done"), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }

    #[test]
    fn missing_or_broken_json_is_a_planning_error() {
        for raw in ["I cannot help with that", "{\"primaryEntityType\": }", "{\"candidateEntityTypes\": []}"] {
            match parse(raw).unwrap_err() {
                RelQueryError::QueryPlanning(ctx) => assert_eq!(ctx.stage, PLANNING_STAGE),
                other => panic!("unexpected {other}"),
            }
        }
    }

    #[test]
    fn canonicalizes_slugs_and_adds_primary_to_candidates() {
        let plan = parse(r#"{"primaryEntityType": "Documents", "candidateEntityTypes": ["users"]}"#).unwrap();
        assert_eq!(plan.primary_entity_type, "document");
        assert!(plan.candidate_entity_types.contains("document"));
        assert!(plan.candidate_entity_types.contains("user"));
        assert_eq!(plan.original_query, "the query");
        assert_eq!(plan.limit, DEFAULT_RESULT_LIMIT);
    }

    #[test]
    fn expands_shorthand_filters() {
        let plan = parse(
            r#"{
                "primaryEntityType": "product",
                "directFilters": {
                    "product": {
                        "price": "<= 100",
                        "color": "blue",
                        "size": [9, 10],
                        "rating": "BETWEEN 3 AND 5"
                    },
                    "products": ["product.stock > 0", "sku IN ('a1', 'b2')"]
                },
                "limit": 9000,
                "confidence": 1.7
            }"#,
        )
        .unwrap();
        let filters = &plan.direct_filters["product"];
        assert_eq!(filters.len(), 6);
        let by_field = |name: &str| filters.iter().find(|f| f.field == name).unwrap();
        assert_eq!(by_field("price").operator, FilterOperator::LessThanOrEqual);
        assert_eq!(by_field("price").value, FilterValue::Integer(100));
        assert_eq!(by_field("color").operator, FilterOperator::Equals);
        assert_eq!(by_field("size").operator, FilterOperator::In);
        assert_eq!(by_field("rating").secondary_value, Some(FilterValue::Integer(5)));
        assert_eq!(by_field("stock").operator, FilterOperator::GreaterThan);
        assert_eq!(
            by_field("sku").value,
            FilterValue::List(vec![FilterValue::Text("a1".into()), FilterValue::Text("b2".into())])
        );
        assert_eq!(plan.limit, MAX_RESULT_LIMIT);
        assert_eq!(plan.confidence, Some(1.0));
    }

    #[test]
    fn fills_relationship_type_and_strips_prefixes() {
        let plan = parse(
            r#"{
                "primaryEntityType": "document",
                "relationshipPaths": [{
                    "fromEntityType": "document",
                    "toEntityType": "users",
                    "direction": "forward",
                    "conditions": [
                        {"field": "user.fullName", "operator": "ilike", "value": "%John%"},
                        {"field": "document.status", "operator": "=", "value": "ACTIVE"},
                        "author.email = 'j@example.com'"
                    ]
                }]
            }"#,
        )
        .unwrap();
        let path = &plan.relationship_paths[0];
        assert_eq!(path.relationship_type.as_deref(), Some("author"));
        assert_eq!(path.to_entity_type, "user");
        assert_eq!(path.direction, RelationshipDirection::Forward);
        let fields: Vec<&str> = path.conditions.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["fullName", "email"]);
        assert_eq!(path.conditions[0].operator, FilterOperator::Ilike);
        let moved = &plan.direct_filters["document"];
        assert_eq!(moved[0].field, "status");
        assert_eq!(moved[0].operator, FilterOperator::Equals);
    }

    #[test]
    fn unnamed_hop_without_direct_edge_is_bridged_through_schema() {
        let plan = parse(
            r#"{
                "primaryEntityType": "document",
                "relationshipPaths": [
                    {"fromEntityType": "documents", "toEntityType": "team", "conditions": {"name": "Legal"}}
                ]
            }"#,
        )
        .unwrap();
        let hops: Vec<(&str, &str, Option<&str>)> = plan
            .relationship_paths
            .iter()
            .map(|p| (p.from_entity_type.as_str(), p.to_entity_type.as_str(), p.relationship_name()))
            .collect();
        assert_eq!(
            hops,
            vec![("document", "user", Some("author")), ("user", "team", Some("team"))]
        );
        assert!(plan.relationship_paths[0].conditions.is_empty());
        assert_eq!(plan.relationship_paths[1].conditions[0].field, "name");
        QueryValidator::new(seeded_registry(), 3)
            .validate(&plan, ValidationMode::Strict)
            .unwrap();
    }

    #[test]
    fn relationship_filters_become_direct_filters() {
        let plan = parse(
            r#"{"primaryEntityType": "product",
                "relationshipFilters": {"brands": [{"field": "name", "operator": "ILIKE", "value": "%Nike%"}]}}"#,
        )
        .unwrap();
        assert_eq!(plan.direct_filters["brand"][0].field, "name");
    }

    #[test]
    fn relationship_filters_attach_to_matching_hops() {
        let plan = parse(
            r#"{"primaryEntityType": "product",
                "relationshipPaths": [{"fromEntityType": "product", "relationshipType": "brand", "toEntityType": "brand"}],
                "relationshipFilters": {"brand": {"name": "Nike"}}}"#,
        )
        .unwrap();
        assert!(plan.direct_filters.is_empty());
        let condition = &plan.relationship_paths[0].conditions[0];
        assert_eq!(condition.field, "name");
        assert_eq!(condition.value, FilterValue::Text("Nike".into()));
    }

    #[test]
    fn between_array_value_is_split() {
        let plan = parse(
            r#"{"primaryEntityType": "product",
                "directFilters": {"product": [{"field": "price", "operator": "BETWEEN", "value": [10, 20]}]}}"#,
        )
        .unwrap();
        let filter = &plan.direct_filters["product"][0];
        assert_eq!(filter.value, FilterValue::Integer(10));
        assert_eq!(filter.secondary_value, Some(FilterValue::Integer(20)));
    }

    #[test]
    fn quarter_heuristic_adds_inclusive_range_when_configured() {
        let config = PlannerConfig {
            quarter_date_field: Some("createdAt".into()),
            ..PlannerConfig::default()
        };
        let plan = parse_plan(
            r#"{"primaryEntityType": "document"}"#,
            "contracts in q4 2023",
            None,
            DEFAULT_RESULT_LIMIT,
            &seeded_registry(),
            &config,
        )
        .unwrap();
        let range = &plan.direct_filters["document"][0];
        assert_eq!(range.operator, FilterOperator::Between);
        assert_eq!(range.value, FilterValue::Text("2023-10-01T00:00:00".into()));
        assert_eq!(range.secondary_value, Some(FilterValue::Text("2023-12-31T23:59:59".into())));
    }

    #[test]
    fn normalization_can_be_disabled() {
        let config = PlannerConfig {
            normalization_enabled: false,
            ..PlannerConfig::default()
        };
        let plan = parse_plan(
            r#"{"primaryEntityType": "Documents"}"#,
            "q",
            None,
            DEFAULT_RESULT_LIMIT,
            &seeded_registry(),
            &config,
        )
        .unwrap();
        assert_eq!(plan.primary_entity_type, "Documents");
    }

    #[test]
    fn default_primary_fills_a_missing_one() {
        let plan = parse_plan("{}", "q", Some("product"), 7, &seeded_registry(), &PlannerConfig::default()).unwrap();
        assert_eq!(plan.primary_entity_type, "product");
        assert!(plan.candidate_entity_types.contains("product"));
        assert_eq!(plan.limit, 7);
    }
}
