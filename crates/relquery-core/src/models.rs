//! Shared typed models used across the registry, planner, executors and store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Hash helpers
// ---------------------------------------------------------------------------

/// SHA-256 hex digest of `value`, or `"empty"` for blank input.
pub fn content_hash(value: &str) -> String {
    if value.trim().is_empty() {
        return "empty".to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lower-case, trim and collapse internal whitespace so that incidental
/// formatting never changes a cache key.
pub fn normalize_query_text(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical form of an entity type name (trimmed, lower-case).
pub fn normalize_entity_type(entity_type: &str) -> String {
    entity_type.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// 1. Schema mappings
// ---------------------------------------------------------------------------

/// Direction in which a declared relationship may be traversed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipDirection {
    #[default]
    Forward,
    Reverse,
    Bidirectional,
}

impl RelationshipDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationshipDirection::Forward => "FORWARD",
            RelationshipDirection::Reverse => "REVERSE",
            RelationshipDirection::Bidirectional => "BIDIRECTIONAL",
        }
    }
}

/// Logical entity type bound to the concrete type that stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMapping {
    pub entity_type: String,
    pub concrete_type_name: String,
}

/// A directed relationship field from one entity type to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipMapping {
    pub from_entity_type: String,
    pub to_entity_type: String,
    pub field_name: String,
    #[serde(default)]
    pub direction: RelationshipDirection,
    #[serde(default)]
    pub optional: bool,
}

// ---------------------------------------------------------------------------
// 2. Filters
// ---------------------------------------------------------------------------

/// Comparison applied by a [`FilterCondition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOperator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    Ilike,
    In,
    NotIn,
    Between,
    Exists,
    NotExists,
}

impl FilterOperator {
    /// Map a comparison symbol (`>=`, `!=`, ...) to an operator.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "=" | "==" => Some(FilterOperator::Equals),
            "!=" | "<>" => Some(FilterOperator::NotEquals),
            ">" => Some(FilterOperator::GreaterThan),
            ">=" => Some(FilterOperator::GreaterThanOrEqual),
            "<" => Some(FilterOperator::LessThan),
            "<=" => Some(FilterOperator::LessThanOrEqual),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Equals => "EQUALS",
            FilterOperator::NotEquals => "NOT_EQUALS",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Like => "LIKE",
            FilterOperator::Ilike => "ILIKE",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
            FilterOperator::Between => "BETWEEN",
            FilterOperator::Exists => "EXISTS",
            FilterOperator::NotExists => "NOT_EXISTS",
        }
    }
}

/// Scalar (or list of scalars for IN/NOT_IN) compared by a filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<FilterValue>),
}

impl FilterValue {
    /// Numeric view used by in-memory comparisons.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FilterValue::Integer(v) => Some(*v as f64),
            FilterValue::Float(v) => Some(*v),
            FilterValue::Text(s) => s.trim().parse::<f64>().ok(),
            FilterValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Trimmed textual view with ASCII-only case folding, the same folding
    /// SQLite's `LOWER()` applies; `None` for null.
    pub fn normalized_text(&self) -> Option<String> {
        match self {
            FilterValue::Null => None,
            other => Some(other.to_string().trim().to_ascii_lowercase()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FilterValue::Null)
    }

    /// Convert a JSON value into a filter value. Objects are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(FilterValue::Null),
            serde_json::Value::Bool(b) => Some(FilterValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(FilterValue::Integer(i)),
                None => n.as_f64().map(FilterValue::Float),
            },
            serde_json::Value::String(s) => Some(FilterValue::Text(s.clone())),
            serde_json::Value::Array(items) => Some(FilterValue::List(
                items.iter().filter_map(FilterValue::from_json).collect(),
            )),
            serde_json::Value::Object(_) => None,
        }
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Null => write!(f, "null"),
            FilterValue::Bool(b) => write!(f, "{b}"),
            FilterValue::Integer(i) => write!(f, "{i}"),
            FilterValue::Float(v) => write!(f, "{v}"),
            FilterValue::Text(s) => write!(f, "{s}"),
            FilterValue::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

/// A single `field <operator> value` predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    pub field: String,
    #[serde(default)]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: FilterValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_value: Option<FilterValue>,
}

impl FilterCondition {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            secondary_value: None,
        }
    }

    pub fn between(field: impl Into<String>, lower: FilterValue, upper: FilterValue) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Between,
            value: lower,
            secondary_value: Some(upper),
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Plan
// ---------------------------------------------------------------------------

/// One traversal hop with hop-local filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipPath {
    pub from_entity_type: String,
    #[serde(default)]
    pub relationship_type: Option<String>,
    pub to_entity_type: String,
    #[serde(default)]
    pub direction: RelationshipDirection,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
}

impl RelationshipPath {
    /// The declared relationship name, if present and non-blank.
    pub fn relationship_name(&self) -> Option<&str> {
        self.relationship_type
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStrategy {
    #[default]
    Relationship,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnMode {
    #[default]
    Ids,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryMode {
    #[default]
    Standalone,
    Enhanced,
}

/// Structured, validated representation of a free-text question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipQueryPlan {
    pub original_query: String,
    pub primary_entity_type: String,
    #[serde(default)]
    pub candidate_entity_types: BTreeSet<String>,
    #[serde(default)]
    pub relationship_paths: Vec<RelationshipPath>,
    #[serde(default)]
    pub direct_filters: BTreeMap<String, Vec<FilterCondition>>,
    #[serde(default)]
    pub query_strategy: QueryStrategy,
    #[serde(default)]
    pub return_mode: ReturnMode,
    #[serde(default)]
    pub needs_semantic_search: bool,
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl RelationshipQueryPlan {
    /// Minimal plan over a single entity type.
    pub fn new(original_query: impl Into<String>, primary_entity_type: impl Into<String>) -> Self {
        let primary = primary_entity_type.into();
        Self {
            original_query: original_query.into(),
            candidate_entity_types: BTreeSet::from([primary.clone()]),
            primary_entity_type: primary,
            relationship_paths: Vec::new(),
            direct_filters: BTreeMap::new(),
            query_strategy: QueryStrategy::Relationship,
            return_mode: ReturnMode::Ids,
            needs_semantic_search: false,
            limit: crate::query::guards::DEFAULT_RESULT_LIMIT,
            semantic_query: None,
            confidence: None,
        }
    }

    /// Text used for embeddings: the semantic rewrite when present.
    pub fn semantic_text(&self) -> &str {
        self.semantic_query
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.original_query)
    }

    /// Direct filters followed by every hop's conditions, in plan order.
    pub fn all_conditions(&self) -> Vec<(&str, &FilterCondition)> {
        let mut merged = Vec::new();
        for (entity, filters) in &self.direct_filters {
            for condition in filters {
                merged.push((entity.as_str(), condition));
            }
        }
        for path in &self.relationship_paths {
            for condition in &path.conditions {
                merged.push((path.to_entity_type.as_str(), condition));
            }
        }
        merged
    }

    pub fn has_filters(&self) -> bool {
        self.direct_filters.values().any(|f| !f.is_empty())
            || self.relationship_paths.iter().any(|p| !p.conditions.is_empty())
    }
}

// ---------------------------------------------------------------------------
// 4. Caller options and stored rows
// ---------------------------------------------------------------------------

/// Caller-facing options. Every field is optional and falls back to config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub force_mode: Option<QueryMode>,
    pub return_mode: Option<ReturnMode>,
    pub similarity_threshold: Option<f64>,
    pub limit: Option<usize>,
    pub include_vector_scores: bool,
    /// Restricts the schema context handed to the planning oracle.
    pub entity_types: Vec<String>,
    /// Overrides whether the vector tier may run for this request.
    pub semantic_fallback: Option<bool>,
    /// Applies to the oracle and vector-search calls only.
    #[serde(skip)]
    pub deadline: Option<Instant>,
}

impl QueryOptions {
    pub fn deadline_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// A row of the generic entity table as read by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoredEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub attributes: Option<String>,
    pub metadata: Option<String>,
    pub searchable_content: Option<String>,
}

/// One result item returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultDocument {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub source: String,
}

// ---------------------------------------------------------------------------
// 5. Execution stages
// ---------------------------------------------------------------------------

/// One tier of the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStage {
    Primary,
    FallbackMetadata,
    FallbackVector,
    FallbackSimple,
}

impl ExecutionStage {
    pub const ALL: [ExecutionStage; 4] = [
        ExecutionStage::Primary,
        ExecutionStage::FallbackMetadata,
        ExecutionStage::FallbackVector,
        ExecutionStage::FallbackSimple,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStage::Primary => "PRIMARY",
            ExecutionStage::FallbackMetadata => "FALLBACK_METADATA",
            ExecutionStage::FallbackVector => "FALLBACK_VECTOR",
            ExecutionStage::FallbackSimple => "FALLBACK_SIMPLE",
        }
    }

    pub fn index(self) -> usize {
        match self {
            ExecutionStage::Primary => 0,
            ExecutionStage::FallbackMetadata => 1,
            ExecutionStage::FallbackVector => 2,
            ExecutionStage::FallbackSimple => 3,
        }
    }

    pub fn is_fallback(self) -> bool {
        self != ExecutionStage::Primary
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged result of running one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The tier produced this many results.
    Succeeded(usize),
    /// The tier ran cleanly but found nothing.
    Empty,
    Failed(String),
    /// The tier was not attempted (disabled or missing collaborators).
    Skipped(String),
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Succeeded(_) => "succeeded",
            StageOutcome::Empty => "empty",
            StageOutcome::Failed(_) => "failed",
            StageOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            StageOutcome::Succeeded(n) => format!("{n} results"),
            StageOutcome::Empty => "no results".to_string(),
            StageOutcome::Failed(reason) | StageOutcome::Skipped(reason) => reason.clone(),
        }
    }
}
