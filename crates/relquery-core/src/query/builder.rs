//! Compiles a validated plan into a parameterized SQL query over the generic
//! `entities` / `relationships` tables.
//!
//! Nothing taken from the plan is ever spliced into the SQL text: entity
//! types, relationship names, JSON paths and filter values are all bound as
//! named parameters. Table aliases are generated here.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::Serialize;
use tracing::warn;

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::{
    content_hash, normalize_entity_type, FilterCondition, FilterOperator, FilterValue,
    RelationshipDirection, RelationshipQueryPlan,
};
use crate::query::guards::{clamp_limit, MAX_RESULT_LIMIT};
use crate::schema::SchemaRegistry;

// ---------------------------------------------------------------------------
// Bound values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlParam {
    fn text(value: impl Into<String>) -> Self {
        SqlParam::Text(value.into())
    }

    /// Scalar filter value as stored; lists are rejected by the caller.
    fn from_filter(value: &FilterValue) -> Self {
        match value {
            FilterValue::Null | FilterValue::List(_) => SqlParam::Null,
            FilterValue::Bool(b) => SqlParam::Integer(i64::from(*b)),
            FilterValue::Integer(i) => SqlParam::Integer(*i),
            FilterValue::Float(f) => SqlParam::Real(*f),
            FilterValue::Text(s) => SqlParam::Text(s.clone()),
        }
    }

    /// Numeric-looking text becomes a number so ordering compares numerically.
    fn numeric_or_text(value: &FilterValue) -> Self {
        if let FilterValue::Text(s) = value {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return SqlParam::Integer(i);
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                if f.is_finite() {
                    return SqlParam::Real(f);
                }
            }
        }
        Self::from_filter(value)
    }
}

/// Type-tagged form used in cache keys; text is length-prefixed so no value
/// can forge a delimiter.
impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Null => write!(f, "n"),
            SqlParam::Integer(i) => write!(f, "i:{i}"),
            SqlParam::Real(v) => write!(f, "r:{v:?}"),
            SqlParam::Text(s) => write!(f, "t{}:{s}", s.len()),
        }
    }
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Null => ToSqlOutput::Owned(Value::Null),
            SqlParam::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlParam::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlParam::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

// ---------------------------------------------------------------------------
// Structured query
// ---------------------------------------------------------------------------

/// Parameterized query: SQL shape, named parameters (`:pN`) and a row limit
/// bound as `:limit` at execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredQuery {
    pub sql: String,
    pub parameters: BTreeMap<String, SqlParam>,
    pub limit: usize,
    pub root_entity_type: String,
    /// Direct filters that were dropped because their entity is never joined.
    pub dropped_filters: Vec<String>,
}

impl StructuredQuery {
    /// SHA-256 over the SQL, the type-tagged parameters in sorted order and
    /// the limit.
    pub fn cache_key(&self) -> String {
        let params: String = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{}:{k}={v};", k.len()))
            .collect();
        content_hash(&format!("{}::{}::{}", self.sql, params, self.limit))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Orientation {
    Forward,
    Reverse,
    Either,
}

struct Compiler {
    params: BTreeMap<String, SqlParam>,
    next_param: usize,
}

impl Compiler {
    fn bind(&mut self, value: SqlParam) -> String {
        self.next_param += 1;
        let name = format!(":p{}", self.next_param);
        self.params.insert(name.clone(), value);
        name
    }

    fn field_expr(&mut self, alias: &str, field: &str) -> String {
        match field {
            "id" | "entityId" | "entity_id" => format!("{alias}.entity_id"),
            "content" | "searchableContent" | "searchable_content" => {
                format!("{alias}.searchable_content")
            }
            _ => {
                let path = self.bind(SqlParam::text(format!("$.{field}")));
                format!("json_extract({alias}.attributes, {path})")
            }
        }
    }

    fn predicate(&mut self, alias: &str, condition: &FilterCondition) -> RelQueryResult<String> {
        let field = condition.field.trim();
        let expr = self.field_expr(alias, field);
        let op = condition.operator;
        let sql = match op {
            FilterOperator::Equals => {
                let p = self.bind(SqlParam::from_filter(&condition.value));
                format!("{expr} = {p}")
            }
            FilterOperator::NotEquals => {
                let p = self.bind(SqlParam::from_filter(&condition.value));
                format!("{expr} <> {p}")
            }
            FilterOperator::GreaterThan
            | FilterOperator::GreaterThanOrEqual
            | FilterOperator::LessThan
            | FilterOperator::LessThanOrEqual => {
                let symbol = match op {
                    FilterOperator::GreaterThan => ">",
                    FilterOperator::GreaterThanOrEqual => ">=",
                    FilterOperator::LessThan => "<",
                    _ => "<=",
                };
                let p = self.bind(SqlParam::numeric_or_text(&condition.value));
                format!("{expr} {symbol} {p}")
            }
            FilterOperator::Like => {
                let p = self.bind(SqlParam::text(condition.value.to_string()));
                format!("{expr} LIKE {p}")
            }
            FilterOperator::Ilike => {
                // LOWER() only folds ASCII, so the pattern must not fold more.
                let p = self.bind(SqlParam::text(condition.value.to_string().to_ascii_lowercase()));
                format!("LOWER({expr}) LIKE {p}")
            }
            FilterOperator::In | FilterOperator::NotIn => {
                let FilterValue::List(items) = &condition.value else {
                    return Err(RelQueryError::QueryBuild(format!(
                        "{} filter on '{field}' needs a list value",
                        op.as_str()
                    )));
                };
                if items.is_empty() {
                    return Err(RelQueryError::QueryBuild(format!(
                        "{} filter on '{field}' has an empty list",
                        op.as_str()
                    )));
                }
                let placeholders: Vec<String> = items
                    .iter()
                    .map(|item| self.bind(SqlParam::from_filter(item)))
                    .collect();
                let keyword = if op == FilterOperator::In { "IN" } else { "NOT IN" };
                format!("{expr} {keyword} ({})", placeholders.join(", "))
            }
            FilterOperator::Between => {
                let Some(upper) = &condition.secondary_value else {
                    return Err(RelQueryError::QueryBuild(format!(
                        "BETWEEN filter on '{field}' needs two bounds"
                    )));
                };
                let lo = self.bind(SqlParam::numeric_or_text(&condition.value));
                let hi = self.bind(SqlParam::numeric_or_text(upper));
                format!("{expr} BETWEEN {lo} AND {hi}")
            }
            FilterOperator::Exists => format!("{expr} IS NOT NULL"),
            FilterOperator::NotExists => format!("{expr} IS NULL"),
        };
        Ok(sql)
    }
}

pub struct QueryBuilder {
    registry: Arc<SchemaRegistry>,
}

impl QueryBuilder {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Compile with the plan's own limit.
    pub fn build(&self, plan: &RelationshipQueryPlan) -> RelQueryResult<StructuredQuery> {
        self.build_with_limit(plan, plan.limit)
    }

    pub fn build_with_limit(&self, plan: &RelationshipQueryPlan, limit: usize) -> RelQueryResult<StructuredQuery> {
        let root_type = normalize_entity_type(&plan.primary_entity_type);
        if root_type.is_empty() {
            return Err(RelQueryError::QueryBuild("primary entity type is blank".into()));
        }
        let mut compiler = Compiler {
            params: BTreeMap::new(),
            next_param: 0,
        };
        let mut joins: Vec<String> = Vec::new();
        let mut predicates: Vec<String> = Vec::new();
        let mut aliases: HashMap<String, String> = HashMap::from([(root_type.clone(), "t0".to_string())]);

        let root_param = compiler.bind(SqlParam::text(root_type.clone()));
        predicates.push(format!("t0.entity_type = {root_param}"));

        for (index, path) in plan.relationship_paths.iter().enumerate() {
            let hop = index + 1;
            let from = normalize_entity_type(&path.from_entity_type);
            let to = normalize_entity_type(&path.to_entity_type);
            let Some(cur) = aliases.get(&from).cloned() else {
                return Err(RelQueryError::QueryBuild(format!(
                    "relationship path #{index} starts at '{from}', which is not joined"
                )));
            };
            let link = format!("r{hop}");
            let next = format!("t{hop}");

            let resolved = path
                .relationship_name()
                .and_then(|name| self.registry.resolve_hop(&from, &to, name, path.direction));
            let orientation = match (&resolved, path.direction) {
                (_, RelationshipDirection::Bidirectional) => Orientation::Either,
                (Some(hop), _) if hop.stored_forward => Orientation::Forward,
                (Some(_), _) => Orientation::Reverse,
                (None, RelationshipDirection::Reverse) => Orientation::Reverse,
                (None, _) => Orientation::Forward,
            };
            let field_name = resolved
                .as_ref()
                .map(|hop| hop.mapping.field_name.clone())
                .or_else(|| path.relationship_name().map(str::to_string));

            let to_param = compiler.bind(SqlParam::text(to.clone()));
            let forward_link = format!(
                "({link}.from_type = {cur}.entity_type AND {link}.from_id = {cur}.entity_id AND {link}.to_type = {to_param})"
            );
            let reverse_link = format!(
                "({link}.to_type = {cur}.entity_type AND {link}.to_id = {cur}.entity_id AND {link}.from_type = {to_param})"
            );
            let mut link_on = match orientation {
                Orientation::Forward => forward_link,
                Orientation::Reverse => reverse_link,
                Orientation::Either => format!("({forward_link} OR {reverse_link})"),
            };
            if let Some(field_name) = field_name {
                let field_param = compiler.bind(SqlParam::text(field_name));
                link_on.push_str(&format!(" AND {link}.field_name = {field_param}"));
            }
            let target_on = match orientation {
                Orientation::Forward => format!("{next}.entity_type = {link}.to_type AND {next}.entity_id = {link}.to_id"),
                Orientation::Reverse => format!("{next}.entity_type = {link}.from_type AND {next}.entity_id = {link}.from_id"),
                Orientation::Either => format!(
                    "{next}.entity_type = {to_param} AND (({link}.from_id = {cur}.entity_id AND {link}.from_type = {cur}.entity_type AND {next}.entity_id = {link}.to_id) OR ({link}.to_id = {cur}.entity_id AND {link}.to_type = {cur}.entity_type AND {next}.entity_id = {link}.from_id))"
                ),
            };
            let optional = path.optional || resolved.as_ref().is_some_and(|hop| hop.mapping.optional);
            let join = if optional { "LEFT JOIN" } else { "JOIN" };
            joins.push(format!("{join} relationships {link} ON {link_on}"));
            joins.push(format!("{join} entities {next} ON {target_on}"));

            for condition in &path.conditions {
                predicates.push(compiler.predicate(&next, condition)?);
            }
            aliases.insert(to, next);
        }

        let mut dropped_filters = Vec::new();
        for (entity, filters) in &plan.direct_filters {
            let entity = normalize_entity_type(entity);
            let Some(alias) = aliases.get(&entity).cloned() else {
                if !filters.is_empty() {
                    warn!(entity = %entity, count = filters.len(), "dropping direct filters on unjoined entity");
                    dropped_filters.push(entity);
                }
                continue;
            };
            for condition in filters {
                predicates.push(compiler.predicate(&alias, condition)?);
            }
        }

        let mut sql = String::from("SELECT DISTINCT t0.entity_id, t0.rowid AS ord FROM entities t0");
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
        sql.push_str(" ORDER BY ord LIMIT :limit");

        Ok(StructuredQuery {
            sql,
            parameters: compiler.params,
            limit: clamp_limit(limit, MAX_RESULT_LIMIT),
            root_entity_type: root_type,
            dropped_filters,
        })
    }
}
