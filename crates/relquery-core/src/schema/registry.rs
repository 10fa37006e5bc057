//! Registry of entity types and the directed relationships between them.
//!
//! The registry is the single owner of schema knowledge. It is append-only:
//! registrations are idempotent per key and nothing is ever removed. Every
//! lookup normalizes entity type names (trimmed, lower-case); relationship
//! field names keep their declared spelling but match case-insensitively.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::{normalize_entity_type, EntityMapping, RelationshipDirection, RelationshipMapping};
use crate::query::guards::clamp_depth;

type EdgeKey = (String, String, String);

fn edge_key(from: &str, to: &str, field: &str) -> EdgeKey {
    (
        normalize_entity_type(from),
        normalize_entity_type(to),
        field.trim().to_lowercase(),
    )
}

/// Bootstrap payload for [`SchemaRegistry::from_definition`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDefinition {
    #[serde(default)]
    pub entities: Vec<EntityMapping>,
    #[serde(default)]
    pub relationships: Vec<RelationshipMapping>,
}

/// Serializable slice of the schema handed to the planning oracle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaContext {
    pub entity_types: Vec<EntityMapping>,
    pub relationships: Vec<RelationshipMapping>,
    pub max_traversal_depth: usize,
}

/// A plan hop matched against a registered relationship.
///
/// `stored_forward` is true when links are stored from the hop's source type
/// to its target type, false when the hop walks a declared edge backwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHop {
    pub mapping: RelationshipMapping,
    pub stored_forward: bool,
}

#[derive(Default)]
pub struct SchemaRegistry {
    entities: RwLock<IndexMap<String, EntityMapping>>,
    relationships: RwLock<IndexMap<EdgeKey, RelationshipMapping>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definition(definition: SchemaDefinition) -> RelQueryResult<Self> {
        let registry = Self::new();
        for entity in &definition.entities {
            registry.register_entity_type(&entity.entity_type, &entity.concrete_type_name)?;
        }
        for rel in &definition.relationships {
            registry.register_relationship(
                &rel.from_entity_type,
                &rel.to_entity_type,
                &rel.field_name,
                rel.direction,
                rel.optional,
            )?;
        }
        debug!(
            entities = definition.entities.len(),
            relationships = definition.relationships.len(),
            "schema registry bootstrapped"
        );
        Ok(registry)
    }

    pub fn from_json_str(raw: &str) -> RelQueryResult<Self> {
        let definition: SchemaDefinition = serde_json::from_str(raw)
            .map_err(|e| RelQueryError::Schema(format!("invalid schema definition: {e}")))?;
        Self::from_definition(definition)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_entity_type(&self, entity_type: &str, concrete_type_name: &str) -> RelQueryResult<()> {
        let key = normalize_entity_type(entity_type);
        if key.is_empty() {
            return Err(RelQueryError::Schema("entity type must not be blank".into()));
        }
        let concrete = concrete_type_name.trim();
        if concrete.is_empty() {
            return Err(RelQueryError::Schema(format!(
                "concrete type for '{key}' must not be blank"
            )));
        }

        let mut entities = self.entities.write();
        if let Some(existing) = entities.get(&key) {
            if existing.concrete_type_name == concrete {
                return Ok(());
            }
            return Err(RelQueryError::Schema(format!(
                "entity type '{key}' already registered as '{}', refusing '{concrete}'",
                existing.concrete_type_name
            )));
        }
        entities.insert(
            key.clone(),
            EntityMapping {
                entity_type: key,
                concrete_type_name: concrete.to_string(),
            },
        );
        Ok(())
    }

    pub fn register_relationship(
        &self,
        from_entity_type: &str,
        to_entity_type: &str,
        field_name: &str,
        direction: RelationshipDirection,
        optional: bool,
    ) -> RelQueryResult<()> {
        let field = field_name.trim();
        if from_entity_type.trim().is_empty() || to_entity_type.trim().is_empty() || field.is_empty() {
            return Err(RelQueryError::Schema(
                "relationship from/to types and field name must not be blank".into(),
            ));
        }
        let from = self.require_entity_type(from_entity_type)?.entity_type;
        let to = self.require_entity_type(to_entity_type)?.entity_type;

        let mapping = RelationshipMapping {
            from_entity_type: from.clone(),
            to_entity_type: to.clone(),
            field_name: field.to_string(),
            direction,
            optional,
        };
        let key = edge_key(&from, &to, field);
        let mut relationships = self.relationships.write();
        if let Some(existing) = relationships.get(&key) {
            if *existing == mapping {
                return Ok(());
            }
            return Err(RelQueryError::Schema(format!(
                "relationship {from}.{field} -> {to} already registered with different attributes"
            )));
        }
        relationships.insert(key, mapping);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn has_entity_type(&self, entity_type: &str) -> bool {
        self.entities
            .read()
            .contains_key(&normalize_entity_type(entity_type))
    }

    pub fn entity_mapping(&self, entity_type: &str) -> Option<EntityMapping> {
        self.entities
            .read()
            .get(&normalize_entity_type(entity_type))
            .cloned()
    }

    /// Like [`entity_mapping`](Self::entity_mapping) but unknown types are an error.
    pub fn require_entity_type(&self, entity_type: &str) -> RelQueryResult<EntityMapping> {
        self.entity_mapping(entity_type).ok_or_else(|| {
            RelQueryError::Schema(format!("unknown entity type '{}'", entity_type.trim()))
        })
    }

    /// All entity mappings in registration order.
    pub fn all_entity_mappings(&self) -> Vec<EntityMapping> {
        self.entities.read().values().cloned().collect()
    }

    /// All relationship mappings in registration order.
    pub fn all_relationship_mappings(&self) -> Vec<RelationshipMapping> {
        self.relationships.read().values().cloned().collect()
    }

    pub fn relationship(&self, from: &str, to: &str, field_name: &str) -> Option<RelationshipMapping> {
        self.relationships
            .read()
            .get(&edge_key(from, to, field_name))
            .cloned()
    }

    pub fn relationships_from(&self, entity_type: &str) -> Vec<RelationshipMapping> {
        let key = normalize_entity_type(entity_type);
        self.relationships
            .read()
            .values()
            .filter(|m| m.from_entity_type == key)
            .cloned()
            .collect()
    }

    /// Match a plan hop `from --name--> to` against the registry.
    ///
    /// A declared edge is always walkable in its declared orientation. It is
    /// walkable backwards when it was declared REVERSE or BIDIRECTIONAL, or
    /// when the hop itself asks for a non-forward walk.
    pub fn resolve_hop(
        &self,
        from: &str,
        to: &str,
        name: &str,
        requested: RelationshipDirection,
    ) -> Option<ResolvedHop> {
        if let Some(mapping) = self.relationship(from, to, name) {
            return Some(ResolvedHop {
                mapping,
                stored_forward: true,
            });
        }
        self.relationship(to, from, name)
            .filter(|m| {
                m.direction != RelationshipDirection::Forward
                    || requested != RelationshipDirection::Forward
            })
            .map(|mapping| ResolvedHop {
                mapping,
                stored_forward: false,
            })
    }

    /// Unique edge between two types, used to fill a hop with no relationship name.
    pub fn unique_edge_between(&self, from: &str, to: &str) -> Option<RelationshipMapping> {
        let from = normalize_entity_type(from);
        let to = normalize_entity_type(to);
        let relationships = self.relationships.read();
        let mut matches = relationships
            .values()
            .filter(|m| m.from_entity_type == from && m.to_entity_type == to);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.clone())
    }

    /// Shortest chain of relationships from `from` to `to`, at most `max_depth` hops.
    ///
    /// Breadth-first over the directed edge list; cycles are cut by the visited
    /// set and by the depth bound.
    pub fn find_path(&self, from: &str, to: &str, max_depth: usize) -> Option<Vec<ResolvedHop>> {
        let start = normalize_entity_type(from);
        let goal = normalize_entity_type(to);
        if !self.has_entity_type(&start) || !self.has_entity_type(&goal) {
            return None;
        }
        if start == goal {
            return Some(Vec::new());
        }
        let max_depth = clamp_depth(max_depth);
        let edges = self.all_relationship_mappings();

        let mut visited: HashSet<String> = HashSet::from([start.clone()]);
        let mut queue: VecDeque<(String, Vec<ResolvedHop>)> = VecDeque::from([(start, Vec::new())]);
        while let Some((current, trail)) = queue.pop_front() {
            if trail.len() >= max_depth {
                continue;
            }
            for edge in &edges {
                let step = if edge.from_entity_type == current {
                    Some((edge.to_entity_type.clone(), true))
                } else if edge.to_entity_type == current
                    && edge.direction != RelationshipDirection::Forward
                {
                    Some((edge.from_entity_type.clone(), false))
                } else {
                    None
                };
                let Some((next, stored_forward)) = step else {
                    continue;
                };
                if !visited.insert(next.clone()) {
                    continue;
                }
                let mut next_trail = trail.clone();
                next_trail.push(ResolvedHop {
                    mapping: edge.clone(),
                    stored_forward,
                });
                if next == goal {
                    return Some(next_trail);
                }
                queue.push_back((next, next_trail));
            }
        }
        None
    }

    /// Schema slice for the oracle: every type when `entity_types` is empty,
    /// otherwise the hinted types plus their direct neighbours.
    pub fn schema_context(&self, entity_types: &[String], max_traversal_depth: usize) -> RelQueryResult<SchemaContext> {
        let max_traversal_depth = clamp_depth(max_traversal_depth);
        if entity_types.is_empty() {
            return Ok(SchemaContext {
                entity_types: self.all_entity_mappings(),
                relationships: self.all_relationship_mappings(),
                max_traversal_depth,
            });
        }

        let mut focus: HashSet<String> = HashSet::new();
        for hint in entity_types {
            focus.insert(self.require_entity_type(hint)?.entity_type);
        }
        let relationships: Vec<RelationshipMapping> = self
            .all_relationship_mappings()
            .into_iter()
            .filter(|m| focus.contains(&m.from_entity_type) || focus.contains(&m.to_entity_type))
            .collect();
        let mut included = focus.clone();
        for rel in &relationships {
            included.insert(rel.from_entity_type.clone());
            included.insert(rel.to_entity_type.clone());
        }
        let entity_types = self
            .all_entity_mappings()
            .into_iter()
            .filter(|m| included.contains(&m.entity_type))
            .collect();
        Ok(SchemaContext {
            entity_types,
            relationships,
            max_traversal_depth,
        })
    }
}
