pub mod database;
pub mod schema;

use crate::errors::RelQueryResult;
use crate::models::StoredEntity;
use crate::query::builder::StructuredQuery;

pub use database::SqliteEntityStore;

/// Read-side capabilities the traversal tiers need from the entity store.
pub trait EntityStore: Send + Sync {
    /// Run a compiled query and return root entity ids in result order.
    fn execute_structured(&self, query: &StructuredQuery) -> RelQueryResult<Vec<String>>;

    /// Up to `cap` rows of one entity type, in insertion order.
    fn scan_entities(&self, entity_type: &str, cap: usize) -> RelQueryResult<Vec<StoredEntity>>;

    fn find_entity(&self, entity_type: &str, entity_id: &str) -> RelQueryResult<Option<StoredEntity>>;

    /// Rows whose searchable content contains any of `terms` (case-insensitive).
    /// With no terms, the first `cap` rows of the type.
    fn keyword_candidates(
        &self,
        entity_type: &str,
        terms: &[String],
        cap: usize,
    ) -> RelQueryResult<Vec<StoredEntity>>;
}
