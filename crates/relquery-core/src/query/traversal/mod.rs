//! Interchangeable traversal strategies behind one `execute` contract.

pub mod metadata;
pub mod relational;

use crate::errors::{ErrorContext, RelQueryResult};
use crate::models::{ExecutionStage, RelationshipQueryPlan};
use crate::query::builder::StructuredQuery;

pub use metadata::MetadataTraversalExecutor;
pub use relational::RelationalTraversalExecutor;

/// Everything a traversal tier may consult for one query.
#[derive(Debug, Clone, Copy)]
pub struct TraversalRequest<'a> {
    pub plan: &'a RelationshipQueryPlan,
    /// Compiled form of `plan`; absent when compilation failed.
    pub query: Option<&'a StructuredQuery>,
    pub limit: usize,
}

/// Returns ordered root entity ids. Failures are errors, never an empty list,
/// so callers can tell "no matches" from "tier broke".
pub trait TraversalExecutor: Send + Sync {
    fn stage(&self) -> ExecutionStage;

    fn execute(&self, request: &TraversalRequest<'_>) -> RelQueryResult<Vec<String>>;
}

pub(crate) fn traversal_context(
    stage: ExecutionStage,
    plan: &RelationshipQueryPlan,
    reason: impl Into<String>,
) -> ErrorContext {
    let candidates: Vec<String> = plan.candidate_entity_types.iter().cloned().collect();
    ErrorContext::new(stage.as_str(), &plan.original_query)
        .with_entity(Some(&plan.primary_entity_type), &candidates)
        .with_fallback(stage.is_fallback())
        .with_reason(reason)
}
