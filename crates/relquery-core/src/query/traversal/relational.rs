//! Primary tier: runs the compiled query against the store's native joins.

use std::sync::Arc;

use tracing::debug;

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::ExecutionStage;
use crate::query::traversal::{traversal_context, TraversalExecutor, TraversalRequest};
use crate::store::EntityStore;

pub struct RelationalTraversalExecutor {
    store: Arc<dyn EntityStore>,
}

impl RelationalTraversalExecutor {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

impl TraversalExecutor for RelationalTraversalExecutor {
    fn stage(&self) -> ExecutionStage {
        ExecutionStage::Primary
    }

    fn execute(&self, request: &TraversalRequest<'_>) -> RelQueryResult<Vec<String>> {
        let stage = self.stage();
        let Some(query) = request.query else {
            return Err(RelQueryError::QueryExecution(traversal_context(
                stage,
                request.plan,
                "no compiled query available for relational traversal",
            )));
        };
        let mut ids = self.store.execute_structured(query).map_err(|e| {
            RelQueryError::QueryExecution(traversal_context(stage, request.plan, e.to_string()))
        })?;
        ids.truncate(request.limit.min(query.limit));
        debug!(results = ids.len(), "relational traversal finished");
        Ok(ids)
    }
}
