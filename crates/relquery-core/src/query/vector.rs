//! Vector tier: embeds the query text and ranks entities by similarity.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::{ExecutionStage, RelationshipQueryPlan};
use crate::query::cache::{embedding_cache_key, QueryCache};
use crate::query::guards::{clamp_threshold, MAX_RESULT_LIMIT};
use crate::query::traversal::traversal_context;

/// Turns text into an embedding vector.
pub trait EmbeddingService: Send + Sync {
    /// Implementations that block on I/O should give up once `deadline` passes.
    fn embed(&self, text: &str, deadline: Option<Instant>) -> RelQueryResult<Vec<f32>>;
}

/// One ranked identifier returned by a [`VectorSearch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
}

/// Similarity search over stored entity embeddings.
pub trait VectorSearch: Send + Sync {
    fn search(
        &self,
        vector: &[f32],
        entity_type: &str,
        limit: usize,
        threshold: f64,
        deadline: Option<Instant>,
    ) -> RelQueryResult<Vec<VectorHit>>;
}

/// Parameters for one vector lookup.
#[derive(Debug, Clone, Copy)]
pub struct VectorRequest<'a> {
    pub plan: &'a RelationshipQueryPlan,
    pub limit: usize,
    pub threshold: f64,
    pub deadline: Option<Instant>,
    /// When set, only ids in this set survive.
    pub restrict_to: Option<&'a HashSet<String>>,
}

pub struct VectorSearchExecutor {
    embedder: Arc<dyn EmbeddingService>,
    search: Arc<dyn VectorSearch>,
    cache: Arc<QueryCache>,
}

impl VectorSearchExecutor {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        search: Arc<dyn VectorSearch>,
        cache: Arc<QueryCache>,
    ) -> Self {
        Self {
            embedder,
            search,
            cache,
        }
    }

    pub fn stage(&self) -> ExecutionStage {
        ExecutionStage::FallbackVector
    }

    /// Embedding for `text`, served from the embedding region when possible.
    pub fn embedding_for(&self, text: &str, deadline: Option<Instant>) -> RelQueryResult<Arc<Vec<f32>>> {
        let key = embedding_cache_key(text);
        if let Some(cached) = self.cache.embeddings.get(&key) {
            debug!("embedding cache hit");
            return Ok(cached);
        }
        let vector = Arc::new(self.embedder.embed(text, deadline)?);
        if vector.is_empty() {
            return Err(RelQueryError::Store("embedding service returned an empty vector".into()));
        }
        self.cache.embeddings.put(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Hits at or above the threshold, best first.
    pub fn search(&self, request: &VectorRequest<'_>) -> RelQueryResult<Vec<VectorHit>> {
        let plan = request.plan;
        let fail = |reason: String| {
            RelQueryError::VectorSearch(traversal_context(ExecutionStage::FallbackVector, plan, reason))
        };
        if request.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(fail("deadline exceeded before vector search".into()));
        }
        let threshold = clamp_threshold(request.threshold);
        let vector = self
            .embedding_for(plan.semantic_text(), request.deadline)
            .map_err(|e| fail(e.reason()))?;
        // Allowed ids may rank anywhere; fetch the widest window before intersecting.
        let fetch = match request.restrict_to {
            Some(_) => MAX_RESULT_LIMIT.max(request.limit),
            None => request.limit,
        };
        let mut hits = self
            .search
            .search(&vector, &plan.primary_entity_type, fetch, threshold, request.deadline)
            .map_err(|e| fail(e.reason()))?;

        hits.retain(|hit| !hit.id.trim().is_empty() && hit.score >= threshold);
        if let Some(allowed) = request.restrict_to {
            hits.retain(|hit| allowed.contains(&hit.id));
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        let mut seen = HashSet::new();
        hits.retain(|hit| seen.insert(hit.id.clone()));
        hits.truncate(request.limit);
        debug!(results = hits.len(), threshold, "vector search finished");
        Ok(hits)
    }

    /// Vector hits first, then the remaining `ids` in their original order.
    /// Any failure leaves `ids` untouched.
    pub fn rerank(&self, ids: Vec<String>, request: &VectorRequest<'_>) -> Vec<String> {
        match self.search(request) {
            Ok(hits) if !hits.is_empty() => merge_ranked(&hits, ids),
            Ok(_) => ids,
            Err(err) => {
                warn!(error = %err, "vector re-ranking failed");
                ids
            }
        }
    }
}

fn merge_ranked(hits: &[VectorHit], ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(hits.len() + ids.len());
    for id in hits.iter().map(|h| h.id.clone()).chain(ids) {
        if seen.insert(id.clone()) {
            merged.push(id);
        }
    }
    merged
}
