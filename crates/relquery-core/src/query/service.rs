//! Reliable query service: the only entry point callers use.
//!
//! A query moves through an explicit state machine:
//!
//! ```text
//! PLANNING -> VALIDATING -> EXECUTING_PRIMARY -> [METADATA] -> [VECTOR] -> [SIMPLE] -> DONE | FAILED
//! ```
//!
//! Planning and validation failures end the request. Every execution tier
//! reports a [`StageOutcome`]; [`next_state`] alone decides where that leads,
//! so the fallback policy can be tested without running any tier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::{RelQueryError, RelQueryResult, StageFailure};
use crate::models::{
    ExecutionStage, QueryMode, QueryOptions, QueryStrategy, RelationshipQueryPlan, ResultDocument, ReturnMode,
    StageOutcome,
};
use crate::query::builder::{QueryBuilder, StructuredQuery};
use crate::query::cache::QueryCache;
use crate::query::guards::{clamp_limit, clamp_threshold, MAX_RESULT_LIMIT};
use crate::query::keyword::KeywordSearchExecutor;
use crate::query::metrics::{QueryDisposition, QueryMetrics, QueryMetricsSnapshot};
use crate::query::planner::{PlanningOracle, QueryPlanner};
use crate::query::traversal::{
    MetadataTraversalExecutor, RelationalTraversalExecutor, TraversalExecutor, TraversalRequest,
};
use crate::query::validator::QueryValidator;
use crate::query::vector::{EmbeddingService, VectorRequest, VectorSearch, VectorSearchExecutor};
use crate::schema::SchemaRegistry;
use crate::store::EntityStore;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    Planning,
    Validating,
    ExecutingPrimary,
    ExecutingMetadataFallback,
    ExecutingVectorFallback,
    ExecutingSimpleFallback,
    Done,
    Failed,
}

impl QueryState {
    /// The execution tier this state runs, if any.
    pub fn stage(self) -> Option<ExecutionStage> {
        match self {
            QueryState::ExecutingPrimary => Some(ExecutionStage::Primary),
            QueryState::ExecutingMetadataFallback => Some(ExecutionStage::FallbackMetadata),
            QueryState::ExecutingVectorFallback => Some(ExecutionStage::FallbackVector),
            QueryState::ExecutingSimpleFallback => Some(ExecutionStage::FallbackSimple),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueryState::Done | QueryState::Failed)
    }
}

/// What happened in the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    Planned,
    PlanningFailed,
    Validated,
    ValidationFailed,
    Executed(StageOutcome),
}

/// Plan-dependent inputs to the transition function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionPolicy {
    pub needs_semantic_search: bool,
    pub vector_acceptable: bool,
}

/// Pure transition function. Terminal states absorb every event; an event
/// that does not belong to the current state fails the request.
pub fn next_state(state: QueryState, event: &StateEvent, policy: TransitionPolicy) -> QueryState {
    use QueryState::*;

    if state.is_terminal() {
        return state;
    }
    match (state, event) {
        (Planning, StateEvent::Planned) => Validating,
        (Validating, StateEvent::Validated) => ExecutingPrimary,
        (_, StateEvent::PlanningFailed | StateEvent::ValidationFailed) => Failed,
        (ExecutingPrimary, StateEvent::Executed(StageOutcome::Succeeded(_))) => Done,
        (ExecutingPrimary, StateEvent::Executed(StageOutcome::Empty)) if !policy.needs_semantic_search => Done,
        (ExecutingPrimary, StateEvent::Executed(_)) => ExecutingMetadataFallback,
        (_, StateEvent::Executed(StageOutcome::Succeeded(_))) if state.stage().is_some() => Done,
        (ExecutingMetadataFallback, StateEvent::Executed(_)) if policy.vector_acceptable => ExecutingVectorFallback,
        (ExecutingMetadataFallback, StateEvent::Executed(_)) => ExecutingSimpleFallback,
        (ExecutingVectorFallback, StateEvent::Executed(_)) => ExecutingSimpleFallback,
        (ExecutingSimpleFallback, StateEvent::Executed(_)) => Failed,
        _ => Failed,
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub stage: ExecutionStage,
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub original_query: String,
    pub entity_type: String,
    pub documents: Vec<ResultDocument>,
    /// True when a fallback tier produced the answer.
    pub used_fallback: bool,
    /// The tier that produced the answer.
    pub strategy: ExecutionStage,
    pub mode: QueryMode,
    pub plan: RelationshipQueryPlan,
    pub plan_cache_hit: bool,
    pub stage_history: Vec<StageRecord>,
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl QueryResponse {
    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.id.as_str()).collect()
    }
}

/// Ranked output of one tier.
struct StageHits {
    ids: Vec<String>,
    scores: Option<Vec<f64>>,
}

impl StageHits {
    fn ids(ids: Vec<String>) -> Self {
        Self { ids, scores: None }
    }
}

/// Per-request values shared by every tier.
struct ExecutionContext<'a> {
    plan: &'a RelationshipQueryPlan,
    options: &'a QueryOptions,
    compiled: Result<StructuredQuery, String>,
    mode: QueryMode,
    limit: usize,
    threshold: f64,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct ReliableQueryService {
    config: EngineConfig,
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn EntityStore>,
    planner: QueryPlanner,
    validator: Arc<QueryValidator>,
    builder: QueryBuilder,
    relational: RelationalTraversalExecutor,
    metadata: MetadataTraversalExecutor,
    keyword: KeywordSearchExecutor,
    vector: Option<VectorSearchExecutor>,
    cache: Arc<QueryCache>,
    metrics: Arc<QueryMetrics>,
}

impl ReliableQueryService {
    pub fn new(
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn EntityStore>,
        oracle: Arc<dyn PlanningOracle>,
        config: EngineConfig,
    ) -> Self {
        let config = config.sanitized();
        let cache = Arc::new(QueryCache::new(&config.cache));
        let metrics = Arc::new(QueryMetrics::new(config.metrics.clone()));
        let validator = Arc::new(QueryValidator::new(Arc::clone(&registry), config.max_traversal_depth));
        let planner = QueryPlanner::new(
            oracle,
            Arc::clone(&registry),
            Arc::clone(&validator),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            &config,
        );
        Self {
            builder: QueryBuilder::new(Arc::clone(&registry)),
            relational: RelationalTraversalExecutor::new(Arc::clone(&store)),
            metadata: MetadataTraversalExecutor::new(Arc::clone(&store)).with_scan_cap(config.metadata_scan_cap),
            keyword: KeywordSearchExecutor::new(Arc::clone(&store)),
            vector: None,
            config,
            registry,
            store,
            planner,
            validator,
            cache,
            metrics,
        }
    }

    /// Attach the embedding and vector-search collaborators.
    pub fn with_vector_search(mut self, embedder: Arc<dyn EmbeddingService>, search: Arc<dyn VectorSearch>) -> Self {
        self.vector = Some(VectorSearchExecutor::new(embedder, search, Arc::clone(&self.cache)));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn metrics(&self) -> QueryMetricsSnapshot {
        self.metrics.update_cache_stats(self.cache.stats());
        self.metrics.snapshot()
    }

    /// Answer `text`, degrading through the fallback tiers as needed.
    pub fn query(&self, text: &str, options: &QueryOptions) -> RelQueryResult<QueryResponse> {
        let started = Instant::now();
        let policy_free = TransitionPolicy::default();
        info!(query = %text, "relationship query received");

        let mut state = QueryState::Planning;
        let outcome = match self.planner.plan(text, options) {
            Ok(outcome) => {
                state = next_state(state, &StateEvent::Planned, policy_free);
                outcome
            }
            Err(err) => {
                debug!(state = ?next_state(state, &StateEvent::PlanningFailed, policy_free), "planning failed");
                self.finish(QueryDisposition::Rejected);
                return Err(err);
            }
        };
        let plan = outcome.plan;

        if let Err(err) = self.validator.validate(&plan, self.planner.validation_mode()) {
            debug!(state = ?next_state(state, &StateEvent::ValidationFailed, policy_free), "validation failed");
            self.finish(QueryDisposition::Rejected);
            return Err(err);
        }
        state = next_state(state, &StateEvent::Validated, policy_free);

        let policy = TransitionPolicy {
            needs_semantic_search: plan.needs_semantic_search,
            vector_acceptable: self.vector_acceptable(&plan, options),
        };
        let limit = clamp_limit(options.limit.unwrap_or(plan.limit), MAX_RESULT_LIMIT);
        let ctx = ExecutionContext {
            plan: &plan,
            options,
            compiled: self.builder.build_with_limit(&plan, limit).map_err(|e| e.to_string()),
            mode: self.resolve_mode(&plan, options),
            limit,
            threshold: clamp_threshold(
                options
                    .similarity_threshold
                    .unwrap_or(self.config.default_similarity_threshold),
            ),
        };
        if let Ok(compiled) = &ctx.compiled {
            debug!(sql = %compiled.sql, params = compiled.parameters.len(), "compiled plan");
        }

        let mut history: Vec<StageRecord> = Vec::new();
        let mut answer: Option<(ExecutionStage, StageHits)> = None;
        while let Some(stage) = state.stage() {
            let stage_started = Instant::now();
            let (stage_outcome, hits) = self.run_stage(stage, &ctx);
            let elapsed = stage_started.elapsed();
            match &stage_outcome {
                StageOutcome::Succeeded(n) => self.metrics.record_execution(stage, elapsed, *n),
                StageOutcome::Empty => self.metrics.record_execution(stage, elapsed, 0),
                StageOutcome::Failed(reason) => {
                    warn!(stage = stage.as_str(), reason = %reason, "tier failed; advancing");
                    self.metrics.record_execution_failure(stage, elapsed);
                }
                StageOutcome::Skipped(reason) => debug!(stage = stage.as_str(), reason = %reason, "tier skipped"),
            }
            self.metrics.record_fallback_stage(stage, &stage_outcome);

            let next = next_state(state, &StateEvent::Executed(stage_outcome.clone()), policy);
            history.push(StageRecord {
                stage,
                outcome: stage_outcome,
                elapsed_ms: elapsed.as_millis() as u64,
            });
            if next == QueryState::ExecutingSimpleFallback && state == QueryState::ExecutingMetadataFallback {
                let reason = "semantic search not acceptable for this plan".to_string();
                self.metrics
                    .record_fallback_stage(ExecutionStage::FallbackVector, &StageOutcome::Skipped(reason.clone()));
                history.push(StageRecord {
                    stage: ExecutionStage::FallbackVector,
                    outcome: StageOutcome::Skipped(reason),
                    elapsed_ms: 0,
                });
            }
            if next == QueryState::Done {
                answer = Some((stage, hits));
            }
            state = next;
        }

        let Some((stage, hits)) = answer.filter(|_| state == QueryState::Done) else {
            self.finish(QueryDisposition::Exhausted);
            warn!(query = %text, stages = history.len(), "fallback chain exhausted");
            return Err(RelQueryError::FallbackExhausted {
                query: text.to_string(),
                history: history
                    .iter()
                    .map(|record| StageFailure {
                        stage: record.stage.as_str().to_string(),
                        outcome: record.outcome.label().to_string(),
                        detail: record.outcome.detail(),
                    })
                    .collect(),
            });
        };

        let used_fallback = stage.is_fallback();
        let mut warnings = Vec::new();
        if used_fallback {
            warnings.push(format!("results returned from fallback stage {stage}"));
        }
        let documents = self.materialize(&ctx, stage, hits, &mut warnings);
        self.finish(if used_fallback {
            QueryDisposition::Fallback
        } else {
            QueryDisposition::Primary
        });
        info!(
            strategy = stage.as_str(),
            results = documents.len(),
            used_fallback,
            "relationship query answered"
        );
        Ok(QueryResponse {
            original_query: text.to_string(),
            entity_type: plan.primary_entity_type.clone(),
            documents,
            used_fallback,
            strategy: stage,
            mode: ctx.mode,
            plan_cache_hit: outcome.cache_hit,
            plan: plan.clone(),
            stage_history: history,
            warnings,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn finish(&self, disposition: QueryDisposition) {
        self.metrics.update_cache_stats(self.cache.stats());
        self.metrics.record_query(disposition);
    }

    fn resolve_mode(&self, plan: &RelationshipQueryPlan, options: &QueryOptions) -> QueryMode {
        if let Some(mode) = options.force_mode {
            return mode;
        }
        if plan.needs_semantic_search && self.config.enable_vector_search && self.vector.is_some() {
            return QueryMode::Enhanced;
        }
        self.config.default_query_mode
    }

    fn vector_acceptable(&self, plan: &RelationshipQueryPlan, options: &QueryOptions) -> bool {
        self.config.enable_vector_search
            && (plan.needs_semantic_search
                || plan.query_strategy != QueryStrategy::Relationship
                || options
                    .semantic_fallback
                    .unwrap_or(self.config.fallback_to_vector_search))
    }

    // -----------------------------------------------------------------------
    // Tiers
    // -----------------------------------------------------------------------

    fn run_stage(&self, stage: ExecutionStage, ctx: &ExecutionContext<'_>) -> (StageOutcome, StageHits) {
        let result = match stage {
            ExecutionStage::Primary => self.run_primary(ctx),
            ExecutionStage::FallbackMetadata => {
                if !self.config.fallback_to_metadata {
                    return skipped("metadata fallback disabled");
                }
                self.run_traversal(&self.metadata, ctx, ctx.limit)
            }
            ExecutionStage::FallbackVector => {
                if !self.config.fallback_to_vector_search || !self.config.enable_vector_search {
                    return skipped("vector fallback disabled");
                }
                let Some(vector) = &self.vector else {
                    return skipped("no embedding or vector search collaborator");
                };
                self.run_vector(vector, ctx)
            }
            ExecutionStage::FallbackSimple => {
                if !self.config.fallback_to_simple_search {
                    return skipped("simple fallback disabled");
                }
                let limit = ctx.options.limit.unwrap_or(self.config.simple_default_limit);
                self.run_traversal(&self.keyword, ctx, clamp_limit(limit, MAX_RESULT_LIMIT))
            }
        };
        match result {
            Ok(hits) if hits.ids.is_empty() => (StageOutcome::Empty, hits),
            Ok(hits) => (StageOutcome::Succeeded(hits.ids.len()), hits),
            Err(err) => (StageOutcome::Failed(err.reason()), StageHits::ids(Vec::new())),
        }
    }

    fn run_primary(&self, ctx: &ExecutionContext<'_>) -> RelQueryResult<StageHits> {
        let compiled = match &ctx.compiled {
            Ok(compiled) => compiled,
            Err(reason) => {
                return Err(RelQueryError::QueryExecution(crate::query::traversal::traversal_context(
                    ExecutionStage::Primary,
                    ctx.plan,
                    reason.clone(),
                )))
            }
        };
        let key = compiled.cache_key();
        let ids = match self.cache.results.get(&key) {
            Some(cached) => {
                debug!("result cache hit");
                cached.as_ref().clone()
            }
            None => {
                let ids = self.relational.execute(&TraversalRequest {
                    plan: ctx.plan,
                    query: Some(compiled),
                    limit: ctx.limit,
                })?;
                self.cache.results.put(key, Arc::new(ids.clone()));
                ids
            }
        };

        if ctx.mode == QueryMode::Enhanced && !ids.is_empty() {
            if let Some(vector) = &self.vector {
                let reranked = vector.rerank(ids, &self.vector_request(ctx, None));
                return Ok(StageHits::ids(reranked));
            }
        }
        Ok(StageHits::ids(ids))
    }

    fn run_traversal(
        &self,
        executor: &dyn TraversalExecutor,
        ctx: &ExecutionContext<'_>,
        limit: usize,
    ) -> RelQueryResult<StageHits> {
        let ids = executor.execute(&TraversalRequest {
            plan: ctx.plan,
            query: ctx.compiled.as_ref().ok(),
            limit,
        })?;
        Ok(StageHits::ids(ids))
    }

    fn run_vector(&self, vector: &VectorSearchExecutor, ctx: &ExecutionContext<'_>) -> RelQueryResult<StageHits> {
        let allowed: Option<HashSet<String>> = if self.config.vector_intersect_metadata && ctx.plan.has_filters() {
            match self.metadata.execute(&TraversalRequest {
                plan: ctx.plan,
                query: None,
                limit: self.config.metadata_scan_cap,
            }) {
                Ok(ids) => Some(ids.into_iter().collect()),
                Err(err) => {
                    warn!(error = %err, "metadata intersection unavailable; using raw vector hits");
                    None
                }
            }
        } else {
            None
        };
        let hits = vector.search(&self.vector_request(ctx, allowed.as_ref()))?;
        let scores = hits.iter().map(|h| h.score).collect();
        Ok(StageHits {
            ids: hits.into_iter().map(|h| h.id).collect(),
            scores: Some(scores),
        })
    }

    fn vector_request<'a>(
        &self,
        ctx: &'a ExecutionContext<'_>,
        restrict_to: Option<&'a HashSet<String>>,
    ) -> VectorRequest<'a> {
        VectorRequest {
            plan: ctx.plan,
            limit: clamp_limit(
                ctx.options.limit.unwrap_or(self.config.vector_default_limit),
                MAX_RESULT_LIMIT,
            ),
            threshold: ctx.threshold,
            deadline: ctx.options.deadline,
            restrict_to,
        }
    }

    // -----------------------------------------------------------------------
    // Materialization
    // -----------------------------------------------------------------------

    fn materialize(
        &self,
        ctx: &ExecutionContext<'_>,
        stage: ExecutionStage,
        hits: StageHits,
        warnings: &mut Vec<String>,
    ) -> Vec<ResultDocument> {
        let return_mode = ctx
            .options
            .return_mode
            .or(Some(ctx.plan.return_mode).filter(|m| *m != ReturnMode::Ids))
            .unwrap_or(self.config.default_return_mode);
        let source = stage.as_str().to_lowercase();
        let scores = hits.scores.filter(|_| ctx.options.include_vector_scores);
        let limit = match stage {
            ExecutionStage::FallbackVector | ExecutionStage::FallbackSimple => usize::MAX,
            _ => ctx.limit,
        };

        let mut documents = Vec::new();
        for (index, id) in hits.ids.into_iter().take(limit).enumerate() {
            let score = scores.as_ref().and_then(|s| s.get(index).copied());
            if return_mode == ReturnMode::Ids {
                documents.push(ResultDocument {
                    id,
                    content: None,
                    metadata: None,
                    score,
                    source: source.clone(),
                });
                continue;
            }
            match self.store.find_entity(&ctx.plan.primary_entity_type, &id) {
                Ok(Some(entity)) => documents.push(ResultDocument {
                    metadata: entity
                        .metadata
                        .as_deref()
                        .and_then(|raw| serde_json::from_str(raw).ok()),
                    content: entity.searchable_content,
                    id,
                    score,
                    source: source.clone(),
                }),
                Ok(None) => debug!(id = %id, "result no longer in store; dropped"),
                Err(err) => warnings.push(format!("could not load {id}: {}", err.reason())),
            }
        }
        documents
    }
}

fn skipped(reason: &str) -> (StageOutcome, StageHits) {
    (StageOutcome::Skipped(reason.to_string()), StageHits::ids(Vec::new()))
}
