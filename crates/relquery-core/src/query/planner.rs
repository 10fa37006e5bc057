//! Query planner: free text to a validated [`RelationshipQueryPlan`].
//!
//! Plans are cached by the hash of the normalized query text (plus entity
//! hints). Cached plans are validated again on every read, since the schema
//! may have grown since they were stored.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PlannerConfig, ValidationMode};
use crate::errors::RelQueryResult;
use crate::models::{QueryOptions, RelationshipQueryPlan};
use crate::query::cache::{plan_cache_key, QueryCache};
use crate::query::guards::{clamp_depth, truncate_to, MAX_FEEDBACK_LENGTH, MAX_PLANNER_RETRIES};
use crate::query::metrics::QueryMetrics;
use crate::query::payload::{parse_plan, planning_error};
use crate::query::validator::QueryValidator;
use crate::schema::{SchemaContext, SchemaRegistry};

/// Everything the oracle receives for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct PlanningRequest<'a> {
    pub query: &'a str,
    pub schema_context: &'a SchemaContext,
    /// Issues with the previous attempt, empty on the first one.
    pub feedback: &'a [String],
    pub deadline: Option<Instant>,
}

/// External natural-language-to-plan translator. Returns the raw response;
/// parsing and validation stay on this side.
pub trait PlanningOracle: Send + Sync {
    fn plan(&self, request: &PlanningRequest<'_>) -> RelQueryResult<String>;
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: RelationshipQueryPlan,
    pub cache_hit: bool,
    /// Oracle calls made; zero for cache hits.
    pub attempts: u32,
}

pub struct QueryPlanner {
    oracle: Arc<dyn PlanningOracle>,
    registry: Arc<SchemaRegistry>,
    validator: Arc<QueryValidator>,
    cache: Arc<QueryCache>,
    metrics: Arc<QueryMetrics>,
    config: PlannerConfig,
    validation_mode: ValidationMode,
    max_traversal_depth: usize,
    default_limit: usize,
}

impl QueryPlanner {
    pub fn new(
        oracle: Arc<dyn PlanningOracle>,
        registry: Arc<SchemaRegistry>,
        validator: Arc<QueryValidator>,
        cache: Arc<QueryCache>,
        metrics: Arc<QueryMetrics>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            oracle,
            registry,
            validator,
            cache,
            metrics,
            config: config.planner.clone(),
            validation_mode: effective_validation_mode(config),
            max_traversal_depth: clamp_depth(config.max_traversal_depth),
            default_limit: config.default_limit,
        }
    }

    pub fn validation_mode(&self) -> ValidationMode {
        self.validation_mode
    }

    pub fn plan(&self, query: &str, options: &QueryOptions) -> RelQueryResult<PlanOutcome> {
        let started = Instant::now();
        let key = plan_cache_key(query, &options.entity_types);

        if let Some(cached) = self.cache.plans.get(&key) {
            match self.validator.validate(&cached, self.validation_mode) {
                Ok(()) => {
                    debug!("plan cache hit");
                    self.metrics.record_plan(started.elapsed(), true, true);
                    return Ok(PlanOutcome {
                        plan: cached,
                        cache_hit: true,
                        attempts: 0,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "cached plan failed re-validation; evicting");
                    self.cache.plans.invalidate(&key);
                }
            }
        }

        let result = self.plan_with_oracle(query, options);
        match &result {
            Ok(outcome) => {
                self.cache.plans.put(key, outcome.plan.clone());
                self.metrics.record_plan(started.elapsed(), true, false);
                if self.config.log_plans {
                    let body = serde_json::to_string(&outcome.plan).unwrap_or_default();
                    debug!(plan = %body, "planner output");
                }
                info!(
                    primary = %outcome.plan.primary_entity_type,
                    paths = outcome.plan.relationship_paths.len(),
                    attempts = outcome.attempts,
                    "query planned"
                );
            }
            Err(err) => {
                self.metrics.record_plan(started.elapsed(), false, false);
                warn!(error = %err, "query planning failed");
            }
        }
        result
    }

    fn plan_with_oracle(&self, query: &str, options: &QueryOptions) -> RelQueryResult<PlanOutcome> {
        if options.deadline_expired() {
            return Err(planning_error(query, "deadline exceeded before planning"));
        }
        let schema_context = self
            .registry
            .schema_context(&options.entity_types, self.max_traversal_depth)
            .map_err(|e| planning_error(query, e.to_string()))?;
        let default_primary = options.entity_types.first().map(String::as_str);

        let max_attempts = self.config.max_retries.min(MAX_PLANNER_RETRIES) + 1;
        let mut feedback: Vec<String> = Vec::new();
        let mut last_error = planning_error(query, "planner made no attempt");
        for attempt in 1..=max_attempts {
            if attempt > 1 && options.deadline_expired() {
                return Err(planning_error(query, "deadline exceeded during planning retries"));
            }
            let request = PlanningRequest {
                query,
                schema_context: &schema_context,
                feedback: &feedback,
                deadline: options.deadline,
            };
            let attempt_result = self
                .oracle
                .plan(&request)
                .map_err(|e| planning_error(query, format!("oracle call failed: {}", e.reason())))
                .and_then(|raw| {
                    parse_plan(&raw, query, default_primary, self.default_limit, &self.registry, &self.config)
                })
                .and_then(|plan| {
                    self.validator.validate(&plan, self.validation_mode)?;
                    Ok(plan)
                });
            match attempt_result {
                Ok(plan) => {
                    return Ok(PlanOutcome {
                        plan,
                        cache_hit: false,
                        attempts: attempt,
                    })
                }
                Err(err) => {
                    debug!(attempt, error = %err, "planning attempt rejected");
                    feedback = vec![truncate_to(&err.reason(), MAX_FEEDBACK_LENGTH)];
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

/// Validation never switches off entirely: with validation disabled the
/// schema checks relax to LAX while the injection and shape guards stay.
pub fn effective_validation_mode(config: &EngineConfig) -> ValidationMode {
    if config.enable_query_validation {
        config.validation_mode
    } else {
        ValidationMode::Lax
    }
}

impl std::fmt::Debug for QueryPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPlanner")
            .field("validation_mode", &self.validation_mode)
            .field("max_traversal_depth", &self.max_traversal_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::errors::RelQueryError;
    use crate::testing::{document_plan, oracle_reply, seeded_registry, ScriptedOracle};

    struct Harness {
        planner: QueryPlanner,
        oracle: Arc<ScriptedOracle>,
        cache: Arc<QueryCache>,
        metrics: Arc<QueryMetrics>,
    }

    fn harness(oracle: ScriptedOracle, config: EngineConfig) -> Harness {
        let registry = seeded_registry();
        let oracle = Arc::new(oracle);
        let cache = Arc::new(QueryCache::new(&config.cache));
        let metrics = Arc::new(QueryMetrics::new(MetricsConfig::default()));
        let validator = Arc::new(QueryValidator::new(Arc::clone(&registry), config.max_traversal_depth));
        let planner = QueryPlanner::new(
            oracle.clone(),
            registry,
            validator,
            Arc::clone(&cache),
            Arc::clone(&metrics),
            &config,
        );
        Harness {
            planner,
            oracle,
            cache,
            metrics,
        }
    }

    fn query() -> String {
        document_plan().original_query
    }

    #[test]
    fn identical_normalized_queries_are_served_from_cache() {
        let h = harness(ScriptedOracle::replying(&[&oracle_reply(&document_plan())]), EngineConfig::default());
        let first = h.planner.plan(&query(), &QueryOptions::default()).unwrap();
        let reformatted = format!("  {}   ", query().to_lowercase().replace(' ', "  "));
        let second = h.planner.plan(&reformatted, &QueryOptions::default()).unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.plan, second.plan);
        assert_eq!(first.plan, document_plan());
        assert_eq!(h.oracle.calls(), 1);
        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.plans, 2);
        assert_eq!(snapshot.plan_cache_hits, 1);
    }

    #[test]
    fn unparseable_reply_is_retried_with_feedback() {
        let h = harness(
            ScriptedOracle::replying(&["Sorry, I can't do JSON today.", &oracle_reply(&document_plan())]),
            EngineConfig::default(),
        );
        let outcome = h.planner.plan(&query(), &QueryOptions::default()).unwrap();
        assert_eq!(outcome.attempts, 2);
        let feedback = h.oracle.feedback_seen();
        assert!(feedback[0].is_empty());
        assert!(feedback[1][0].contains("no JSON object"));
    }

    #[test]
    fn exhausted_retries_raise_planning_error() {
        let h = harness(ScriptedOracle::replying(&["no plan"]), EngineConfig::default());
        match h.planner.plan(&query(), &QueryOptions::default()).unwrap_err() {
            RelQueryError::QueryPlanning(ctx) => assert!(ctx.reason.contains("no JSON object")),
            other => panic!("unexpected {other}"),
        }
        assert_eq!(h.oracle.calls(), 2);
        assert_eq!(h.metrics.snapshot().plan_failures, 1);
        assert_eq!(h.cache.plans.stats().size, 0);
    }

    #[test]
    fn oracle_failure_is_terminal_planning_error() {
        let mut config = EngineConfig::default();
        config.planner.max_retries = 0;
        let h = harness(ScriptedOracle::failing("provider timeout"), config);
        let err = h.planner.plan(&query(), &QueryOptions::default()).unwrap_err();
        assert!(matches!(err, RelQueryError::QueryPlanning(_)));
        assert!(err.reason().contains("provider timeout"));
        assert_eq!(h.oracle.calls(), 1);
    }

    #[test]
    fn plan_failing_guardrails_surfaces_validation_error() {
        let mut plan = document_plan();
        plan.primary_entity_type = "invoice".into();
        plan.candidate_entity_types = ["invoice".to_string()].into();
        let h = harness(ScriptedOracle::replying(&[&oracle_reply(&plan)]), EngineConfig::default());
        let err = h.planner.plan(&query(), &QueryOptions::default()).unwrap_err();
        assert!(matches!(err, RelQueryError::Validation(_)));
        assert_eq!(h.cache.plans.stats().size, 0);
    }

    #[test]
    fn injection_text_never_yields_a_plan() {
        let h = harness(ScriptedOracle::replying(&[&oracle_reply(&document_plan())]), EngineConfig::default());
        let err = h
            .planner
            .plan("contracts'; DROP TABLE x; --", &QueryOptions::default())
            .unwrap_err();
        assert!(matches!(err, RelQueryError::Validation(_)));
    }

    #[test]
    fn cached_plan_failing_revalidation_is_replaced() {
        let h = harness(ScriptedOracle::replying(&[&oracle_reply(&document_plan())]), EngineConfig::default());
        let mut stale = document_plan();
        stale.relationship_paths[0].relationship_type = Some("reviewer".into());
        h.cache.plans.put(plan_cache_key(&query(), &[]), stale);

        let outcome = h.planner.plan(&query(), &QueryOptions::default()).unwrap();
        assert!(!outcome.cache_hit);
        assert_eq!(h.oracle.calls(), 1);
        assert_eq!(h.cache.plans.get(&plan_cache_key(&query(), &[])), Some(document_plan()));
    }

    #[test]
    fn expired_deadline_skips_the_oracle() {
        let h = harness(ScriptedOracle::replying(&[&oracle_reply(&document_plan())]), EngineConfig::default());
        let options = QueryOptions {
            deadline: Some(Instant::now()),
            ..QueryOptions::default()
        };
        let err = h.planner.plan(&query(), &options).unwrap_err();
        assert!(err.reason().contains("deadline"));
        assert_eq!(h.oracle.calls(), 0);
    }

    #[test]
    fn unknown_entity_hint_is_a_planning_error() {
        let h = harness(ScriptedOracle::replying(&[&oracle_reply(&document_plan())]), EngineConfig::default());
        let options = QueryOptions {
            entity_types: vec!["invoice".into()],
            ..QueryOptions::default()
        };
        assert!(matches!(
            h.planner.plan(&query(), &options),
            Err(RelQueryError::QueryPlanning(_))
        ));
    }

    #[test]
    fn disabled_validation_relaxes_to_lax() {
        let config = EngineConfig {
            enable_query_validation: false,
            ..EngineConfig::default()
        };
        assert_eq!(effective_validation_mode(&config), ValidationMode::Lax);
        assert_eq!(effective_validation_mode(&EngineConfig::default()), ValidationMode::Strict);
    }
}
