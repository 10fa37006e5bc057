//! Atomic counters for planning, execution, fallback usage and cache effectiveness.
//!
//! Metrics are observation only; the engine never branches on them. Threshold
//! breaches are reported as `warn!` logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::MetricsConfig;
use crate::models::{ExecutionStage, StageOutcome};
use crate::query::cache::QueryCacheStats;

#[derive(Default)]
struct LatencyCounter {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyCounter {
    fn record(&self, latency: Duration) -> u64 {
        let ms = latency.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
        ms
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            total_ms: total,
            max_ms: self.max_ms.load(Ordering::Relaxed),
            avg_ms: if count == 0 { 0.0 } else { total as f64 / count as f64 },
        }
    }
}

/// How a caller query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryDisposition {
    /// Answered by the relational tier.
    Primary,
    /// Answered by a fallback tier.
    Fallback,
    /// Every tier ran and none produced an answer.
    Exhausted,
    /// Planning or validation failed; no tier ran.
    Rejected,
}

impl QueryDisposition {
    fn reached_fallback(self) -> bool {
        matches!(self, QueryDisposition::Fallback | QueryDisposition::Exhausted)
    }
}

#[derive(Default)]
struct StageCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    empties: AtomicU64,
    failures: AtomicU64,
    skips: AtomicU64,
    produced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub stage: ExecutionStage,
    pub attempts: u64,
    pub successes: u64,
    pub empties: u64,
    pub failures: u64,
    pub skips: u64,
    pub produced: u64,
}

/// Immutable point-in-time view of every counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetricsSnapshot {
    pub plans: u64,
    pub plan_failures: u64,
    pub plan_cache_hits: u64,
    pub plan_latency: LatencySnapshot,
    pub executions: u64,
    pub execution_failures: u64,
    pub execution_latency: LatencySnapshot,
    pub queries: u64,
    pub fallback_queries: u64,
    pub failed_queries: u64,
    pub rejected_queries: u64,
    pub fallback_rate: f64,
    pub stages: Vec<StageSnapshot>,
    pub cache: QueryCacheStats,
}

pub struct QueryMetrics {
    config: MetricsConfig,
    plans: AtomicU64,
    plan_failures: AtomicU64,
    plan_cache_hits: AtomicU64,
    plan_latency: LatencyCounter,
    executions: AtomicU64,
    execution_failures: AtomicU64,
    execution_latency: LatencyCounter,
    queries: AtomicU64,
    fallback_queries: AtomicU64,
    failed_queries: AtomicU64,
    rejected_queries: AtomicU64,
    stages: [StageCounters; 4],
    cache: Mutex<QueryCacheStats>,
}

impl Default for QueryMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl QueryMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            plans: AtomicU64::new(0),
            plan_failures: AtomicU64::new(0),
            plan_cache_hits: AtomicU64::new(0),
            plan_latency: LatencyCounter::default(),
            executions: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            execution_latency: LatencyCounter::default(),
            queries: AtomicU64::new(0),
            fallback_queries: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
            rejected_queries: AtomicU64::new(0),
            stages: Default::default(),
            cache: Mutex::new(QueryCacheStats::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn record_plan(&self, latency: Duration, success: bool, cache_hit: bool) {
        if !self.config.enabled {
            return;
        }
        self.plans.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.plan_failures.fetch_add(1, Ordering::Relaxed);
        }
        if cache_hit {
            self.plan_cache_hits.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let ms = self.plan_latency.record(latency);
        if ms > self.config.plan_latency_warn_ms {
            warn!(
                latency_ms = ms,
                threshold_ms = self.config.plan_latency_warn_ms,
                "query planning latency above threshold"
            );
        }
    }

    pub fn record_execution(&self, stage: ExecutionStage, latency: Duration, produced: usize) {
        if !self.config.enabled {
            return;
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        let ms = self.execution_latency.record(latency);
        if ms > self.config.execution_latency_warn_ms {
            warn!(
                stage = stage.as_str(),
                latency_ms = ms,
                produced,
                threshold_ms = self.config.execution_latency_warn_ms,
                "query execution latency above threshold"
            );
        }
    }

    pub fn record_execution_failure(&self, stage: ExecutionStage, latency: Duration) {
        if !self.config.enabled {
            return;
        }
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.execution_failures.fetch_add(1, Ordering::Relaxed);
        self.execution_latency.record(latency);
        tracing::debug!(stage = stage.as_str(), "execution failure recorded");
    }

    pub fn record_fallback_stage(&self, stage: ExecutionStage, outcome: &StageOutcome) {
        if !self.config.enabled {
            return;
        }
        let counters = &self.stages[stage.index()];
        match outcome {
            StageOutcome::Succeeded(produced) => {
                counters.attempts.fetch_add(1, Ordering::Relaxed);
                counters.successes.fetch_add(1, Ordering::Relaxed);
                counters.produced.fetch_add(*produced as u64, Ordering::Relaxed);
            }
            StageOutcome::Empty => {
                counters.attempts.fetch_add(1, Ordering::Relaxed);
                counters.empties.fetch_add(1, Ordering::Relaxed);
            }
            StageOutcome::Failed(_) => {
                counters.attempts.fetch_add(1, Ordering::Relaxed);
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
            StageOutcome::Skipped(_) => {
                counters.skips.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Close out one caller query and check the fallback-rate alert. Only
    /// queries that reached a fallback tier count toward the rate.
    pub fn record_query(&self, disposition: QueryDisposition) {
        if !self.config.enabled {
            return;
        }
        let queries = self.queries.fetch_add(1, Ordering::Relaxed) + 1;
        match disposition {
            QueryDisposition::Primary | QueryDisposition::Fallback => {}
            QueryDisposition::Exhausted => {
                self.failed_queries.fetch_add(1, Ordering::Relaxed);
            }
            QueryDisposition::Rejected => {
                self.failed_queries.fetch_add(1, Ordering::Relaxed);
                self.rejected_queries.fetch_add(1, Ordering::Relaxed);
            }
        }
        if !disposition.reached_fallback() {
            return;
        }
        let fallbacks = self.fallback_queries.fetch_add(1, Ordering::Relaxed) + 1;
        if queries < self.config.alert_min_samples {
            return;
        }
        let rate = fallbacks as f64 / queries as f64;
        if rate > self.config.fallback_rate_alert {
            warn!(
                fallback_rate = rate,
                threshold = self.config.fallback_rate_alert,
                queries,
                "fallback rate above alert threshold"
            );
        }
    }

    pub fn update_cache_stats(&self, stats: QueryCacheStats) {
        if !self.config.enabled {
            return;
        }
        *self.cache.lock() = stats;
    }

    pub fn snapshot(&self) -> QueryMetricsSnapshot {
        let queries = self.queries.load(Ordering::Relaxed);
        let fallback_queries = self.fallback_queries.load(Ordering::Relaxed);
        QueryMetricsSnapshot {
            plans: self.plans.load(Ordering::Relaxed),
            plan_failures: self.plan_failures.load(Ordering::Relaxed),
            plan_cache_hits: self.plan_cache_hits.load(Ordering::Relaxed),
            plan_latency: self.plan_latency.snapshot(),
            executions: self.executions.load(Ordering::Relaxed),
            execution_failures: self.execution_failures.load(Ordering::Relaxed),
            execution_latency: self.execution_latency.snapshot(),
            queries,
            fallback_queries,
            failed_queries: self.failed_queries.load(Ordering::Relaxed),
            rejected_queries: self.rejected_queries.load(Ordering::Relaxed),
            fallback_rate: if queries == 0 {
                0.0
            } else {
                fallback_queries as f64 / queries as f64
            },
            stages: ExecutionStage::ALL
                .iter()
                .map(|stage| {
                    let c = &self.stages[stage.index()];
                    StageSnapshot {
                        stage: *stage,
                        attempts: c.attempts.load(Ordering::Relaxed),
                        successes: c.successes.load(Ordering::Relaxed),
                        empties: c.empties.load(Ordering::Relaxed),
                        failures: c.failures.load(Ordering::Relaxed),
                        skips: c.skips.load(Ordering::Relaxed),
                        produced: c.produced.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            cache: *self.cache.lock(),
        }
    }

    pub fn stage(&self, stage: ExecutionStage) -> StageSnapshot {
        let snapshot = self.snapshot();
        snapshot.stages[stage.index()].clone()
    }
}
