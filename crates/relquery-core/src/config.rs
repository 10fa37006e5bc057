//! Engine configuration: serde-backed defaults, JSON loading and `RELQUERY_*`
//! environment overrides.

use serde::Deserialize;

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::{QueryMode, ReturnMode};
use crate::query::guards::{
    clamp_depth, clamp_limit, clamp_threshold, DEFAULT_RESULT_LIMIT, DEFAULT_SIMPLE_LIMIT,
    DEFAULT_TRAVERSAL_DEPTH, DEFAULT_VECTOR_LIMIT, MAX_PLANNER_RETRIES, MAX_RESULT_LIMIT,
    METADATA_SCAN_CAP,
};

/// Which validation rules apply to a plan before execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationMode {
    /// Every relationship hop must name a registered relationship.
    #[default]
    Strict,
    /// Hops may omit or use unregistered relationship names.
    Lax,
}

impl ValidationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationMode::Strict => "STRICT",
            ValidationMode::Lax => "LAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl RegionConfig {
    pub fn new(ttl_seconds: u64, max_entries: usize) -> Self {
        Self {
            ttl_seconds,
            max_entries,
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self::new(3600, 10_000)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub plan: RegionConfig,
    pub embedding: RegionConfig,
    pub result: RegionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plan: RegionConfig::new(3600, 10_000),
            embedding: RegionConfig::new(86_400, 50_000),
            result: RegionConfig::new(1800, 5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Additional oracle attempts after the first one.
    pub max_retries: u32,
    pub normalization_enabled: bool,
    pub log_plans: bool,
    /// Date attribute targeted by the `Qn YYYY` heuristic; disabled when unset.
    pub quarter_date_field: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            normalization_enabled: true,
            log_plans: false,
            quarter_date_field: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub plan_latency_warn_ms: u64,
    pub execution_latency_warn_ms: u64,
    pub fallback_rate_alert: f64,
    pub alert_min_samples: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plan_latency_warn_ms: 2000,
            execution_latency_warn_ms: 1000,
            fallback_rate_alert: 0.5,
            alert_min_samples: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub enable_query_validation: bool,
    pub validation_mode: ValidationMode,
    pub fallback_to_metadata: bool,
    pub fallback_to_vector_search: bool,
    pub fallback_to_simple_search: bool,
    pub enable_vector_search: bool,
    pub vector_intersect_metadata: bool,
    pub max_traversal_depth: usize,
    pub default_similarity_threshold: f64,
    pub default_return_mode: ReturnMode,
    pub default_query_mode: QueryMode,
    pub default_limit: usize,
    pub vector_default_limit: usize,
    pub simple_default_limit: usize,
    /// Rows the metadata tier reads per request.
    pub metadata_scan_cap: usize,
    pub planner: PlannerConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_query_validation: true,
            validation_mode: ValidationMode::Strict,
            fallback_to_metadata: true,
            fallback_to_vector_search: true,
            fallback_to_simple_search: true,
            enable_vector_search: true,
            vector_intersect_metadata: false,
            max_traversal_depth: DEFAULT_TRAVERSAL_DEPTH,
            default_similarity_threshold: 0.7,
            default_return_mode: ReturnMode::Ids,
            default_query_mode: QueryMode::Standalone,
            default_limit: DEFAULT_RESULT_LIMIT,
            vector_default_limit: DEFAULT_VECTOR_LIMIT,
            simple_default_limit: DEFAULT_SIMPLE_LIMIT,
            metadata_scan_cap: METADATA_SCAN_CAP,
            planner: PlannerConfig::default(),
            cache: CacheConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> RelQueryResult<Self> {
        let config: EngineConfig = serde_json::from_str(raw)
            .map_err(|e| RelQueryError::Config(format!("invalid engine config: {e}")))?;
        Ok(config.sanitized())
    }

    /// Defaults overlaid with `RELQUERY_*` environment variables.
    pub fn from_env() -> RelQueryResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config.sanitized())
    }

    /// Clamp numeric settings into their guard ranges.
    pub fn sanitized(mut self) -> Self {
        self.max_traversal_depth = clamp_depth(self.max_traversal_depth);
        self.default_similarity_threshold = clamp_threshold(self.default_similarity_threshold);
        self.default_limit = clamp_limit(self.default_limit, MAX_RESULT_LIMIT);
        self.vector_default_limit = clamp_limit(self.vector_default_limit, MAX_RESULT_LIMIT);
        self.simple_default_limit = clamp_limit(self.simple_default_limit, MAX_RESULT_LIMIT);
        self.metadata_scan_cap = clamp_limit(self.metadata_scan_cap, METADATA_SCAN_CAP);
        self.planner.max_retries = self.planner.max_retries.min(MAX_PLANNER_RETRIES);
        for region in [
            &mut self.cache.plan,
            &mut self.cache.embedding,
            &mut self.cache.result,
        ] {
            region.max_entries = region.max_entries.max(1);
        }
        self.metrics.fallback_rate_alert = clamp_threshold(self.metrics.fallback_rate_alert);
        self
    }

    fn apply_env<F>(&mut self, lookup: F) -> RelQueryResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str, current: bool| match lookup(key) {
            Some(val) => parse_flag(&val, current),
            None => current,
        };
        self.enable_query_validation =
            flag("RELQUERY_QUERY_VALIDATION", self.enable_query_validation);
        self.fallback_to_metadata = flag("RELQUERY_FALLBACK_METADATA", self.fallback_to_metadata);
        self.fallback_to_vector_search =
            flag("RELQUERY_FALLBACK_VECTOR", self.fallback_to_vector_search);
        self.fallback_to_simple_search =
            flag("RELQUERY_FALLBACK_SIMPLE", self.fallback_to_simple_search);
        self.enable_vector_search = flag("RELQUERY_VECTOR_SEARCH", self.enable_vector_search);
        self.cache.enabled = flag("RELQUERY_CACHE", self.cache.enabled);
        self.metrics.enabled = flag("RELQUERY_METRICS", self.metrics.enabled);
        self.planner.log_plans = flag("RELQUERY_LOG_PLANS", self.planner.log_plans);

        if let Some(mode) = lookup("RELQUERY_VALIDATION_MODE") {
            self.validation_mode = match mode.trim().to_uppercase().as_str() {
                "STRICT" => ValidationMode::Strict,
                "LAX" => ValidationMode::Lax,
                other => {
                    return Err(RelQueryError::Config(format!(
                        "RELQUERY_VALIDATION_MODE must be STRICT or LAX, got '{other}'"
                    )))
                }
            };
        }
        if let Some(depth) = lookup("RELQUERY_MAX_TRAVERSAL_DEPTH") {
            self.max_traversal_depth = parse_number(&depth, "RELQUERY_MAX_TRAVERSAL_DEPTH")?;
        }
        if let Some(threshold) = lookup("RELQUERY_SIMILARITY_THRESHOLD") {
            self.default_similarity_threshold = threshold.trim().parse::<f64>().map_err(|_| {
                RelQueryError::Config(format!(
                    "RELQUERY_SIMILARITY_THRESHOLD is not a number: '{threshold}'"
                ))
            })?;
        }
        if let Some(limit) = lookup("RELQUERY_DEFAULT_LIMIT") {
            self.default_limit = parse_number(&limit, "RELQUERY_DEFAULT_LIMIT")?;
        }
        if let Some(cap) = lookup("RELQUERY_METADATA_SCAN_CAP") {
            self.metadata_scan_cap = parse_number(&cap, "RELQUERY_METADATA_SCAN_CAP")?;
        }
        if let Some(retries) = lookup("RELQUERY_PLANNER_RETRIES") {
            self.planner.max_retries = parse_number(&retries, "RELQUERY_PLANNER_RETRIES")?;
        }
        if let Some(field) = lookup("RELQUERY_QUARTER_DATE_FIELD") {
            let field = field.trim();
            self.planner.quarter_date_field = (!field.is_empty()).then(|| field.to_string());
        }
        Ok(())
    }
}

/// Off-values are "0/false/no/off", on-values "1/true/yes/on"; anything else
/// keeps the current setting.
fn parse_flag(raw: &str, current: bool) -> bool {
    let v = raw.trim().to_lowercase();
    match v.as_str() {
        "0" | "false" | "no" | "off" => false,
        "1" | "true" | "yes" | "on" => true,
        _ => current,
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, key: &str) -> RelQueryResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| RelQueryError::Config(format!("{key} is not a valid number: '{raw}'")))
}
