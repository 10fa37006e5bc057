//! Shared guardrails for query payload bounds and traversal limits.

// Core query guards
pub const MAX_QUERY_LENGTH: usize = 2048;
pub const DEFAULT_RESULT_LIMIT: usize = 50;
pub const MAX_RESULT_LIMIT: usize = 500;
pub const MIN_TRAVERSAL_DEPTH: usize = 1;
pub const MAX_TRAVERSAL_DEPTH: usize = 5;
pub const DEFAULT_TRAVERSAL_DEPTH: usize = 3;
pub const MAX_RELATIONSHIP_PATHS: usize = 16;
pub const MAX_FILTERS_PER_PLAN: usize = 64;
pub const MAX_IN_LIST_VALUES: usize = 256;

// Fallback tier guards
pub const METADATA_SCAN_CAP: usize = 10_000;
pub const KEYWORD_CANDIDATE_CAP: usize = 2_000;
pub const DEFAULT_VECTOR_LIMIT: usize = 25;
pub const DEFAULT_SIMPLE_LIMIT: usize = 20;

// Planner and cache guards
pub const MAX_PLANNER_RETRIES: u32 = 5;
pub const EAGER_SWEEP_BATCH: usize = 32;
pub const MAX_FEEDBACK_LENGTH: usize = 1024;

pub fn clamp_usize(value: usize, minimum: usize, maximum: usize) -> usize {
    value.max(minimum).min(maximum)
}

pub fn clamp_depth(value: usize) -> usize {
    clamp_usize(value, MIN_TRAVERSAL_DEPTH, MAX_TRAVERSAL_DEPTH)
}

pub fn clamp_limit(value: usize, maximum: usize) -> usize {
    clamp_usize(value, 1, maximum.max(1))
}

pub fn clamp_threshold(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Trim and cut to [`MAX_QUERY_LENGTH`] bytes on a char boundary.
pub fn truncate_query(query: &str) -> String {
    truncate_to(query.trim(), MAX_QUERY_LENGTH)
}

pub fn truncate_to(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
