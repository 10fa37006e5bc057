//! Error types for the relationship query engine.

use std::fmt;

use serde::Serialize;

/// Diagnostic context attached to every engine-level failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    pub stage: String,
    pub original_query: String,
    pub primary_entity_type: Option<String>,
    pub candidate_entity_types: Vec<String>,
    pub fallback_used: bool,
    pub reason: String,
}

impl ErrorContext {
    pub fn new(stage: impl Into<String>, original_query: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            original_query: original_query.into(),
            ..Self::default()
        }
    }

    pub fn with_entity(mut self, primary: Option<&str>, candidates: &[String]) -> Self {
        self.primary_entity_type = primary.map(str::to_string);
        self.candidate_entity_types = candidates.to_vec();
        self
    }

    pub fn with_fallback(mut self, fallback_used: bool) -> Self {
        self.fallback_used = fallback_used;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.reason)
    }
}

/// One entry of the fallback chain's history, surfaced on exhaustion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub outcome: String,
    pub detail: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} ({})", self.stage, self.outcome, self.detail)
    }
}

fn join_history(history: &[StageFailure]) -> String {
    history
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level error enum for the relationship query engine.
#[derive(Debug, thiserror::Error)]
pub enum RelQueryError {
    #[error("Query planning failed: {0}")]
    QueryPlanning(ErrorContext),

    #[error("Relationship query validation failed: {0}")]
    Validation(ErrorContext),

    #[error("Query execution failed: {0}")]
    QueryExecution(ErrorContext),

    #[error("Relationship traversal failed: {0}")]
    RelationshipTraversal(ErrorContext),

    #[error("Vector search failed: {0}")]
    VectorSearch(ErrorContext),

    #[error("All fallback strategies failed for query '{}': {}", .query, join_history(.history))]
    FallbackExhausted {
        query: String,
        history: Vec<StageFailure>,
    },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Query build error: {0}")]
    QueryBuild(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelQueryError {
    /// Context for the engine-level variants, `None` for infrastructure errors.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            RelQueryError::QueryPlanning(ctx)
            | RelQueryError::Validation(ctx)
            | RelQueryError::QueryExecution(ctx)
            | RelQueryError::RelationshipTraversal(ctx)
            | RelQueryError::VectorSearch(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Short reason string used in stage histories and metrics.
    pub fn reason(&self) -> String {
        match self.context() {
            Some(ctx) if !ctx.reason.is_empty() => ctx.reason.clone(),
            _ => self.to_string(),
        }
    }
}

#[cfg(feature = "python")]
impl From<RelQueryError> for pyo3::PyErr {
    fn from(err: RelQueryError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyIOError, PyLookupError, PyRuntimeError, PyValueError};
        match &err {
            RelQueryError::Validation(_)
            | RelQueryError::QueryBuild(_)
            | RelQueryError::Config(_)
            | RelQueryError::Json(_) => PyValueError::new_err(err.to_string()),
            RelQueryError::Schema(_) => PyLookupError::new_err(err.to_string()),
            RelQueryError::Io(_) => PyIOError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

pub type RelQueryResult<T> = Result<T, RelQueryError>;
