//! `_relquery_core` extension module: the query service with Python callables
//! standing in for the planning oracle and the vector collaborators.

use std::sync::Arc;
use std::time::Instant;

use pyo3::prelude::*;

use crate::config::EngineConfig;
use crate::errors::{ErrorContext, RelQueryError, RelQueryResult};
use crate::models::QueryOptions;
use crate::query::planner::{PlanningOracle, PlanningRequest};
use crate::query::service::ReliableQueryService;
use crate::query::vector::{EmbeddingService, VectorHit, VectorSearch};
use crate::schema::SchemaRegistry;
use crate::store::SqliteEntityStore;

// ---------------------------------------------------------------------------
// Callable adapters
// ---------------------------------------------------------------------------

/// `oracle(query: str, schema_context: str, feedback: list[str]) -> str`
struct PyPlanningOracle {
    callable: PyObject,
}

impl PlanningOracle for PyPlanningOracle {
    fn plan(&self, request: &PlanningRequest<'_>) -> RelQueryResult<String> {
        let context = serde_json::to_string(request.schema_context)?;
        Python::with_gil(|py| {
            self.callable
                .call1(py, (request.query, context, request.feedback.to_vec()))
                .and_then(|reply| reply.extract::<String>(py))
        })
        .map_err(|e| {
            RelQueryError::QueryPlanning(ErrorContext::new("PLANNING", request.query).with_reason(e.to_string()))
        })
    }
}

/// `embedder(text: str) -> list[float]`
struct PyEmbeddingService {
    callable: PyObject,
}

impl EmbeddingService for PyEmbeddingService {
    fn embed(&self, text: &str, _deadline: Option<Instant>) -> RelQueryResult<Vec<f32>> {
        Python::with_gil(|py| {
            self.callable
                .call1(py, (text,))
                .and_then(|vector| vector.extract::<Vec<f32>>(py))
        })
        .map_err(|e| RelQueryError::VectorSearch(ErrorContext::new("EMBEDDING", text).with_reason(e.to_string())))
    }
}

/// `vector_search(vector, entity_type, limit, threshold) -> list[tuple[str, float]]`
struct PyVectorSearch {
    callable: PyObject,
}

impl VectorSearch for PyVectorSearch {
    fn search(
        &self,
        vector: &[f32],
        entity_type: &str,
        limit: usize,
        threshold: f64,
        _deadline: Option<Instant>,
    ) -> RelQueryResult<Vec<VectorHit>> {
        let hits = Python::with_gil(|py| {
            self.callable
                .call1(py, (vector.to_vec(), entity_type, limit, threshold))
                .and_then(|hits| hits.extract::<Vec<(String, f64)>>(py))
        })
        .map_err(|e| {
            RelQueryError::VectorSearch(ErrorContext::new("FALLBACK_VECTOR", entity_type).with_reason(e.to_string()))
        })?;
        Ok(hits.into_iter().map(|(id, score)| VectorHit { id, score }).collect())
    }
}

// ---------------------------------------------------------------------------
// QueryService
// ---------------------------------------------------------------------------

#[pyclass]
pub struct QueryService {
    inner: Arc<ReliableQueryService>,
}

#[pymethods]
impl QueryService {
    #[new]
    #[pyo3(signature = (db_path, schema_json, oracle, embedder=None, vector_search=None, config_json=None))]
    fn new(
        db_path: std::path::PathBuf,
        schema_json: &str,
        oracle: PyObject,
        embedder: Option<PyObject>,
        vector_search: Option<PyObject>,
        config_json: Option<&str>,
    ) -> PyResult<Self> {
        let config = match config_json {
            Some(raw) => EngineConfig::from_json_str(raw)?,
            None => EngineConfig::from_env()?,
        };
        let registry = Arc::new(SchemaRegistry::from_json_str(schema_json)?);
        let store = Arc::new(SqliteEntityStore::open(db_path)?);
        let mut service =
            ReliableQueryService::new(registry, store, Arc::new(PyPlanningOracle { callable: oracle }), config);
        if let (Some(embedder), Some(search)) = (embedder, vector_search) {
            service = service.with_vector_search(
                Arc::new(PyEmbeddingService { callable: embedder }),
                Arc::new(PyVectorSearch { callable: search }),
            );
        }
        Ok(Self {
            inner: Arc::new(service),
        })
    }

    /// Answer `text`; returns the response as a dict.
    #[pyo3(signature = (text, options=None))]
    fn query(&self, py: Python<'_>, text: &str, options: Option<&str>) -> PyResult<PyObject> {
        let options: QueryOptions = match options {
            Some(raw) => serde_json::from_str(raw).map_err(RelQueryError::from)?,
            None => QueryOptions::default(),
        };
        let service = Arc::clone(&self.inner);
        let owned = text.to_string();
        let response = py.allow_threads(move || service.query(&owned, &options))?;
        let body = serde_json::to_string(&response).map_err(RelQueryError::from)?;
        to_python(py, &body)
    }

    fn metrics(&self, py: Python<'_>) -> PyResult<PyObject> {
        let body = serde_json::to_string(&self.inner.metrics()).map_err(RelQueryError::from)?;
        to_python(py, &body)
    }

    fn clear_cache(&self) {
        self.inner.cache().clear_all();
    }
}

fn to_python(py: Python<'_>, body: &str) -> PyResult<PyObject> {
    let json = py.import("json")?;
    Ok(json.call_method1("loads", (body,))?.unbind())
}

#[pymodule]
fn _relquery_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<QueryService>()?;
    m.add("MAX_QUERY_LENGTH", crate::query::guards::MAX_QUERY_LENGTH)?;
    m.add("MAX_RESULT_LIMIT", crate::query::guards::MAX_RESULT_LIMIT)?;
    Ok(())
}
