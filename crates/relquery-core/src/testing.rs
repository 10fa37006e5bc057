//! Shared fixtures for unit tests: a small document/product schema, a seeded
//! SQLite store and scripted collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use crate::errors::{ErrorContext, RelQueryError, RelQueryResult};
use crate::models::{
    FilterCondition, FilterOperator, FilterValue, RelationshipDirection, RelationshipPath, RelationshipQueryPlan,
    StoredEntity,
};
use crate::query::builder::StructuredQuery;
use crate::query::planner::{PlanningOracle, PlanningRequest};
use crate::query::vector::{EmbeddingService, VectorHit, VectorSearch};
use crate::schema::SchemaRegistry;
use crate::store::{EntityStore, SqliteEntityStore};

// ---------------------------------------------------------------------------
// Schema and plans
// ---------------------------------------------------------------------------

pub fn seeded_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    for (entity_type, concrete) in [
        ("document", "Document"),
        ("user", "User"),
        ("team", "Team"),
        ("product", "Product"),
        ("brand", "Brand"),
    ] {
        registry.register_entity_type(entity_type, concrete).unwrap();
    }
    registry
        .register_relationship("document", "user", "author", RelationshipDirection::Forward, false)
        .unwrap();
    registry
        .register_relationship("user", "team", "team", RelationshipDirection::Bidirectional, true)
        .unwrap();
    registry
        .register_relationship("product", "brand", "brand", RelationshipDirection::Forward, false)
        .unwrap();
    Arc::new(registry)
}

/// "Find all contracts related to John Smith in Q4 2023"
pub fn document_plan() -> RelationshipQueryPlan {
    let mut plan = RelationshipQueryPlan::new("Find all contracts related to John Smith in Q4 2023", "document");
    plan.candidate_entity_types.insert("user".into());
    plan.relationship_paths.push(RelationshipPath {
        from_entity_type: "document".into(),
        relationship_type: Some("author".into()),
        to_entity_type: "user".into(),
        direction: RelationshipDirection::Forward,
        optional: false,
        conditions: vec![FilterCondition::new(
            "fullName",
            FilterOperator::Ilike,
            FilterValue::Text("%John Smith%".into()),
        )],
    });
    plan.direct_filters.insert(
        "document".into(),
        vec![
            FilterCondition::new("status", FilterOperator::Equals, FilterValue::Text("ACTIVE".into())),
            FilterCondition::new("title", FilterOperator::Ilike, FilterValue::Text("%Q4 2023%".into())),
        ],
    );
    plan.limit = 5;
    plan
}

/// "Show me blue shoes under $100 from Nike"
pub fn product_plan() -> RelationshipQueryPlan {
    let mut plan = RelationshipQueryPlan::new("Show me blue shoes under $100 from Nike", "product");
    plan.candidate_entity_types.insert("brand".into());
    plan.relationship_paths.push(RelationshipPath {
        from_entity_type: "product".into(),
        relationship_type: Some("brand".into()),
        to_entity_type: "brand".into(),
        direction: RelationshipDirection::Forward,
        optional: false,
        conditions: vec![FilterCondition::new(
            "name",
            FilterOperator::Ilike,
            FilterValue::Text("%Nike%".into()),
        )],
    });
    plan.direct_filters.insert(
        "product".into(),
        vec![
            FilterCondition::new("color", FilterOperator::Ilike, FilterValue::Text("blue".into())),
            FilterCondition::new("price", FilterOperator::LessThanOrEqual, FilterValue::Integer(100)),
        ],
    );
    plan
}

/// What a chatty model typically sends back: prose around a JSON block.
pub fn oracle_reply(plan: &RelationshipQueryPlan) -> String {
    let body = serde_json::to_string_pretty(plan).unwrap();
    format!("Sure! Here is the plan for that question:\n```json\n{body}\n```\nLet me know if you need more.")
}

// ---------------------------------------------------------------------------
// Seeded store
// ---------------------------------------------------------------------------

pub fn seeded_store() -> (TempDir, SqliteEntityStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteEntityStore::open(dir.path().join("entities.db")).unwrap();

    let users = [("user-1", "John Smith", Some("Legal")), ("user-2", "Jane Doe", None)];
    for (id, full_name, team) in users {
        let attrs = json!({"fullName": full_name});
        let mut meta = json!({"fullName": full_name});
        if let Some(team) = team {
            meta["team"] = json!({"name": team});
        }
        store
            .put_entity("user", id, &attrs, Some(&meta), Some(full_name))
            .unwrap();
    }
    store
        .put_entity("team", "team-1", &json!({"name": "Legal"}), None, Some("Legal"))
        .unwrap();
    for (id, name) in [("brand-1", "Nike"), ("brand-2", "Adidas")] {
        store
            .put_entity("brand", id, &json!({"name": name}), Some(&json!({"name": name})), Some(name))
            .unwrap();
    }

    let documents = [
        ("doc-1", "Contract renewal Q4 2023", "ACTIVE", Some("user-1"), "Contract renewal Q4 2023 for Acme, authored by John Smith"),
        ("doc-2", "Q4 2023 services contract", "ACTIVE", Some("user-1"), "Q4 2023 services contract signed by John Smith"),
        ("doc-3", "Product roadmap Q4 2023", "DRAFT", Some("user-1"), "Product roadmap Q4 2023 draft"),
        ("doc-4", "NDA Q4 2023", "ACTIVE", Some("user-2"), "NDA Q4 2023 with Jane Doe"),
        ("doc-5", "Contract Q3 2023", "ACTIVE", Some("user-1"), "Contract Q3 2023 renewal by John Smith"),
        ("doc-6", "Meeting notes", "ACTIVE", None, "Meeting notes from the weekly sync"),
    ];
    for (id, title, status, author, content) in documents {
        let attrs = json!({"title": title, "status": status});
        let mut meta = json!({"title": title, "status": status});
        match author {
            Some("user-1") => {
                meta["author"] = json!({"id": "user-1", "fullName": "John Smith", "team": {"name": "Legal"}});
            }
            Some(other) => meta["author"] = json!({"id": other, "fullName": "Jane Doe"}),
            None => {}
        }
        store
            .put_entity("document", id, &attrs, Some(&meta), Some(content))
            .unwrap();
    }

    let products = [
        ("prod-1", "Blue", 95, "brand-1", "Nike"),
        ("prod-2", "Blue", 120, "brand-1", "Nike"),
        ("prod-3", "Red", 80, "brand-1", "Nike"),
        ("prod-4", "blue", 60, "brand-2", "Adidas"),
    ];
    for (id, color, price, brand_id, brand_name) in products {
        let attrs = json!({"color": color, "price": price});
        let meta = json!({"color": color, "price": price, "brand": {"id": brand_id, "name": brand_name}});
        let content = format!("{color} running shoes by {brand_name}");
        store
            .put_entity("product", id, &attrs, Some(&meta), Some(&content))
            .unwrap();
    }

    for (doc, _, _, author, _) in documents {
        if let Some(user) = author {
            store.link("document", doc, "author", "user", user).unwrap();
        }
    }
    store.link("user", "user-1", "team", "team", "team-1").unwrap();
    for (id, _, _, brand_id, _) in products {
        store.link("product", id, "brand", "brand", brand_id).unwrap();
    }
    (dir, store)
}

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Planning oracle that replays canned replies; the last one repeats.
pub struct ScriptedOracle {
    replies: Vec<String>,
    failure: Option<String>,
    calls: AtomicUsize,
    feedback: Mutex<Vec<Vec<String>>>,
}

impl ScriptedOracle {
    pub fn replying(replies: &[&str]) -> Self {
        Self {
            replies: replies.iter().map(|r| r.to_string()).collect(),
            failure: None,
            calls: AtomicUsize::new(0),
            feedback: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::replying(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Feedback handed to each call, in call order.
    pub fn feedback_seen(&self) -> Vec<Vec<String>> {
        self.feedback.lock().clone()
    }
}

impl PlanningOracle for ScriptedOracle {
    fn plan(&self, request: &PlanningRequest<'_>) -> RelQueryResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.feedback.lock().push(request.feedback.to_vec());
        if let Some(message) = &self.failure {
            return Err(RelQueryError::QueryPlanning(
                ErrorContext::new("PLANNING", request.query).with_reason(message.clone()),
            ));
        }
        let index = call.min(self.replies.len().saturating_sub(1));
        Ok(self.replies.get(index).cloned().unwrap_or_default())
    }
}

/// Deterministic three-dimensional embedding derived from the text.
#[derive(Default)]
pub struct StubEmbedder {
    calls: AtomicUsize,
}

impl StubEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingService for StubEmbedder {
    fn embed(&self, text: &str, _deadline: Option<Instant>) -> RelQueryResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let words = text.split_whitespace().count() as f32;
        Ok(vec![text.len() as f32, words, 1.0])
    }
}

pub struct FailingEmbedder;

impl EmbeddingService for FailingEmbedder {
    fn embed(&self, text: &str, _deadline: Option<Instant>) -> RelQueryResult<Vec<f32>> {
        Err(RelQueryError::VectorSearch(
            ErrorContext::new("EMBEDDING", text).with_reason("embedding provider offline"),
        ))
    }
}

/// Returns the same configured hits for every lookup.
/// Fixed hits, best first, cut to the requested limit.
pub struct StubVectorSearch {
    hits: Vec<VectorHit>,
}

impl StubVectorSearch {
    pub fn new(hits: Vec<(&str, f64)>) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|(id, score)| VectorHit {
                    id: id.to_string(),
                    score,
                })
                .collect(),
        }
    }
}

impl VectorSearch for StubVectorSearch {
    fn search(
        &self,
        _vector: &[f32],
        _entity_type: &str,
        limit: usize,
        _threshold: f64,
        _deadline: Option<Instant>,
    ) -> RelQueryResult<Vec<VectorHit>> {
        let mut hits = self.hits.clone();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Entity store that fails the chosen capabilities and delegates the rest
/// to an optional inner store (empty results without one).
pub struct FailingStore {
    message: String,
    structured: bool,
    scans: bool,
    keywords: bool,
    inner: Option<Arc<dyn EntityStore>>,
}

impl FailingStore {
    fn failing(message: &str) -> Self {
        Self {
            message: message.to_string(),
            structured: false,
            scans: false,
            keywords: false,
            inner: None,
        }
    }

    pub fn structured(message: &str) -> Self {
        Self {
            structured: true,
            ..Self::failing(message)
        }
    }

    pub fn scans(message: &str) -> Self {
        Self {
            scans: true,
            ..Self::failing(message)
        }
    }

    pub fn keywords(message: &str) -> Self {
        Self {
            keywords: true,
            ..Self::failing(message)
        }
    }

    pub fn and_keywords(mut self) -> Self {
        self.keywords = true;
        self
    }

    pub fn over(mut self, inner: Arc<dyn EntityStore>) -> Self {
        self.inner = Some(inner);
        self
    }

    fn error(&self) -> RelQueryError {
        RelQueryError::Store(self.message.clone())
    }
}

impl EntityStore for FailingStore {
    fn execute_structured(&self, query: &StructuredQuery) -> RelQueryResult<Vec<String>> {
        match &self.inner {
            _ if self.structured => Err(self.error()),
            Some(inner) => inner.execute_structured(query),
            None => Ok(Vec::new()),
        }
    }

    fn scan_entities(&self, entity_type: &str, cap: usize) -> RelQueryResult<Vec<StoredEntity>> {
        match &self.inner {
            _ if self.scans => Err(self.error()),
            Some(inner) => inner.scan_entities(entity_type, cap),
            None => Ok(Vec::new()),
        }
    }

    fn find_entity(&self, entity_type: &str, entity_id: &str) -> RelQueryResult<Option<StoredEntity>> {
        match &self.inner {
            Some(inner) => inner.find_entity(entity_type, entity_id),
            None => Ok(None),
        }
    }

    fn keyword_candidates(
        &self,
        entity_type: &str,
        terms: &[String],
        cap: usize,
    ) -> RelQueryResult<Vec<StoredEntity>> {
        match &self.inner {
            _ if self.keywords => Err(self.error()),
            Some(inner) => inner.keyword_candidates(entity_type, terms, cap),
            None => Ok(Vec::new()),
        }
    }
}
