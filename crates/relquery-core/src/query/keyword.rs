//! Simple tier: keyword scan over searchable content, no traversal.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::ExecutionStage;
use crate::query::guards::KEYWORD_CANDIDATE_CAP;
use crate::query::traversal::{traversal_context, TraversalExecutor, TraversalRequest};
use crate::store::EntityStore;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9_\-]+").unwrap());

const STOPWORDS: &[&str] = &[
    "a", "all", "an", "and", "any", "are", "by", "find", "for", "from", "get", "give", "in", "is",
    "list", "me", "of", "on", "or", "related", "show", "that", "the", "to", "under", "with",
];

/// Lower-cased tokens of `value`.
pub fn tokens(value: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(value)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Distinct query terms worth searching for, in query order.
pub fn keyword_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    TOKEN_RE
        .find_iter(query)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// 1.0 for a whole-text match, 0.9 when the text contains the query, else
/// the share of query terms present as tokens.
pub fn lexical_score(query: &str, content: &str) -> f64 {
    let q = query.trim().to_lowercase();
    if q.is_empty() {
        return 0.0;
    }
    let c = content.to_lowercase();
    if q == c.trim() {
        return 1.0;
    }
    if c.contains(&q) {
        return 0.9;
    }
    let terms = keyword_terms(query);
    if terms.is_empty() {
        return 0.0;
    }
    let content_tokens = tokens(content);
    let overlap = terms.iter().filter(|t| content_tokens.contains(*t)).count();
    overlap as f64 / terms.len() as f64
}

pub struct KeywordSearchExecutor {
    store: Arc<dyn EntityStore>,
}

impl KeywordSearchExecutor {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

impl TraversalExecutor for KeywordSearchExecutor {
    fn stage(&self) -> ExecutionStage {
        ExecutionStage::FallbackSimple
    }

    fn execute(&self, request: &TraversalRequest<'_>) -> RelQueryResult<Vec<String>> {
        let plan = request.plan;
        let query = plan.semantic_text();
        let terms = keyword_terms(query);
        let candidates = self
            .store
            .keyword_candidates(&plan.primary_entity_type, &terms, KEYWORD_CANDIDATE_CAP)
            .map_err(|e| {
                RelQueryError::QueryExecution(traversal_context(self.stage(), plan, e.to_string()))
            })?;

        if terms.is_empty() {
            return Ok(candidates
                .into_iter()
                .take(request.limit)
                .map(|e| e.entity_id)
                .collect());
        }

        let mut scored: Vec<(f64, String)> = candidates
            .into_iter()
            .map(|e| {
                let score = lexical_score(query, e.searchable_content.as_deref().unwrap_or(""));
                (score, e.entity_id)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();
        // Stable: equal scores keep store order.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(request.limit);
        debug!(terms = terms.len(), results = scored.len(), "keyword search finished");
        Ok(scored.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RelationshipQueryPlan;
    use crate::testing::{seeded_store, FailingStore};

    fn run(store: Arc<dyn EntityStore>, query: &str, limit: usize) -> RelQueryResult<Vec<String>> {
        let plan = RelationshipQueryPlan::new(query, "document");
        KeywordSearchExecutor::new(store).execute(&TraversalRequest {
            plan: &plan,
            query: None,
            limit,
        })
    }

    #[test]
    fn terms_drop_stopwords_and_duplicates() {
        assert_eq!(
            keyword_terms("Find all the NDA contracts for the NDA team"),
            vec!["nda", "contracts", "team"]
        );
        assert!(keyword_terms("show me all").is_empty());
    }

    #[test]
    fn lexical_score_prefers_exact_then_contains_then_overlap() {
        assert_eq!(lexical_score("meeting notes", "Meeting notes"), 1.0);
        assert_eq!(lexical_score("meeting", "Weekly meeting notes"), 0.9);
        assert_eq!(lexical_score("roadmap draft", "Product roadmap Q4"), 0.5);
        assert_eq!(lexical_score("", "anything"), 0.0);
    }

    #[test]
    fn ranks_prefiltered_candidates_by_overlap() {
        let (_dir, store) = seeded_store();
        let ids = run(Arc::new(store), "roadmap NDA", 10).unwrap();
        assert_eq!(ids, vec!["doc-3", "doc-4"]);
    }

    #[test]
    fn no_terms_returns_first_rows() {
        let (_dir, store) = seeded_store();
        let ids = run(Arc::new(store), "show me all", 2).unwrap();
        assert_eq!(ids, vec!["doc-1", "doc-2"]);
    }

    #[test]
    fn store_failure_surfaces_as_error() {
        let err = run(Arc::new(FailingStore::keywords("index offline")), "roadmap", 5).unwrap_err();
        assert!(err.reason().contains("index offline"));
    }
}
