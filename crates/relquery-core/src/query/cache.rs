//! TTL-bounded cache regions for plans, embeddings and result sets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::{CacheConfig, RegionConfig};
use crate::models::{content_hash, normalize_query_text, RelationshipQueryPlan};
use crate::query::guards::EAGER_SWEEP_BATCH;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One cache region: its own map, insertion-order eviction queue and counters.
///
/// Expiry is checked lazily on `get`; every `put` additionally sweeps up to
/// [`EAGER_SWEEP_BATCH`] of the oldest entries before enforcing `max_entries`
/// by evicting oldest-inserted-first.
pub struct CacheRegion<V> {
    name: &'static str,
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<IndexMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> CacheRegion<V> {
    pub fn new(name: &'static str, ttl: Duration, max_entries: usize) -> Self {
        Self {
            name,
            enabled: true,
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_config(name: &'static str, config: &RegionConfig, enabled: bool) -> Self {
        let mut region = Self::new(name, Duration::from_secs(config.ttl_seconds), config.max_entries);
        region.enabled = enabled;
        region
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let found = match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.shift_remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        if !self.enabled {
            return;
        }
        let key = key.into();
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let expired: Vec<String> = entries
            .iter()
            .take(EAGER_SWEEP_BATCH)
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for stale in expired {
            entries.shift_remove(&stale);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        // A rewrite counts as a fresh insertion.
        entries.shift_remove(&key);
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
        while entries.len() > self.max_entries {
            entries.shift_remove_index(0);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.lock().shift_remove(key).is_some();
        if removed {
            debug!(region = self.name, "cache entry invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine cache: three independent regions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueryCacheStats {
    pub plan: CacheStats,
    pub embedding: CacheStats,
    pub result: CacheStats,
}

pub struct QueryCache {
    pub plans: CacheRegion<RelationshipQueryPlan>,
    pub embeddings: CacheRegion<Arc<Vec<f32>>>,
    pub results: CacheRegion<Arc<Vec<String>>>,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            plans: CacheRegion::from_config("plan", &config.plan, config.enabled),
            embeddings: CacheRegion::from_config("embedding", &config.embedding, config.enabled),
            results: CacheRegion::from_config("result", &config.result, config.enabled),
        }
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            plan: self.plans.stats(),
            embedding: self.embeddings.stats(),
            result: self.results.stats(),
        }
    }

    pub fn clear_all(&self) {
        self.plans.clear();
        self.embeddings.clear();
        self.results.clear();
    }
}

/// Plan key: hash of the normalized text plus the sorted entity-type hints.
pub fn plan_cache_key(query: &str, entity_hints: &[String]) -> String {
    let mut hints: Vec<String> = entity_hints
        .iter()
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
        .collect();
    hints.sort();
    hints.dedup();
    let normalized = normalize_query_text(query);
    if hints.is_empty() {
        content_hash(&normalized)
    } else {
        content_hash(&format!("{normalized}|types={}", hints.join(",")))
    }
}

pub fn embedding_cache_key(text: &str) -> String {
    content_hash(&normalize_query_text(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_bound_holds() {
        let region: CacheRegion<u32> = CacheRegion::new("t", Duration::from_secs(60), 10);
        for i in 0..25u32 {
            region.put(format!("k{i}"), i);
        }
        let stats = region.stats();
        assert!(stats.size <= 10);
        assert_eq!(stats.evictions, 15);
        assert!(region.get("k0").is_none());
        assert_eq!(region.get("k24"), Some(24));
    }

    #[test]
    fn eviction_is_oldest_inserted_first() {
        let region: CacheRegion<u32> = CacheRegion::new("t", Duration::from_secs(60), 2);
        region.put("a", 1);
        region.put("b", 2);
        assert_eq!(region.get("a"), Some(1));
        region.put("c", 3);
        assert!(region.get("a").is_none());
        assert_eq!(region.get("b"), Some(2));
        assert_eq!(region.get("c"), Some(3));
    }

    #[test]
    fn expired_entries_miss_and_are_swept() {
        let region: CacheRegion<u32> = CacheRegion::new("t", Duration::from_millis(20), 100);
        region.put("a", 1);
        region.put("b", 2);
        std::thread::sleep(Duration::from_millis(40));
        assert!(region.get("a").is_none());
        region.put("c", 3);
        let stats = region.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn invalidate_clear_and_counters() {
        let region: CacheRegion<&'static str> = CacheRegion::new("t", Duration::from_secs(60), 4);
        region.put("x", "one");
        assert_eq!(region.get("x"), Some("one"));
        assert!(region.get("y").is_none());
        assert!(region.invalidate("x"));
        assert!(!region.invalidate("x"));
        region.put("z", "two");
        region.clear();
        let stats = region.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 0));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn disabled_region_never_stores() {
        let config = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let cache = QueryCache::new(&config);
        cache.results.put("k", Arc::new(vec!["1".to_string()]));
        assert!(cache.results.get("k").is_none());
        assert_eq!(cache.stats().result.size, 0);
    }

    #[test]
    fn concurrent_writers_respect_bound() {
        let region: Arc<CacheRegion<usize>> =
            Arc::new(CacheRegion::new("t", Duration::from_secs(60), 50));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let region = Arc::clone(&region);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        region.put(format!("{t}-{i}"), i);
                        let _ = region.get(&format!("{t}-{}", i / 2));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(region.stats().size <= 50);
    }

    #[test]
    fn plan_keys_ignore_formatting_and_hint_order() {
        let a = plan_cache_key("Find  Contracts", &["user".into(), "document".into()]);
        let b = plan_cache_key("find contracts ", &["Document".into(), "user".into()]);
        assert_eq!(a, b);
        assert_ne!(a, plan_cache_key("find contracts", &[]));
        assert_eq!(embedding_cache_key("A  b"), embedding_cache_key("a b"));
    }
}
