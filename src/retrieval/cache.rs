// src/retrieval/cache.rs
// TTL + capacity bounded cache for retrieval results. Expired entries are
// kept around until eviction so a hard retrieval failure can still serve
// the last known-good result.

use crate::retrieval::types::{RetrievalOptions, RetrievedContextItem};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Entries older than this are no longer fresh.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Hard cap on cached entries.
pub const CACHE_MAX_ENTRIES: usize = 1_000;

/// Fraction of oldest entries dropped when the cap is exceeded.
const EVICT_FRACTION: f64 = 0.3;

struct CacheEntry {
    items: Vec<RetrievedContextItem>,
    inserted_at: Instant,
}

/// Cache key over everything that affects the result. Target paths are
/// sorted so path order does not fragment the cache.
pub fn cache_key(agent_id: &str, prompt: &str, options: &RetrievalOptions) -> String {
    let mut paths = options.target_file_paths.clone();
    paths.sort();
    let canonical = format!(
        "{agent_id}\x1f{prompt}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}",
        options.top_k_embeddings,
        options.top_k_kg,
        paths.join(","),
        options.embedding_score_threshold,
        options.kg_query_depth,
        options.use_hybrid,
        options.enable_reranking,
        options.max_context_length,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

pub struct ContextCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_MAX_ENTRIES)
    }
}

impl ContextCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Fresh hit within TTL, or nothing.
    pub async fn get(&self, key: &str) -> Option<Vec<RetrievedContextItem>> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.items.clone())
    }

    /// Any hit, fresh or stale. Used only as a fallback on hard failure.
    pub async fn get_stale(&self, key: &str) -> Option<Vec<RetrievedContextItem>> {
        let entries = self.entries.lock().await;
        entries.get(key).map(|e| e.items.clone())
    }

    /// Insert always succeeds; over capacity the oldest 30% are dropped.
    pub async fn insert(&self, key: String, items: Vec<RetrievedContextItem>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                items,
                inserted_at: Instant::now(),
            },
        );
        if entries.len() > self.max_entries {
            let evict_count = ((entries.len() as f64) * EVICT_FRACTION).ceil() as usize;
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.inserted_at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (key, _) in by_age.into_iter().take(evict_count) {
                entries.remove(&key);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::types::ContextItemType;

    fn items(tag: &str) -> Vec<RetrievedContextItem> {
        vec![RetrievedContextItem::new(
            ContextItemType::FileSnippet,
            format!("src/{tag}.rs"),
            tag,
            0.8,
        )]
    }

    #[tokio::test]
    async fn test_fresh_hit_returns_identical_items() {
        let cache = ContextCache::default();
        cache.insert("k".into(), items("a")).await;
        let first = cache.get("k").await.expect("hit");
        let second = cache.get("k").await.expect("hit");
        assert_eq!(first, second);
        assert_eq!(first, items("a"));
    }

    #[tokio::test]
    async fn test_miss_on_unknown_key() {
        let cache = ContextCache::default();
        assert!(cache.get("nope").await.is_none());
        assert!(cache.get_stale("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_only_served_stale() {
        let cache = ContextCache::new(Duration::from_millis(0), 10);
        cache.insert("k".into(), items("a")).await;
        // TTL of zero: immediately stale
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.get_stale("k").await, Some(items("a")));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_third() {
        let cache = ContextCache::new(CACHE_TTL, 10);
        for i in 0..11 {
            cache.insert(format!("k{i}"), items(&format!("t{i}"))).await;
            // Distinct insertion timestamps keep the age ordering unambiguous
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // 11 entries > 10: ceil(11 * 0.3) = 4 oldest evicted
        assert_eq!(cache.len().await, 7);
        assert!(cache.get("k0").await.is_none());
        assert!(cache.get("k10").await.is_some());
    }

    #[test]
    fn test_cache_key_sorts_target_paths() {
        let a = RetrievalOptions {
            target_file_paths: vec!["src/b.rs".into(), "src/a.rs".into()],
            ..Default::default()
        };
        let b = RetrievalOptions {
            target_file_paths: vec!["src/a.rs".into(), "src/b.rs".into()],
            ..Default::default()
        };
        assert_eq!(cache_key("agent", "q", &a), cache_key("agent", "q", &b));
    }

    #[test]
    fn test_cache_key_depends_on_options() {
        let base = RetrievalOptions::default();
        let other = RetrievalOptions {
            top_k_kg: 9,
            ..Default::default()
        };
        assert_ne!(cache_key("agent", "q", &base), cache_key("agent", "q", &other));
        assert_ne!(cache_key("agent", "q", &base), cache_key("agent2", "q", &base));
        assert_ne!(cache_key("agent", "q", &base), cache_key("agent", "q2", &base));
    }
}
