use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// TTL cache for expensive analytics results.
///
/// The cache has its own lock, so analytics traffic never contends with
/// store writers. Expired entries are treated as absent and dropped on the
/// next write.
pub struct PatternCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> PatternCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh cached value for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub async fn put(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop one entry. Returns whether it was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of stored entries, including expired ones not yet dropped.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = PatternCache::new(Duration::from_secs(60));
        cache.put("patterns:all", vec![1, 2, 3]).await;

        assert_eq!(cache.get("patterns:all").await, Some(vec![1, 2, 3]));
        assert_eq!(cache.get("patterns:other").await, None);
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = PatternCache::new(Duration::ZERO);
        tokio_test::block_on(async {
            cache.put("k", 1u32).await;
            assert_eq!(cache.get("k").await, None);
        });
    }

    #[tokio::test]
    async fn test_put_drops_expired_entries() {
        let cache = PatternCache::new(Duration::ZERO);
        cache.put("a", 1u32).await;
        cache.put("b", 2u32).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = PatternCache::new(Duration::from_secs(60));
        cache.put("a", "x".to_string()).await;
        cache.put("b", "y".to_string()).await;

        assert!(cache.invalidate("a").await);
        assert!(!cache.invalidate("a").await);
        assert_eq!(cache.get("b").await.as_deref(), Some("y"));

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
