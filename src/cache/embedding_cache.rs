use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

/// Thread-safe LRU cache of text embeddings
///
/// Repeated chat messages and node names are common; caching keeps them from
/// hitting the embeddings API again.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// A poisoned lock only means another thread panicked mid-update of a
    /// cache entry; the map itself is still usable.
    fn lock(&self) -> MutexGuard<'_, LruCache<String, Vec<f32>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.lock().get(text).cloned()
    }

    pub fn put(&self, text: String, embedding: Vec<f32>) {
        self.lock().put(text, embedding);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_put_and_get() {
        let cache = EmbeddingCache::new(10);
        cache.put("Alice".to_string(), vec![1.0, 2.0, 3.0]);
        assert_eq!(cache.get("Alice"), Some(vec![1.0, 2.0, 3.0]));
        assert!(cache.get("Bob").is_none());
    }

    #[test]
    fn test_cache_get_updates_lru() {
        let cache = EmbeddingCache::new(2);
        cache.put("a".to_string(), vec![1.0]);
        cache.put("b".to_string(), vec![2.0]);

        let _ = cache.get("a");
        cache.put("c".to_string(), vec![3.0]);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let cache = EmbeddingCache::new(0);
        cache.put("a".to_string(), vec![1.0]);
        cache.put("b".to_string(), vec![2.0]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_cache_clear() {
        let cache = EmbeddingCache::new(4);
        cache.put("a".to_string(), vec![1.0]);
        cache.clear();
        assert!(cache.is_empty());
    }
}
