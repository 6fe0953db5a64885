//! ABOUTME: In-memory caching layer for frequently accessed entities
//! ABOUTME: Provides a bounded LRU cache with TTL support behind an RwLock

use linked_hash_map::LinkedHashMap;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cache entry with TTL support
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Bounded LRU cache with TTL, safe for shared use.
///
/// Used for template resolution (1-hour TTL) and preference lookups
/// (30-minute TTL); both are read-mostly with atomic entry replacement.
#[derive(Debug)]
pub struct TtlLruCache<T: Clone> {
    inner: RwLock<LruInner<T>>,
}

#[derive(Debug)]
struct LruInner<T: Clone> {
    data: HashMap<String, CacheEntry<T>>,
    access_order: LinkedHashMap<String, ()>,
    max_size: usize,
    ttl: Duration,
}

impl<T: Clone> TtlLruCache<T> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(LruInner {
                data: HashMap::new(),
                access_order: LinkedHashMap::new(),
                max_size,
                ttl,
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        match self.inner.write() {
            Ok(mut inner) => inner.get(key),
            Err(e) => {
                warn!("Failed to acquire cache lock: {}", e);
                None
            }
        }
    }

    pub fn put(&self, key: String, value: T) {
        if let Ok(mut inner) = self.inner.write() {
            inner.put(key, value);
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.invalidate(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> LruInner<T> {
    fn get(&mut self, key: &str) -> Option<T> {
        if let Some(entry) = self.data.get(key) {
            if !entry.is_expired() {
                // Move to back (most recently used)
                self.access_order.remove(key);
                self.access_order.insert(key.to_string(), ());
                debug!("Cache hit for key: {}", key);
                return Some(entry.value.clone());
            } else {
                self.data.remove(key);
                self.access_order.remove(key);
                debug!("Cache miss (expired) for key: {}", key);
            }
        } else {
            debug!("Cache miss for key: {}", key);
        }
        None
    }

    fn put(&mut self, key: String, value: T) {
        if self.data.remove(&key).is_some() {
            self.access_order.remove(&key);
        }

        // Evict least recently used if at capacity
        while self.data.len() >= self.max_size {
            if let Some((lru_key, _)) = self.access_order.pop_front() {
                self.data.remove(&lru_key);
                debug!("Evicted LRU key: {}", lru_key);
            } else {
                break;
            }
        }

        let entry = CacheEntry::new(value, self.ttl);
        self.data.insert(key.clone(), entry);
        self.access_order.insert(key, ());
    }

    fn invalidate(&mut self, key: &str) {
        if self.data.remove(key).is_some() {
            self.access_order.remove(key);
            debug!("Invalidated cache key: {}", key);
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.access_order.clear();
        debug!("Cleared cache");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_get_put() {
        let cache: TtlLruCache<String> = TtlLruCache::new(10, Duration::from_secs(60));
        assert!(cache.get("a").is_none());

        cache.put("a".to_string(), "alpha".to_string());
        assert_eq!(cache.get("a"), Some("alpha".to_string()));
    }

    #[test]
    fn test_lru_eviction() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(2, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);

        // Touch "a" so "b" becomes least recently used
        assert_eq!(cache.get("a"), Some(1));
        cache.put("c".to_string(), 3);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(10, Duration::from_millis(10));
        cache.put("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache: TtlLruCache<u32> = TtlLruCache::new(10, Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }
}
