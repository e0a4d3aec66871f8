use crate::core::now_ms;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at_ms: Option<i64>,
}

/// Per-context volatile tier holding decoded values.
pub struct VolatileCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl VolatileCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns a live entry; expired entries are evicted on access.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(key) {
            Some(entry) => entry
                .expires_at_ms
                .map(|expires_at| now_ms() >= expires_at)
                .unwrap_or(false),
            None => return None,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: &str, value: Value, expires_at_ms: Option<i64>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at_ms,
                },
            );
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.pop(key);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evicts_least_recently_used() {
        let cache = VolatileCache::new(2);
        cache.put("a", json!(1), None);
        cache.put("b", json!(2), None);
        assert_eq!(cache.get("a"), Some(json!(1)));
        cache.put("c", json!(3), None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = VolatileCache::new(4);
        cache.put("gone", json!("x"), Some(now_ms() - 1));
        cache.put("kept", json!("y"), Some(now_ms() + 60_000));
        assert_eq!(cache.get("gone"), None);
        assert_eq!(cache.get("kept"), Some(json!("y")));
        assert_eq!(cache.len(), 1);
    }
}
