use super::KvStore;
use crate::core::{Result, VaultError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Access counters of a [`MemoryKvStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// Map-backed store used for the volatile-adjacent tiers and in tests.
pub struct MemoryKvStore {
    name: String,
    entries: RwLock<HashMap<String, Vec<u8>>>,
    capacity_bytes: Option<u64>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryKvStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            capacity_bytes: None,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Limits the total bytes the store accepts; writes beyond it raise a quota error.
    pub fn with_capacity_bytes(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    pub fn stats(&self) -> KvStoreStats {
        KvStoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn entry_size(key: &str, value: &[u8]) -> u64 {
        (key.len() + value.len()) as u64
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(capacity) = self.capacity_bytes {
            let current: u64 = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(k, v)| Self::entry_size(k, v))
                .sum();
            let needed = current + Self::entry_size(key, &value);
            if needed > capacity {
                return Err(VaultError::StorageQuota {
                    tier: self.name.clone(),
                    message: format!("{} bytes needed, capacity {}", needed, capacity),
                });
            }
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = self.entries.read().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }

    async fn size_bytes(&self) -> Result<u64> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| Self::entry_size(k, v))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn quota_is_enforced_per_store() {
        let store = MemoryKvStore::new("small").with_capacity_bytes(16);
        store.set("a", vec![0; 8]).await.unwrap();
        let err = store.set("b", vec![0; 16]).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::StorageQuota);

        // Overwriting a key only counts its new size.
        store.set("a", vec![1; 12]).await.unwrap();
        assert_eq!(store.size_bytes().await.unwrap(), 13);
    }

    #[tokio::test]
    async fn counters_track_access() {
        let store = MemoryKvStore::new("t");
        store.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        store.delete("k").await.unwrap();
        assert_eq!(
            store.stats(),
            KvStoreStats {
                reads: 1,
                writes: 1,
                deletes: 1
            }
        );
        assert!(store.is_empty().await);
    }
}
