use super::broadcast::{ChangeBus, ChangeEvent};
use super::cache::VolatileCache;
use super::chunking::{ChunkManifest, manifest_key, reassemble, split_into_chunks};
use super::strategy::{WriteFlags, WriteStrategy, check_payload_cap, select_strategy};
use super::{KvStore, MemoryKvStore};
use crate::config::StoragePolicy;
use crate::core::{Result, VaultError, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

pub type SubscriberCallback = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The three persistent tiers behind the volatile cache.
#[derive(Clone)]
pub struct StorageTiers {
    pub ephemeral: Arc<dyn KvStore>,
    pub small: Arc<dyn KvStore>,
    pub large: Arc<dyn KvStore>,
}

impl StorageTiers {
    pub fn in_memory() -> Self {
        Self {
            ephemeral: Arc::new(MemoryKvStore::new("ephemeral")),
            small: Arc::new(MemoryKvStore::new("small")),
            large: Arc::new(MemoryKvStore::new("large")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Returned on a total miss.
    pub default_value: Option<Value>,
    /// Also read the ephemeral tier.
    pub include_ephemeral: bool,
    /// Treat adapter errors as misses instead of propagating them.
    pub fallback: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            default_value: None,
            include_ephemeral: true,
            fallback: true,
        }
    }
}

impl ReadOptions {
    pub fn with_default(default_value: Value) -> Self {
        Self {
            default_value: Some(default_value),
            ..Self::default()
        }
    }

    pub fn strict() -> Self {
        Self {
            fallback: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Ephemeral,
    Small,
    Large,
}

/// Occupancy of every tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub cache_entries: usize,
    pub ephemeral_bytes: u64,
    pub small_bytes: u64,
    pub large_bytes: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralEnvelope {
    value: Value,
    expires_at: Option<i64>,
}

/// Unified get/set/delete over the volatile cache and the persistent tiers.
pub struct StorageFacade {
    context_id: String,
    policy: StoragePolicy,
    cache: VolatileCache,
    tiers: StorageTiers,
    bus: Option<Arc<dyn ChangeBus>>,
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, SubscriberCallback)>>>,
    next_subscription: AtomicU64,
}

impl StorageFacade {
    pub fn new(tiers: StorageTiers, policy: StoragePolicy) -> Self {
        Self {
            context_id: uuid::Uuid::new_v4().to_string(),
            cache: VolatileCache::new(policy.cache_capacity),
            policy,
            tiers,
            bus: None,
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StorageTiers::in_memory(), StoragePolicy::default())
    }

    /// Attaches the cross-context change bus this facade publishes to.
    pub fn with_change_bus(mut self, bus: Arc<dyn ChangeBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    pub fn tiers(&self) -> &StorageTiers {
        &self.tiers
    }

    pub fn small_store(&self) -> Arc<dyn KvStore> {
        self.tiers.small.clone()
    }

    /// Reads through cache, ephemeral, small and large tiers in that order.
    pub async fn get(&self, key: &str, options: &ReadOptions) -> Result<Option<Value>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        let mut tiers_to_read = Vec::with_capacity(3);
        if options.include_ephemeral {
            tiers_to_read.push(Tier::Ephemeral);
        }
        tiers_to_read.push(Tier::Small);
        tiers_to_read.push(Tier::Large);

        for tier in tiers_to_read {
            match self.read_tier(tier, key).await {
                Ok(Some((value, expires_at))) => {
                    event!(Level::DEBUG, key = %key, tier = ?tier, "storage hit, backfilling");
                    if tier == Tier::Large {
                        self.backfill_small(key, &value).await;
                    }
                    self.cache.put(key, value.clone(), expires_at);
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(err) if options.fallback => {
                    event!(
                        Level::WARN,
                        key = %key,
                        tier = ?tier,
                        error = %err,
                        "storage tier read failed, treating as miss"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Ok(options.default_value.clone())
    }

    /// Convenience read with default options.
    pub async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        self.get(key, &ReadOptions::default()).await
    }

    async fn read_tier(&self, tier: Tier, key: &str) -> Result<Option<(Value, Option<i64>)>> {
        match tier {
            Tier::Ephemeral => {
                let Some(bytes) = self.tiers.ephemeral.get(key).await? else {
                    return Ok(None);
                };
                let envelope = serde_json::from_slice::<EphemeralEnvelope>(&bytes)?;
                if let Some(expires_at) = envelope.expires_at {
                    if now_ms() >= expires_at {
                        self.tiers.ephemeral.delete(key).await?;
                        return Ok(None);
                    }
                }
                Ok(Some((envelope.value, envelope.expires_at)))
            }
            Tier::Small => {
                if let Some(bytes) = self.tiers.small.get(key).await? {
                    return Ok(Some((serde_json::from_slice(&bytes)?, None)));
                }
                let Some(manifest) = self.read_manifest(key).await? else {
                    return Ok(None);
                };
                let mut pieces = Vec::with_capacity(manifest.chunks.len());
                for chunk in &manifest.chunks {
                    let piece = self.tiers.large.get(chunk).await?.ok_or_else(|| {
                        VaultError::Storage(format!("chunk '{}' of '{}' is missing", chunk, key))
                    })?;
                    pieces.push(piece);
                }
                let payload = reassemble(&manifest, pieces)?;
                Ok(Some((serde_json::from_slice(&payload)?, None)))
            }
            Tier::Large => match self.tiers.large.get(key).await? {
                Some(bytes) => Ok(Some((serde_json::from_slice(&bytes)?, None))),
                None => Ok(None),
            },
        }
    }

    /// Copies a large-store hit into the small store when it fits there.
    async fn backfill_small(&self, key: &str, value: &Value) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "could not encode value for backfill");
                return;
            }
        };
        if bytes.len() > self.policy.small_store_max_bytes {
            return;
        }
        if let Err(err) = self.tiers.small.set(key, bytes).await {
            event!(
                Level::WARN,
                key = %key,
                store = %self.tiers.small.name(),
                error = %err,
                "small store backfill failed"
            );
        }
    }

    async fn read_manifest(&self, key: &str) -> Result<Option<ChunkManifest>> {
        match self.tiers.small.get(&manifest_key(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes `value` under `key` and returns the strategy that persisted it.
    ///
    /// The cache is updated first; if the persistent write fails the cache
    /// entry is dropped and the error is returned.
    pub async fn set(&self, key: &str, value: Value, flags: &WriteFlags) -> Result<WriteStrategy> {
        let bytes = serde_json::to_vec(&value)?;
        check_payload_cap(bytes.len(), flags, &self.policy)?;
        let strategy = select_strategy(bytes.len(), flags, &self.policy);
        let expires_at = flags
            .ttl_ms
            .map(|ttl| now_ms().saturating_add(ttl as i64));

        let chunk_count = match strategy {
            WriteStrategy::Distributed => bytes.len().div_ceil(self.policy.chunk_size_bytes.max(1)),
            _ => 0,
        };
        let span = info_span!("storage.set", key = %key, size = bytes.len(), strategy = ?strategy);

        async {
            self.cache.put(key, value.clone(), expires_at);

            let previous_manifest = match self.read_manifest(key).await {
                Ok(manifest) => manifest,
                Err(err) => {
                    event!(Level::WARN, error = %err, "unreadable chunk manifest, ignoring");
                    None
                }
            };

            if let Err(err) = self.persist(key, bytes, strategy, expires_at).await {
                self.cache.remove(key);
                event!(Level::ERROR, error = %err, "storage write failed");
                return Err(err);
            }

            self.remove_stale_copies(key, strategy, chunk_count, previous_manifest)
                .await;
            self.notify(key, Some(&value));
            self.publish(key, Some(value));
            Ok(strategy)
        }
        .instrument(span)
        .await
    }

    async fn persist(
        &self,
        key: &str,
        bytes: Vec<u8>,
        strategy: WriteStrategy,
        expires_at: Option<i64>,
    ) -> Result<()> {
        match strategy {
            WriteStrategy::Ephemeral => {
                let value = serde_json::from_slice::<Value>(&bytes)?;
                let envelope = serde_json::to_vec(&EphemeralEnvelope { value, expires_at })?;
                self.tiers.ephemeral.set(key, envelope).await
            }
            WriteStrategy::Small => self.tiers.small.set(key, bytes).await,
            WriteStrategy::Large => self.tiers.large.set(key, bytes).await,
            WriteStrategy::Distributed => {
                let (manifest, pieces) =
                    split_into_chunks(key, &bytes, self.policy.chunk_size_bytes, now_ms());
                for (chunk, piece) in pieces {
                    self.tiers.large.set(&chunk, piece).await?;
                }
                // Manifest last: a reader never sees a manifest without its chunks.
                self.tiers
                    .small
                    .set(&manifest_key(key), serde_json::to_vec(&manifest)?)
                    .await
            }
        }
    }

    /// Drops copies of `key` left in tiers the latest write did not use.
    async fn remove_stale_copies(
        &self,
        key: &str,
        strategy: WriteStrategy,
        chunk_count: usize,
        previous_manifest: Option<ChunkManifest>,
    ) {
        let mut stale: Vec<(&Arc<dyn KvStore>, String)> = Vec::new();
        if strategy != WriteStrategy::Ephemeral {
            stale.push((&self.tiers.ephemeral, key.to_string()));
        }
        if strategy != WriteStrategy::Small {
            stale.push((&self.tiers.small, key.to_string()));
        }
        if strategy != WriteStrategy::Large {
            stale.push((&self.tiers.large, key.to_string()));
        }
        if let Some(previous) = previous_manifest {
            for chunk in previous.chunks.into_iter().skip(chunk_count) {
                stale.push((&self.tiers.large, chunk));
            }
            if strategy != WriteStrategy::Distributed {
                stale.push((&self.tiers.small, manifest_key(key)));
            }
        }

        let results = futures::future::join_all(
            stale
                .iter()
                .map(|(store, stale_key)| store.delete(stale_key)),
        )
        .await;
        for ((store, stale_key), result) in stale.iter().zip(results) {
            if let Err(err) = result {
                event!(
                    Level::WARN,
                    store = %store.name(),
                    key = %stale_key,
                    error = %err,
                    "failed to remove stale copy"
                );
            }
        }
    }

    /// Removes `key` from every tier, including chunk and manifest entries.
    ///
    /// Every tier is attempted; the first failure is returned afterwards.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.remove(key);

        let mut targets: Vec<(&Arc<dyn KvStore>, String)> = vec![
            (&self.tiers.ephemeral, key.to_string()),
            (&self.tiers.small, key.to_string()),
            (&self.tiers.large, key.to_string()),
        ];
        match self.read_manifest(key).await {
            Ok(Some(manifest)) => {
                for chunk in manifest.chunks {
                    targets.push((&self.tiers.large, chunk));
                }
                targets.push((&self.tiers.small, manifest_key(key)));
            }
            Ok(None) => {}
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "unreadable manifest during delete");
                targets.push((&self.tiers.small, manifest_key(key)));
            }
        }

        let mut first_error = None;
        for (store, target) in targets {
            if let Err(err) = store.delete(&target).await {
                event!(Level::WARN, store = %store.name(), key = %target, error = %err, "delete failed");
                first_error.get_or_insert(err);
            }
        }

        self.notify(key, None);
        self.publish(key, None);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Registers an in-process listener for writes and deletes of `key`.
    pub fn subscribe(&self, key: &str, callback: SubscriberCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(key.to_string())
                .or_default()
                .push((id, callback));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return false;
        };
        let mut removed = false;
        subscribers.retain(|_, listeners| {
            let before = listeners.len();
            listeners.retain(|(existing, _)| *existing != id);
            removed |= listeners.len() != before;
            !listeners.is_empty()
        });
        removed
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        let callbacks = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .get(key)
                .map(|listeners| {
                    listeners
                        .iter()
                        .map(|(_, callback)| callback.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        for callback in callbacks {
            callback(key, value);
        }
    }

    fn publish(&self, key: &str, value: Option<Value>) {
        if let Some(bus) = &self.bus {
            bus.publish(ChangeEvent {
                origin: self.context_id.clone(),
                key: key.to_string(),
                value,
                timestamp_ms: now_ms(),
            });
        }
    }

    /// Applies a change published by another context to this context's cache
    /// and local subscribers. Returns `false` for this context's own events.
    pub fn apply_remote_change(&self, change: &ChangeEvent) -> bool {
        if change.origin == self.context_id {
            return false;
        }
        match &change.value {
            Some(value) => self.cache.put(&change.key, value.clone(), None),
            None => self.cache.remove(&change.key),
        }
        self.notify(&change.key, change.value.as_ref());
        true
    }

    /// Spawns the loop that applies changes from other contexts.
    pub fn spawn_replication_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut receiver = self.bus.as_ref()?.subscribe();
        let facade = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => {
                        facade.apply_remote_change(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        event!(Level::WARN, skipped, "replication listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            cache_entries: self.cache.len(),
            ephemeral_bytes: self.tiers.ephemeral.size_bytes().await?,
            small_bytes: self.tiers.small.size_bytes().await?,
            large_bytes: self.tiers.large.size_bytes().await?,
        })
    }
}
