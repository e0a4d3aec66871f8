//! Operational configuration for every subsystem.
//!
//! Each section deserializes with `#[serde(default)]`, so a config file only
//! needs to name the values it overrides.

use crate::core::{CanonicalKey, Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Size thresholds and cache bounds for the storage facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoragePolicy {
    /// Maximum number of decoded values held in the volatile cache.
    pub cache_capacity: usize,
    /// Payloads above this size are distributed across chunks.
    pub small_store_max_bytes: usize,
    /// Payloads above this size go to the large-object store whole.
    pub large_store_threshold_bytes: usize,
    /// Absolute cap; larger writes fail unless forced.
    pub max_payload_bytes: usize,
    /// Size of each piece of a distributed payload.
    pub chunk_size_bytes: usize,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            cache_capacity: 512,
            small_store_max_bytes: 100 * 1024,
            large_store_threshold_bytes: 1024 * 1024,
            max_payload_bytes: 10 * 1024 * 1024,
            chunk_size_bytes: 64 * 1024,
        }
    }
}

/// Dual-read / dual-write windows and read-path behavior of the compatibility layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatPolicy {
    /// Whether dual-read starts enabled on a fresh install.
    pub dual_read_enabled: bool,
    /// Length of the initial dual-read window in milliseconds.
    pub dual_read_duration_ms: u64,
    /// Persist upgraded payloads after a read so later reads skip the transform chain.
    pub write_back_upgrades: bool,
}

impl Default for CompatPolicy {
    fn default() -> Self {
        Self {
            dual_read_enabled: true,
            dual_read_duration_ms: 30 * 24 * 60 * 60 * 1000,
            write_back_upgrades: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationPolicy {
    /// Attempts per step before the step is reported as failed.
    pub max_retries: u32,
    /// Backoff unit; attempt `n` waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
    /// Process records in batches and let sibling steps run after a failure.
    pub progressive_mode: bool,
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    /// Snapshot before executing; may be overridden per run.
    pub create_backup: bool,
    /// Run pending migrations from `Vault::initialize`.
    pub run_on_startup: bool,
    /// Enqueue records recovered from legacy keys as remote creates.
    pub sync_legacy_to_remote: bool,
    pub history_limit: usize,
    pub log_limit: usize,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            progressive_mode: false,
            batch_size: 100,
            batch_pause_ms: 10,
            create_backup: true,
            run_on_startup: false,
            sync_legacy_to_remote: false,
            history_limit: 50,
            log_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupPolicy {
    /// Retention limit; the oldest snapshots are purged beyond it.
    pub max_backups: usize,
    pub compress: bool,
    /// Hex-encoded 32-byte AES-256-GCM key. Encryption is off when absent.
    pub encryption_key: Option<String>,
    /// Encoded payloads above this size are stored in the large-object store.
    pub inline_limit_bytes: usize,
    /// Keys captured by every snapshot.
    pub tracked_keys: Vec<String>,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        let mut tracked_keys = CanonicalKey::ALL
            .iter()
            .map(|key| key.as_str().to_string())
            .collect::<Vec<_>>();
        tracked_keys.push(crate::core::SCHEMA_VERSION_KEY.to_string());
        tracked_keys.push(crate::core::MIGRATED_KEYS_KEY.to_string());

        Self {
            max_backups: 10,
            compress: true,
            encryption_key: None,
            inline_limit_bytes: 256 * 1024,
            tracked_keys,
        }
    }
}

impl BackupPolicy {
    pub fn encryption_key_bytes(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = self.encryption_key.as_deref() else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim())
            .map_err(|err| VaultError::Validation(format!("backup.encryption_key: {}", err)))?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            VaultError::Validation(format!(
                "backup.encryption_key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Some(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Retry ceiling per operation.
    pub max_retries: u32,
    /// Backoff unit; a failed operation is redispatched after `retries * base_delay_ms`.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Completed operations are garbage-collected after this window.
    pub completed_retention_ms: u64,
    /// Interval of the background drain worker, when one is spawned.
    pub worker_interval_ms: Option<u64>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
            completed_retention_ms: 24 * 60 * 60 * 1000,
            worker_interval_ms: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StoragePolicy,
    pub compat: CompatPolicy,
    pub migration: MigrationPolicy,
    pub backup: BackupPolicy,
    pub sync: SyncPolicy,
}

impl VaultConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config = serde_json::from_str::<VaultConfig>(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            VaultError::Io(format!("Failed to read config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;
        if storage.chunk_size_bytes == 0 || storage.cache_capacity == 0 {
            return Err(VaultError::Validation(
                "storage.chunk_size_bytes and storage.cache_capacity must be > 0".to_string(),
            ));
        }
        if storage.small_store_max_bytes > storage.large_store_threshold_bytes
            || storage.large_store_threshold_bytes > storage.max_payload_bytes
        {
            return Err(VaultError::Validation(format!(
                "storage thresholds must be ordered: small ({}) <= large ({}) <= max ({})",
                storage.small_store_max_bytes,
                storage.large_store_threshold_bytes,
                storage.max_payload_bytes
            )));
        }
        if self.backup.max_backups == 0 {
            return Err(VaultError::Validation(
                "backup.max_backups must be >= 1".to_string(),
            ));
        }
        if self.migration.batch_size == 0 {
            return Err(VaultError::Validation(
                "migration.batch_size must be >= 1".to_string(),
            ));
        }
        self.backup.encryption_key_bytes()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = VaultConfig::from_json_str(r#"{"backup": {"max_backups": 3}}"#).unwrap();
        assert_eq!(config.backup.max_backups, 3);
        assert!(config.backup.compress);
        assert_eq!(config.storage.small_store_max_bytes, 100 * 1024);
        assert_eq!(config.migration.max_retries, 3);
    }

    #[test]
    fn rejects_unordered_thresholds() {
        let raw = r#"{"storage": {"small_store_max_bytes": 2000000}}"#;
        assert!(VaultConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn encryption_key_must_be_32_bytes() {
        let mut config = VaultConfig::default();
        config.backup.encryption_key = Some("abcd".to_string());
        assert!(config.validate().is_err());

        config.backup.encryption_key = Some("11".repeat(32));
        assert_eq!(config.backup.encryption_key_bytes().unwrap(), Some([0x11; 32]));
    }
}
