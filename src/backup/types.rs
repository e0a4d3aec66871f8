use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Index entry describing one snapshot; also stored alongside its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Milliseconds since the epoch, strictly increasing across snapshots.
    pub timestamp: i64,
    pub description: String,
    /// Keys carried by this snapshot (changed keys for incrementals).
    pub data_keys: Vec<String>,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compressed: bool,
    pub encrypted: bool,
    /// Stored schema version when the snapshot was taken; 0 when never migrated.
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Hex SHA-256 of the plaintext body.
    pub checksum: String,
}

/// Persisted record under `backup_<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBackup {
    #[serde(flatten)]
    pub meta: BackupMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl StoredBackup {
    pub fn encoded_body(&self) -> Option<&str> {
        self.payload.as_deref().or(self.diff.as_deref())
    }
}

/// Plaintext body before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackupContent {
    Full {
        data: BTreeMap<String, Value>,
    },
    Incremental {
        changed: BTreeMap<String, Value>,
        #[serde(default)]
        removed: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncrementalBackupOutcome {
    Created(BackupMetadata),
    NoChanges { base_id: String },
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Snapshot the current state before overwriting it.
    pub safety_backup: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self { safety_backup: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored_keys: Vec<String>,
    pub removed_keys: Vec<String>,
    pub safety_backup_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyReport {
    pub backup_id: String,
    pub valid: bool,
    pub issues: Vec<String>,
}
