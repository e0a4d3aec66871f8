//! Full and incremental snapshots of the tracked datasets.
//!
//! Every failure here is returned to the caller. Snapshots are encoded with
//! [`BackupCodec`], stored under `backup_<id>` and indexed under
//! `backup_metadata`, oldest first.

pub mod codec;
pub mod types;

pub use codec::{BackupCodec, EncodedPayload, checksum};
pub use types::{
    BackupContent, BackupMetadata, BackupType, IncrementalBackupOutcome, RestoreOptions,
    RestoreReport, StoredBackup, VerifyReport,
};

use crate::config::BackupPolicy;
use crate::core::{
    BACKUP_METADATA_KEY, CanonicalKey, MIGRATED_KEYS_KEY, Result, SCHEMA_VERSION_KEY, VaultError,
    backup_key, canonical_eq, now_ms,
};
use crate::storage::{ReadOptions, StorageFacade, WriteFlags};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

type State = BTreeMap<String, Value>;

pub struct BackupService {
    facade: Arc<StorageFacade>,
    policy: BackupPolicy,
    codec: BackupCodec,
    /// Serializes index mutations.
    index_lock: Mutex<()>,
}

impl BackupService {
    pub fn new(facade: Arc<StorageFacade>, policy: BackupPolicy) -> Result<Self> {
        let codec = BackupCodec::from_policy(&policy)?;
        Ok(Self {
            facade,
            policy,
            codec,
            index_lock: Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &BackupPolicy {
        &self.policy
    }

    async fn load_index(&self) -> Result<Vec<BackupMetadata>> {
        match self
            .facade
            .get(BACKUP_METADATA_KEY, &ReadOptions::strict())
            .await?
        {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(value) => {
                let mut index = serde_json::from_value::<Vec<BackupMetadata>>(value)?;
                index.sort_by_key(|meta| meta.timestamp);
                Ok(index)
            }
        }
    }

    async fn save_index(&self, index: &[BackupMetadata]) -> Result<()> {
        self.facade
            .set(
                BACKUP_METADATA_KEY,
                serde_json::to_value(index)?,
                &WriteFlags::force_local(),
            )
            .await?;
        Ok(())
    }

    async fn capture_state(&self) -> Result<State> {
        let mut state = State::new();
        for key in &self.policy.tracked_keys {
            match self.facade.get(key, &ReadOptions::strict()).await? {
                Some(Value::Null) | None => {}
                Some(value) => {
                    state.insert(key.clone(), value);
                }
            }
        }
        Ok(state)
    }

    async fn stored_schema_version(&self) -> u32 {
        match self.facade.get_value(SCHEMA_VERSION_KEY).await {
            Ok(Some(value)) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Encodes and stores one snapshot, appending it to `index`.
    async fn write_snapshot(
        &self,
        index: &mut Vec<BackupMetadata>,
        backup_type: BackupType,
        description: String,
        content: BackupContent,
        parent_id: Option<String>,
    ) -> Result<BackupMetadata> {
        let timestamp = next_timestamp(index);
        let id = format!(
            "{}-{}",
            timestamp,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let meta = self
            .encode_and_store(
                id,
                timestamp,
                backup_type,
                description,
                &content,
                parent_id,
            )
            .await?;
        index.push(meta.clone());
        self.save_index(index).await?;
        Ok(meta)
    }

    async fn encode_and_store(
        &self,
        id: String,
        timestamp: i64,
        backup_type: BackupType,
        description: String,
        content: &BackupContent,
        parent_id: Option<String>,
    ) -> Result<BackupMetadata> {
        let plaintext = serde_json::to_vec(content)?;
        let encoded = self.codec.encode(&plaintext)?;
        let data_keys = match content {
            BackupContent::Full { data } => data.keys().cloned().collect(),
            BackupContent::Incremental { changed, .. } => changed.keys().cloned().collect(),
        };

        let meta = BackupMetadata {
            id,
            backup_type,
            timestamp,
            description,
            data_keys,
            original_size: plaintext.len(),
            compressed_size: encoded.stored_size,
            compressed: encoded.compressed,
            encrypted: encoded.encrypted,
            version: self.stored_schema_version().await,
            parent_id,
            checksum: checksum(&plaintext),
        };

        let inline = encoded.text.len() <= self.policy.inline_limit_bytes;
        let (payload, diff) = match backup_type {
            BackupType::Full => (Some(encoded.text), None),
            BackupType::Incremental => (None, Some(encoded.text)),
        };
        let record = StoredBackup {
            meta: meta.clone(),
            payload,
            diff,
        };
        let flags = if inline {
            WriteFlags::force_local()
        } else {
            WriteFlags {
                prefer_large: true,
                force: true,
                ..WriteFlags::default()
            }
        };
        self.facade
            .set(&backup_key(&meta.id), serde_json::to_value(&record)?, &flags)
            .await?;
        Ok(meta)
    }

    /// Snapshots every tracked key.
    pub async fn create_full_backup(&self, description: &str) -> Result<BackupMetadata> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let state = self.capture_state().await?;

        let meta = self
            .write_snapshot(
                &mut index,
                BackupType::Full,
                description.to_string(),
                BackupContent::Full { data: state },
                None,
            )
            .await?;
        event!(
            Level::INFO,
            backup_id = %meta.id,
            keys = meta.data_keys.len(),
            original_size = meta.original_size,
            stored_size = meta.compressed_size,
            "full backup created"
        );
        self.enforce_retention(&mut index).await?;
        Ok(meta)
    }

    /// Stores only keys that differ from `base_id` (default: the latest snapshot).
    pub async fn create_incremental_backup(
        &self,
        base_id: Option<&str>,
    ) -> Result<IncrementalBackupOutcome> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let base = match base_id {
            Some(id) => find(&index, id)?.clone(),
            None => index
                .last()
                .cloned()
                .ok_or_else(|| VaultError::NotFound("no base snapshot exists".to_string()))?,
        };

        let base_state = self.reconstruct(&base.id).await?;
        let current = self.capture_state().await?;

        let changed = current
            .iter()
            .filter(|(key, value)| {
                base_state
                    .get(*key)
                    .is_none_or(|previous| !canonical_eq(previous, value))
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<State>();
        let removed = base_state
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned()
            .collect::<Vec<_>>();

        if changed.is_empty() && removed.is_empty() {
            event!(Level::INFO, base_id = %base.id, "no changes since base snapshot");
            return Ok(IncrementalBackupOutcome::NoChanges { base_id: base.id });
        }

        let description = format!("Incremental on {}", base.id);
        let meta = self
            .write_snapshot(
                &mut index,
                BackupType::Incremental,
                description,
                BackupContent::Incremental { changed, removed },
                Some(base.id.clone()),
            )
            .await?;
        event!(
            Level::INFO,
            backup_id = %meta.id,
            base_id = %base.id,
            changed = meta.data_keys.len(),
            "incremental backup created"
        );
        self.enforce_retention(&mut index).await?;
        Ok(IncrementalBackupOutcome::Created(meta))
    }

    async fn load_snapshot(&self, id: &str) -> Result<(BackupMetadata, BackupContent)> {
        let stored = self
            .facade
            .get(&backup_key(id), &ReadOptions::strict())
            .await?
            .filter(|value| !value.is_null())
            .ok_or_else(|| VaultError::NotFound(format!("backup '{}' not found", id)))?;
        let stored = serde_json::from_value::<StoredBackup>(stored)?;
        let body = stored
            .encoded_body()
            .ok_or_else(|| VaultError::Codec(format!("backup '{}' has no payload", id)))?;
        let plaintext = self
            .codec
            .decode(body, stored.meta.compressed, stored.meta.encrypted)?;
        if checksum(&plaintext) != stored.meta.checksum {
            return Err(VaultError::Codec(format!(
                "backup '{}' failed its checksum",
                id
            )));
        }
        let content = serde_json::from_slice::<BackupContent>(&plaintext)?;
        Ok((stored.meta, content))
    }

    /// Full state captured by `id`, following the parent chain of incrementals.
    pub async fn reconstruct(&self, id: &str) -> Result<BTreeMap<String, Value>> {
        let mut layers = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = id.to_string();
        let mut state = loop {
            if !visited.insert(cursor.clone()) {
                return Err(VaultError::Codec(format!(
                    "backup chain of '{}' loops at '{}'",
                    id, cursor
                )));
            }
            let (meta, content) = self.load_snapshot(&cursor).await?;
            match content {
                BackupContent::Full { data } => break data,
                BackupContent::Incremental { changed, removed } => {
                    layers.push((changed, removed));
                    cursor = meta.parent_id.ok_or_else(|| {
                        VaultError::NotFound(format!(
                            "incremental backup '{}' has no parent",
                            meta.id
                        ))
                    })?;
                }
            }
        };

        for (changed, removed) in layers.into_iter().rev() {
            for key in removed {
                state.remove(&key);
            }
            state.extend(changed);
        }
        Ok(state)
    }

    /// Writes a snapshot back through the storage facade.
    pub async fn restore_backup(&self, id: &str, options: &RestoreOptions) -> Result<RestoreReport> {
        let state = self.reconstruct(id).await?;

        let safety_backup_id = if options.safety_backup {
            let safety = self
                .create_full_backup(&format!("Safety snapshot before restoring {}", id))
                .await?;
            Some(safety.id)
        } else {
            None
        };

        let mut removed_keys = Vec::new();
        for key in &self.policy.tracked_keys {
            if !state.contains_key(key) {
                self.facade.delete(key).await?;
                removed_keys.push(key.clone());
            }
        }

        let mut restored_keys = Vec::with_capacity(state.len());
        for (key, value) in state {
            self.facade.set(&key, value, &WriteFlags::default()).await?;
            restored_keys.push(key);
        }

        event!(
            Level::INFO,
            backup_id = %id,
            restored = restored_keys.len(),
            removed = removed_keys.len(),
            "backup restored"
        );
        Ok(RestoreReport {
            backup_id: id.to_string(),
            restored_keys,
            removed_keys,
            safety_backup_id,
        })
    }

    /// Decodes a snapshot and checks its structure without touching live data.
    pub async fn verify_backup(&self, id: &str) -> Result<VerifyReport> {
        let meta = self
            .get_backup_metadata(id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("backup '{}' not found", id)))?;

        let mut issues = Vec::new();
        match self.reconstruct(id).await {
            Ok(state) => {
                if meta.backup_type == BackupType::Full {
                    for key in &meta.data_keys {
                        if !state.contains_key(key) {
                            issues.push(format!("declared key '{}' is missing", key));
                        }
                    }
                }
                for (key, value) in &state {
                    if let Some(issue) = shape_issue(key, value) {
                        issues.push(issue);
                    }
                }
            }
            Err(err) => issues.push(err.to_string()),
        }

        if !issues.is_empty() {
            event!(Level::WARN, backup_id = %id, issues = issues.len(), "backup failed verification");
        }
        Ok(VerifyReport {
            backup_id: id.to_string(),
            valid: issues.is_empty(),
            issues,
        })
    }

    /// Snapshot index, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        self.load_index().await
    }

    pub async fn get_backup_metadata(&self, id: &str) -> Result<Option<BackupMetadata>> {
        Ok(self
            .load_index()
            .await?
            .into_iter()
            .find(|meta| meta.id == id))
    }

    pub async fn latest_backup(&self) -> Result<Option<BackupMetadata>> {
        Ok(self.load_index().await?.pop())
    }

    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        find(&index, id)?;
        self.delete_from_index(&mut index, id).await
    }

    /// Removes one snapshot. Direct children are first rewritten as full
    /// snapshots so their restore chain survives.
    async fn delete_from_index(&self, index: &mut Vec<BackupMetadata>, id: &str) -> Result<()> {
        let children = index
            .iter()
            .filter(|meta| meta.parent_id.as_deref() == Some(id))
            .cloned()
            .collect::<Vec<_>>();
        for child in children {
            let state = self.reconstruct(&child.id).await?;
            let rebased = self
                .encode_and_store(
                    child.id.clone(),
                    child.timestamp,
                    BackupType::Full,
                    child.description.clone(),
                    &BackupContent::Full { data: state },
                    None,
                )
                .await?;
            if let Some(slot) = index.iter_mut().find(|meta| meta.id == child.id) {
                *slot = rebased;
            }
            event!(Level::INFO, backup_id = %child.id, parent = %id, "incremental rebased to full");
        }

        self.facade.delete(&backup_key(id)).await?;
        index.retain(|meta| meta.id != id);
        self.save_index(index).await?;
        event!(Level::INFO, backup_id = %id, "backup deleted");
        Ok(())
    }

    async fn enforce_retention(&self, index: &mut Vec<BackupMetadata>) -> Result<()> {
        while index.len() > self.policy.max_backups {
            let Some(oldest) = index.first().map(|meta| meta.id.clone()) else {
                break;
            };
            event!(Level::INFO, backup_id = %oldest, "retention limit reached, purging oldest backup");
            self.delete_from_index(index, &oldest).await?;
        }
        Ok(())
    }
}

fn find<'a>(index: &'a [BackupMetadata], id: &str) -> Result<&'a BackupMetadata> {
    index
        .iter()
        .find(|meta| meta.id == id)
        .ok_or_else(|| VaultError::NotFound(format!("backup '{}' not found", id)))
}

fn next_timestamp(index: &[BackupMetadata]) -> i64 {
    let latest = index.iter().map(|meta| meta.timestamp).max();
    match latest {
        Some(latest) => now_ms().max(latest + 1),
        None => now_ms(),
    }
}

fn shape_issue(key: &str, value: &Value) -> Option<String> {
    if let Ok(canonical) = key.parse::<CanonicalKey>() {
        if canonical.is_collection() && !value.is_array() {
            return Some(format!("'{}' should be an array", key));
        }
        if !canonical.is_collection() && !value.is_object() {
            return Some(format!("'{}' should be an object", key));
        }
        return None;
    }
    if key == MIGRATED_KEYS_KEY && !value.is_array() {
        return Some(format!("'{}' should be an array", key));
    }
    if key == SCHEMA_VERSION_KEY && !value.is_u64() {
        return Some(format!("'{}' should be a number", key));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(policy: BackupPolicy) -> (BackupService, Arc<StorageFacade>) {
        let facade = Arc::new(StorageFacade::in_memory());
        (BackupService::new(facade.clone(), policy).unwrap(), facade)
    }

    async fn put(facade: &StorageFacade, key: &str, value: Value) {
        facade.set(key, value, &WriteFlags::default()).await.unwrap();
    }

    #[tokio::test]
    async fn incremental_overlays_changes_and_removals() {
        let (backups, facade) = service(BackupPolicy::default());
        put(&facade, "templates", json!([{"id": "1"}])).await;
        put(&facade, "folders", json!([{"id": "f"}])).await;
        let full = backups.create_full_backup("base").await.unwrap();

        assert_eq!(
            backups.create_incremental_backup(None).await.unwrap(),
            IncrementalBackupOutcome::NoChanges {
                base_id: full.id.clone()
            }
        );

        put(&facade, "templates", json!([{"id": "1"}, {"id": "2"}])).await;
        facade.delete("folders").await.unwrap();
        let IncrementalBackupOutcome::Created(inc) =
            backups.create_incremental_backup(None).await.unwrap()
        else {
            panic!("expected an incremental snapshot");
        };
        assert_eq!(inc.parent_id.as_deref(), Some(full.id.as_str()));
        assert_eq!(inc.data_keys, vec!["templates".to_string()]);

        let state = backups.reconstruct(&inc.id).await.unwrap();
        assert_eq!(state.get("templates"), Some(&json!([{"id": "1"}, {"id": "2"}])));
        assert!(!state.contains_key("folders"));
    }

    #[tokio::test]
    async fn deleting_a_parent_rebases_children() {
        let (backups, facade) = service(BackupPolicy::default());
        put(&facade, "snippets", json!([{"id": "a"}])).await;
        let full = backups.create_full_backup("base").await.unwrap();
        put(&facade, "snippets", json!([{"id": "b"}])).await;
        let IncrementalBackupOutcome::Created(inc) =
            backups.create_incremental_backup(Some(&full.id)).await.unwrap()
        else {
            panic!("expected an incremental snapshot");
        };

        backups.delete_backup(&full.id).await.unwrap();
        let rebased = backups.get_backup_metadata(&inc.id).await.unwrap().unwrap();
        assert_eq!(rebased.backup_type, BackupType::Full);
        assert_eq!(rebased.parent_id, None);
        assert!(backups.verify_backup(&inc.id).await.unwrap().valid);
        assert_eq!(
            backups.reconstruct(&inc.id).await.unwrap().get("snippets"),
            Some(&json!([{"id": "b"}]))
        );
    }

    #[tokio::test]
    async fn encrypted_backups_restore_and_verify() {
        let policy = BackupPolicy {
            encryption_key: Some(hex::encode([9u8; 32])),
            ..BackupPolicy::default()
        };
        let (backups, facade) = service(policy);
        put(&facade, "user_settings", json!({"language": "fr"})).await;
        let meta = backups.create_full_backup("enc").await.unwrap();
        assert!(meta.encrypted && meta.compressed);

        put(&facade, "user_settings", json!({"language": "en"})).await;
        put(&facade, "snippets", json!([{"id": "x"}])).await;
        let report = backups
            .restore_backup(&meta.id, &RestoreOptions { safety_backup: false })
            .await
            .unwrap();
        assert!(report.removed_keys.contains(&"snippets".to_string()));
        assert_eq!(
            facade.get_value("user_settings").await.unwrap(),
            Some(json!({"language": "fr"}))
        );
        assert_eq!(facade.get_value("snippets").await.unwrap(), None);
    }

    #[tokio::test]
    async fn verify_flags_bad_shapes_and_missing_backups() {
        let (backups, facade) = service(BackupPolicy::default());
        put(&facade, "templates", json!({"not": "an array"})).await;
        let meta = backups.create_full_backup("bad").await.unwrap();
        let report = backups.verify_backup(&meta.id).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.issues.len(), 1);

        let err = backups.verify_backup("nope").await.unwrap_err();
        assert_eq!(err.kind(), crate::core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let (backups, _) = service(BackupPolicy::default());
        let a = backups.create_full_backup("a").await.unwrap();
        let b = backups.create_full_backup("b").await.unwrap();
        assert!(b.timestamp > a.timestamp);
        assert_eq!(backups.latest_backup().await.unwrap().unwrap().id, b.id);
    }
}
