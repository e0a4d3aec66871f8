//! Version-aware reads and writes of canonical datasets.
//!
//! Reads fall back to legacy storage during the dual-read window and are
//! upgraded through the [`TransformChain`] before they are returned. Writes
//! always carry the current schema version.

pub mod defaults;
pub mod shim;
pub mod versioning;

pub use shim::LegacyApiShim;
pub use versioning::{
    CURRENT_SCHEMA_VERSION, OLDEST_SCHEMA_VERSION, TransformChain, TransformStep, default_chain,
    detect_version,
};

use crate::config::CompatPolicy;
use crate::core::record::{camel_to_snake, new_record_id, now_iso, rename_keys_deep};
use crate::core::{
    CanonicalKey, MIGRATION_STATUS_KEY, Result, VERSION_FIELD, VaultError, now_ms, record_id,
};
use crate::legacy::{LegacyAdapter, LegacyOutcome, MigratedKeys};
use crate::storage::{StorageFacade, WriteFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

/// Persisted dual-read / dual-write switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompatState {
    pub dual_read_enabled: bool,
    pub dual_read_end_time: Option<i64>,
    pub dual_write_enabled: bool,
    pub dual_write_end_time: Option<i64>,
}

impl CompatState {
    pub fn dual_read_active(&self, now: i64) -> bool {
        self.dual_read_enabled && self.dual_read_end_time.is_none_or(|end| now < end)
    }

    pub fn dual_write_active(&self, now: i64) -> bool {
        self.dual_write_enabled && self.dual_write_end_time.is_none_or(|end| now < end)
    }

    /// Turns off windows whose end time has passed; returns whether anything changed.
    fn expire(&mut self, now: i64) -> bool {
        let mut changed = false;
        if self.dual_read_enabled && !self.dual_read_active(now) {
            self.dual_read_enabled = false;
            changed = true;
        }
        if self.dual_write_enabled && !self.dual_write_active(now) {
            self.dual_write_enabled = false;
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompatStatus {
    pub state: CompatState,
    pub dual_read_active: bool,
    pub dual_write_active: bool,
    pub migrated_keys: Vec<CanonicalKey>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Run the payload through the transform chain.
    pub transform: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self { transform: true }
    }
}

impl GetOptions {
    pub fn raw() -> Self {
        Self { transform: false }
    }
}

pub struct CompatibilityLayer {
    facade: Arc<StorageFacade>,
    legacy: Arc<LegacyAdapter>,
    chain: TransformChain,
    policy: CompatPolicy,
    state: RwLock<CompatState>,
}

impl CompatibilityLayer {
    pub fn new(
        facade: Arc<StorageFacade>,
        legacy: Arc<LegacyAdapter>,
        chain: TransformChain,
        policy: CompatPolicy,
    ) -> Self {
        let state = CompatState {
            dual_read_enabled: policy.dual_read_enabled,
            ..CompatState::default()
        };
        Self {
            facade,
            legacy,
            chain,
            policy,
            state: RwLock::new(state),
        }
    }

    pub fn chain(&self) -> &TransformChain {
        &self.chain
    }

    pub fn facade(&self) -> &Arc<StorageFacade> {
        &self.facade
    }

    pub fn legacy(&self) -> &Arc<LegacyAdapter> {
        &self.legacy
    }

    fn snapshot_state(&self) -> CompatState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    async fn store_state(&self, state: CompatState) -> Result<()> {
        self.facade
            .set(
                MIGRATION_STATUS_KEY,
                serde_json::to_value(&state)?,
                &WriteFlags::force_local(),
            )
            .await?;
        *self.state.write()? = state;
        Ok(())
    }

    /// Loads the persisted state, seeding it from policy on first run and
    /// switching off expired windows.
    pub async fn initialize(&self) -> Result<CompatState> {
        let now = now_ms();
        let stored = match self.facade.get_value(MIGRATION_STATUS_KEY).await? {
            Some(Value::Null) | None => None,
            Some(value) => match serde_json::from_value::<CompatState>(value) {
                Ok(state) => Some(state),
                Err(err) => {
                    event!(Level::WARN, error = %err, "unreadable compatibility state, reseeding");
                    None
                }
            },
        };

        let (mut state, mut dirty) = match stored {
            Some(state) => (state, false),
            None => {
                let enabled = self.policy.dual_read_enabled;
                let state = CompatState {
                    dual_read_enabled: enabled,
                    dual_read_end_time: enabled
                        .then(|| now.saturating_add(self.policy.dual_read_duration_ms as i64)),
                    ..CompatState::default()
                };
                (state, true)
            }
        };

        if state.expire(now) {
            event!(Level::INFO, "compatibility window expired");
            dirty = true;
        }

        if dirty {
            self.store_state(state.clone()).await?;
        } else {
            *self.state.write()? = state.clone();
        }
        Ok(state)
    }

    /// Reads a dataset, falling back to legacy data and upgrading it as needed.
    pub async fn get(&self, key: CanonicalKey, options: &GetOptions) -> Result<Value> {
        let mut value = match self.facade.get_value(key.as_str()).await? {
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        };

        if value.is_none() && self.snapshot_state().dual_read_active(now_ms()) {
            let migrated = match MigratedKeys::load(&self.facade).await {
                Ok(migrated) => migrated,
                Err(err) => {
                    event!(Level::WARN, error = %err, "unreadable migrated-keys record, treating as empty");
                    MigratedKeys::default()
                }
            };
            if !migrated.contains(key) {
                match self.legacy.migrate_key(key).await {
                    Ok(LegacyOutcome::Migrated { value: found, .. }) => {
                        event!(Level::DEBUG, key = %key, "served from legacy storage");
                        value = Some(found);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        event!(Level::WARN, key = %key, error = %err, "legacy fallback failed");
                    }
                }
            }
        }

        let Some(value) = value else {
            return Ok(defaults::default_value(key));
        };
        if !options.transform {
            return Ok(value);
        }

        let (upgraded, changed) = self.chain.upgrade_value(key, value)?;
        if changed && self.policy.write_back_upgrades {
            if let Err(err) = self
                .facade
                .set(key.as_str(), upgraded.clone(), &WriteFlags::default())
                .await
            {
                event!(Level::WARN, key = %key, error = %err, "failed to persist upgraded value");
            }
        }
        Ok(upgraded)
    }

    /// Replaces a dataset, stamping the current version on every record.
    pub async fn set(&self, key: CanonicalKey, value: Value) -> Result<Value> {
        match (&value, key.is_collection()) {
            (Value::Array(_), true) | (Value::Object(_), false) => {}
            _ => {
                return Err(VaultError::Validation(format!(
                    "'{}' expects {}",
                    key,
                    if key.is_collection() { "an array" } else { "an object" }
                )));
            }
        }

        let stamped = self.chain.stamp(key, value)?;
        self.facade
            .set(key.as_str(), stamped.clone(), &WriteFlags::default())
            .await?;

        if self.snapshot_state().dual_write_active(now_ms()) {
            self.mirror_to_legacy(key, &stamped).await;
        }
        Ok(stamped)
    }

    async fn mirror_to_legacy(&self, key: CanonicalKey, value: &Value) {
        let Some(legacy_key) = self.legacy.primary_legacy_key(key) else {
            return;
        };
        let legacy_shaped = versioning::map_records(key, value.clone(), |record| {
            record.remove(VERSION_FIELD);
            Ok(())
        })
        .map(|value| rename_keys_deep(value, &camel_to_snake));

        let outcome = match legacy_shaped.and_then(|value| Ok(serde_json::to_vec(&value)?)) {
            Ok(bytes) => self.legacy.legacy_store().set(&legacy_key, bytes).await,
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            event!(Level::WARN, key = %key, legacy_key = %legacy_key, error = %err, "dual-write mirror failed");
        }
    }

    /// Inserts or replaces one record of a collection by identity.
    pub async fn save(&self, key: CanonicalKey, record: Value) -> Result<Value> {
        if !key.is_collection() {
            return Err(VaultError::Validation(format!(
                "'{}' is not a collection",
                key
            )));
        }
        let Value::Object(mut record) = record else {
            return Err(VaultError::Validation(format!(
                "records of '{}' must be objects",
                key
            )));
        };

        let now = now_iso();
        let id = match record_id(&Value::Object(record.clone())) {
            Some(id) => id,
            None => {
                record.entry("createdAt").or_insert(Value::String(now.clone()));
                new_record_id()
            }
        };
        record.insert("id".to_string(), Value::String(id.clone()));
        record.insert("updatedAt".to_string(), Value::String(now));

        let mut records = match self.get(key, &GetOptions::default()).await? {
            Value::Array(records) => records,
            _ => Vec::new(),
        };
        match records
            .iter()
            .position(|existing| record_id(existing).as_deref() == Some(id.as_str()))
        {
            Some(index) => {
                if let Some(created) = records[index].get("createdAt").cloned() {
                    record.entry("createdAt").or_insert(created);
                }
                records[index] = Value::Object(record);
            }
            None => {
                record
                    .entry("createdAt")
                    .or_insert(Value::String(now_iso()));
                records.push(Value::Object(record));
            }
        }

        let stored = self.set(key, Value::Array(records)).await?;
        stored
            .as_array()
            .and_then(|records| {
                records
                    .iter()
                    .find(|existing| record_id(existing).as_deref() == Some(id.as_str()))
                    .cloned()
            })
            .ok_or_else(|| VaultError::Storage(format!("saved record '{}' not found", id)))
    }

    /// Removes one record from a collection; returns whether it existed.
    pub async fn delete(&self, key: CanonicalKey, id: &str) -> Result<bool> {
        let records = match self.get(key, &GetOptions::default()).await? {
            Value::Array(records) => records,
            _ => return Ok(false),
        };
        let before = records.len();
        let remaining = records
            .into_iter()
            .filter(|record| record_id(record).as_deref() != Some(id))
            .collect::<Vec<_>>();
        if remaining.len() == before {
            return Ok(false);
        }
        self.set(key, Value::Array(remaining)).await?;
        Ok(true)
    }

    /// Deletes a whole dataset from every tier.
    pub async fn remove(&self, key: CanonicalKey) -> Result<()> {
        self.facade.delete(key.as_str()).await
    }

    pub async fn set_dual_read_mode(&self, enabled: bool, duration_ms: Option<u64>) -> Result<()> {
        let mut state = self.snapshot_state();
        state.dual_read_enabled = enabled;
        state.dual_read_end_time = enabled.then(|| {
            now_ms().saturating_add(duration_ms.unwrap_or(self.policy.dual_read_duration_ms) as i64)
        });
        event!(Level::INFO, enabled, ?duration_ms, "dual-read mode changed");
        self.store_state(state).await
    }

    pub async fn set_dual_write_mode(&self, enabled: bool, duration_ms: Option<u64>) -> Result<()> {
        let mut state = self.snapshot_state();
        state.dual_write_enabled = enabled;
        state.dual_write_end_time = enabled.then(|| {
            now_ms().saturating_add(duration_ms.unwrap_or(self.policy.dual_read_duration_ms) as i64)
        });
        event!(Level::INFO, enabled, ?duration_ms, "dual-write mode changed");
        self.store_state(state).await
    }

    pub async fn status(&self) -> Result<CompatStatus> {
        let state = self.snapshot_state();
        let now = now_ms();
        let migrated = MigratedKeys::load(&self.facade).await?;
        Ok(CompatStatus {
            dual_read_active: state.dual_read_active(now),
            dual_write_active: state.dual_write_active(now),
            state,
            migrated_keys: migrated.iter().collect(),
            current_version: self.chain.current_version(),
        })
    }
}
