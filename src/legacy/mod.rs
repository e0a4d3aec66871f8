//! Recovery of datasets stored under pre-canonical key names.
//!
//! Older releases wrote the same datasets under prefixed, suffixed and
//! renamed keys. The adapter finds the first variant holding data, reshapes
//! it, writes it to the canonical key, records the key as migrated and then
//! removes every variant it found.

pub mod reshape;

use crate::core::{CanonicalKey, MIGRATED_KEYS_KEY, Result};
use crate::storage::{KvStore, StorageFacade, WriteFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

pub const LEGACY_PREFIXES: [&str; 3] = ["", "app_", "pv_"];
pub const LEGACY_SUFFIXES: [&str; 6] = ["", "_v2", "_v1", "_backup", "_old", "_temp"];

/// Base names each canonical dataset was stored under by earlier releases.
pub fn default_legacy_names(key: CanonicalKey) -> &'static [&'static str] {
    match key {
        CanonicalKey::Templates => &["templates", "prompt_templates", "saved_templates"],
        CanonicalKey::Workflows => &["workflows", "saved_workflows"],
        CanonicalKey::Snippets => &["snippets", "text_snippets"],
        CanonicalKey::Folders => &["folders", "template_folders"],
        CanonicalKey::UiPreferences => &["ui_preferences", "preferences", "ui_prefs"],
        CanonicalKey::UserSettings => &["user_settings", "settings"],
    }
}

/// Resolves a legacy (or canonical) key name to its canonical dataset.
pub fn canonical_for(legacy_key: &str) -> Option<CanonicalKey> {
    for prefix in LEGACY_PREFIXES.iter().rev() {
        let Some(rest) = legacy_key.strip_prefix(prefix) else {
            continue;
        };
        for suffix in LEGACY_SUFFIXES.iter().rev() {
            let Some(base) = rest.strip_suffix(suffix) else {
                continue;
            };
            let found = CanonicalKey::ALL
                .into_iter()
                .find(|key| default_legacy_names(*key).contains(&base));
            if found.is_some() {
                return found;
            }
        }
    }
    None
}

/// Datasets already brought over from legacy storage, persisted under `migrated_keys`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigratedKeys(BTreeSet<CanonicalKey>);

impl MigratedKeys {
    pub async fn load(facade: &StorageFacade) -> Result<Self> {
        match facade.get_value(MIGRATED_KEYS_KEY).await? {
            Some(Value::Null) | None => Ok(Self::default()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    pub async fn save(&self, facade: &StorageFacade) -> Result<()> {
        facade
            .set(
                MIGRATED_KEYS_KEY,
                serde_json::to_value(self)?,
                &WriteFlags::force_local(),
            )
            .await?;
        Ok(())
    }

    pub fn contains(&self, key: CanonicalKey) -> bool {
        self.0.contains(&key)
    }

    pub fn insert(&mut self, key: CanonicalKey) -> bool {
        self.0.insert(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = CanonicalKey> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What happened when one dataset was looked up in legacy storage.
#[derive(Debug, Clone, PartialEq)]
pub enum LegacyOutcome {
    Migrated {
        value: Value,
        /// Legacy keys that held data and were removed.
        sources: Vec<String>,
    },
    AlreadyMigrated,
    CanonicalPresent,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LegacyMigrationSummary {
    pub migrated: Vec<CanonicalKey>,
    pub failed: Vec<(CanonicalKey, String)>,
    pub skipped: Vec<CanonicalKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LegacyStatus {
    pub needed: bool,
    pub keys: Vec<CanonicalKey>,
}

pub struct LegacyAdapter {
    facade: Arc<StorageFacade>,
    legacy_store: Arc<dyn KvStore>,
    /// Legacy data lives next to canonical data, so bare canonical names are not legacy.
    shares_canonical_store: bool,
}

impl LegacyAdapter {
    /// Adapter reading legacy keys from the facade's own small store.
    pub fn new(facade: Arc<StorageFacade>) -> Self {
        let legacy_store = facade.small_store();
        Self {
            facade,
            legacy_store,
            shares_canonical_store: true,
        }
    }

    /// Adapter reading legacy keys from a separate store.
    pub fn with_store(facade: Arc<StorageFacade>, legacy_store: Arc<dyn KvStore>) -> Self {
        Self {
            facade,
            legacy_store,
            shares_canonical_store: false,
        }
    }

    pub fn legacy_store(&self) -> &Arc<dyn KvStore> {
        &self.legacy_store
    }

    /// Every legacy key name scanned for `key`, in priority order.
    pub fn candidates(&self, key: CanonicalKey) -> Vec<String> {
        let mut names = Vec::new();
        for base in default_legacy_names(key) {
            for prefix in LEGACY_PREFIXES {
                for suffix in LEGACY_SUFFIXES {
                    let name = format!("{}{}{}", prefix, base, suffix);
                    if self.shares_canonical_store
                        && CanonicalKey::ALL.iter().any(|k| k.as_str() == name)
                    {
                        continue;
                    }
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }

    /// Key dual-write mirrors into: the first scanned legacy name.
    pub fn primary_legacy_key(&self, key: CanonicalKey) -> Option<String> {
        self.candidates(key).into_iter().next()
    }

    /// Returns the migrated value for any legacy or canonical key name.
    pub async fn get(&self, legacy_key: &str) -> Result<Option<Value>> {
        let Some(key) = canonical_for(legacy_key) else {
            return Ok(None);
        };
        match self.migrate_key(key).await? {
            LegacyOutcome::Migrated { value, .. } => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    async fn skip_reason(&self, key: CanonicalKey) -> Result<Option<LegacyOutcome>> {
        if MigratedKeys::load(&self.facade).await?.contains(key) {
            return Ok(Some(LegacyOutcome::AlreadyMigrated));
        }
        match self.facade.get_value(key.as_str()).await? {
            Some(Value::Null) | None => Ok(None),
            Some(_) => Ok(Some(LegacyOutcome::CanonicalPresent)),
        }
    }

    async fn discover(&self, key: CanonicalKey) -> Result<Vec<(String, Vec<u8>)>> {
        let mut found = Vec::new();
        for name in self.candidates(key) {
            if let Some(bytes) = self.legacy_store.get(&name).await? {
                found.push((name, bytes));
            }
        }
        Ok(found)
    }

    /// Brings one dataset over from legacy storage when it is still needed.
    pub async fn migrate_key(&self, key: CanonicalKey) -> Result<LegacyOutcome> {
        self.migrate_key_inner(key)
            .instrument(info_span!("legacy.migrate_key", key = %key))
            .await
    }

    async fn migrate_key_inner(&self, key: CanonicalKey) -> Result<LegacyOutcome> {
        if let Some(outcome) = self.skip_reason(key).await? {
            return Ok(outcome);
        }

        let found = self.discover(key).await?;
        let Some((source, bytes)) = found.first() else {
            return Ok(LegacyOutcome::NotFound);
        };

        let value = reshape::reshape(key, reshape::parse_raw(bytes))?;
        self.facade
            .set(key.as_str(), value.clone(), &WriteFlags::default())
            .await?;

        let mut migrated = MigratedKeys::load(&self.facade).await?;
        migrated.insert(key);
        migrated.save(&self.facade).await?;

        let sources = found.iter().map(|(name, _)| name.clone()).collect::<Vec<_>>();
        for name in &sources {
            if let Err(err) = self.legacy_store.delete(name).await {
                event!(Level::WARN, key = %name, error = %err, "failed to remove legacy key");
            }
        }
        event!(
            Level::INFO,
            key = %key,
            source = %source,
            variants = sources.len(),
            "migrated legacy dataset"
        );
        Ok(LegacyOutcome::Migrated { value, sources })
    }

    /// Walks every canonical dataset once.
    pub async fn migrate_all(&self) -> LegacyMigrationSummary {
        let mut summary = LegacyMigrationSummary::default();
        for key in CanonicalKey::ALL {
            match self.migrate_key(key).await {
                Ok(LegacyOutcome::Migrated { .. }) => summary.migrated.push(key),
                Ok(_) => summary.skipped.push(key),
                Err(err) => {
                    event!(Level::ERROR, key = %key, error = %err, "legacy migration failed");
                    summary.failed.push((key, err.to_string()));
                }
            }
        }
        summary
    }

    /// Reports datasets that still have unmigrated legacy data.
    pub async fn check_migration_status(&self) -> Result<LegacyStatus> {
        let mut keys = Vec::new();
        for key in CanonicalKey::ALL {
            if self.skip_reason(key).await?.is_some() {
                continue;
            }
            if !self.discover(key).await?.is_empty() {
                keys.push(key);
            }
        }
        Ok(LegacyStatus {
            needed: !keys.is_empty(),
            keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use serde_json::json;

    fn adapter() -> (LegacyAdapter, Arc<MemoryKvStore>, Arc<StorageFacade>) {
        let facade = Arc::new(StorageFacade::in_memory());
        let legacy = Arc::new(MemoryKvStore::new("legacy"));
        (
            LegacyAdapter::with_store(facade.clone(), legacy.clone()),
            legacy,
            facade,
        )
    }

    #[test]
    fn resolves_prefixed_and_suffixed_names() {
        assert_eq!(canonical_for("app_templates_old"), Some(CanonicalKey::Templates));
        assert_eq!(canonical_for("pv_settings_v1"), Some(CanonicalKey::UserSettings));
        assert_eq!(canonical_for("ui_prefs"), Some(CanonicalKey::UiPreferences));
        assert_eq!(canonical_for("unrelated"), None);
    }

    #[test]
    fn shared_store_skips_bare_canonical_names() {
        let facade = Arc::new(StorageFacade::in_memory());
        let adapter = LegacyAdapter::new(facade);
        let names = adapter.candidates(CanonicalKey::Templates);
        assert!(!names.contains(&"templates".to_string()));
        assert!(names.contains(&"app_templates".to_string()));
    }

    #[tokio::test]
    async fn migrates_first_variant_and_removes_all() {
        let (adapter, legacy, facade) = adapter();
        legacy
            .set("app_templates", br#"[{"id":"1","title":"A"}]"#.to_vec())
            .await
            .unwrap();
        legacy
            .set("pv_templates_old", br#"[{"id":"old"}]"#.to_vec())
            .await
            .unwrap();

        let outcome = adapter.migrate_key(CanonicalKey::Templates).await.unwrap();
        let LegacyOutcome::Migrated { value, sources } = outcome else {
            panic!("expected migration");
        };
        assert_eq!(value[0]["name"], "A");
        assert_eq!(sources.len(), 2);
        assert!(legacy.is_empty().await);
        assert_eq!(facade.get_value("templates").await.unwrap(), Some(value));

        assert_eq!(
            adapter.migrate_key(CanonicalKey::Templates).await.unwrap(),
            LegacyOutcome::AlreadyMigrated
        );
    }

    #[tokio::test]
    async fn populated_canonical_key_is_left_alone() {
        let (adapter, legacy, facade) = adapter();
        facade
            .set("folders", json!([{"id": "f"}]), &WriteFlags::default())
            .await
            .unwrap();
        legacy.set("folders_old", b"[]".to_vec()).await.unwrap();

        let summary = adapter.migrate_all().await;
        assert!(summary.skipped.contains(&CanonicalKey::Folders));
        assert!(summary.migrated.is_empty());
        assert!(!adapter.check_migration_status().await.unwrap().needed);
    }

    #[tokio::test]
    async fn status_lists_pending_datasets_and_failures_are_reported() {
        let (adapter, legacy, _) = adapter();
        legacy.set("app_snippets", b"hello".to_vec()).await.unwrap();
        legacy.set("settings", b"not an object".to_vec()).await.unwrap();

        let status = adapter.check_migration_status().await.unwrap();
        assert!(status.needed);
        assert_eq!(
            status.keys,
            vec![CanonicalKey::Snippets, CanonicalKey::UserSettings]
        );

        let summary = adapter.migrate_all().await;
        assert_eq!(summary.migrated, vec![CanonicalKey::Snippets]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, CanonicalKey::UserSettings);
    }
}
