use super::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SCHEMA_VERSION_KEY: &str = "schema_version";
pub const MIGRATION_STATUS_KEY: &str = "migration_status";
pub const MIGRATED_KEYS_KEY: &str = "migrated_keys";
pub const MIGRATION_LOG_KEY: &str = "migration_log";
pub const MIGRATION_HISTORY_KEY: &str = "migration_history";
pub const MIGRATION_BLOCK_KEY: &str = "migration_block";
pub const BACKUP_METADATA_KEY: &str = "backup_metadata";
pub const BACKUP_KEY_PREFIX: &str = "backup_";
pub const SYNC_QUEUE_KEY: &str = "sync_queue";

/// Logical dataset names owned by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalKey {
    Templates,
    Workflows,
    Snippets,
    Folders,
    UiPreferences,
    UserSettings,
}

impl CanonicalKey {
    pub const ALL: [CanonicalKey; 6] = [
        CanonicalKey::Templates,
        CanonicalKey::Workflows,
        CanonicalKey::Snippets,
        CanonicalKey::Folders,
        CanonicalKey::UiPreferences,
        CanonicalKey::UserSettings,
    ];

    pub const COLLECTIONS: [CanonicalKey; 4] = [
        CanonicalKey::Templates,
        CanonicalKey::Workflows,
        CanonicalKey::Snippets,
        CanonicalKey::Folders,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Templates => "templates",
            Self::Workflows => "workflows",
            Self::Snippets => "snippets",
            Self::Folders => "folders",
            Self::UiPreferences => "ui_preferences",
            Self::UserSettings => "user_settings",
        }
    }

    /// Collections hold an array of identified records; the rest hold one object.
    pub fn is_collection(self) -> bool {
        matches!(
            self,
            Self::Templates | Self::Workflows | Self::Snippets | Self::Folders
        )
    }

    /// Entity name used for remote sync of a single record of this dataset.
    pub fn entity_type(self) -> &'static str {
        match self {
            Self::Templates => "template",
            Self::Workflows => "workflow",
            Self::Snippets => "snippet",
            Self::Folders => "folder",
            Self::UiPreferences => "ui_preferences",
            Self::UserSettings => "user_settings",
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalKey {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        CanonicalKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| VaultError::NotFound(format!("unknown canonical key '{}'", s)))
    }
}

pub fn backup_key(backup_id: &str) -> String {
    format!("{}{}", BACKUP_KEY_PREFIX, backup_id)
}
