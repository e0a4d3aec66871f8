pub mod error;
pub mod keys;
pub mod record;

pub use error::{ErrorKind, Result, VaultError};
pub use keys::{
    BACKUP_KEY_PREFIX, BACKUP_METADATA_KEY, CanonicalKey, MIGRATED_KEYS_KEY, MIGRATION_BLOCK_KEY,
    MIGRATION_HISTORY_KEY, MIGRATION_LOG_KEY, MIGRATION_STATUS_KEY, SCHEMA_VERSION_KEY,
    SYNC_QUEUE_KEY, backup_key,
};
pub use record::{RecordMap, VERSION_FIELD, canonical_eq, canonical_json, now_iso, now_ms, record_id};
