// ============================================================================
// VaultSync Library
// ============================================================================

pub mod backup;
pub mod compat;
pub mod config;
pub mod core;
pub mod legacy;
pub mod migration;
pub mod storage;
pub mod sync;
pub mod vault;
pub mod worker;

// Re-export main types for convenience
pub use core::{CanonicalKey, ErrorKind, Result, VaultError};
pub use config::{
    BackupPolicy, CompatPolicy, MigrationPolicy, StoragePolicy, SyncPolicy, VaultConfig,
};
pub use vault::{Vault, VaultBuilder, VaultStartup};

pub use backup::{BackupMetadata, BackupService, BackupType, RestoreOptions};
pub use compat::{CompatibilityLayer, GetOptions, LegacyApiShim, TransformChain, TransformStep};
pub use legacy::LegacyAdapter;
pub use migration::{
    IntegrityReport, MigrationBlock, MigrationPhase, MigrationRun, MigrationService, RunOptions,
    RunReason, spawn_migration_worker,
};
pub use storage::{
    BroadcastChangeBus, FileKvStore, KvStore, MemoryKvStore, ReadOptions, StorageFacade,
    StorageTiers, WriteFlags,
};
pub use sync::{
    NewOperation, RemoteFailure, RemotePersistence, SyncQueue, spawn_sync_worker,
};
pub use worker::BackgroundWorker;
