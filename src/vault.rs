//! Wires the storage, legacy, compatibility, backup, migration and sync
//! components into one handle.

use crate::backup::BackupService;
use crate::compat::versioning::default_chain;
use crate::compat::{CompatState, CompatibilityLayer, LegacyApiShim};
use crate::config::VaultConfig;
use crate::core::Result;
use crate::legacy::LegacyAdapter;
use crate::migration::{MigrationRun, MigrationService, RunOptions};
use crate::storage::{
    ChangeBus, FileKvStore, KvStore, MemoryKvStore, StorageFacade, StorageTiers,
};
use crate::sync::{RemotePersistence, SyncQueue, spawn_sync_worker};
use crate::worker::BackgroundWorker;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Level, event};

/// Result of [`Vault::initialize`].
#[derive(Debug, Clone)]
pub struct VaultStartup {
    pub compat: CompatState,
    /// Present when `migration.run_on_startup` is set.
    pub migration: Option<MigrationRun>,
}

pub struct VaultBuilder {
    config: VaultConfig,
    tiers: Option<StorageTiers>,
    legacy_store: Option<Arc<dyn KvStore>>,
    remote: Option<Arc<dyn RemotePersistence>>,
    change_bus: Option<Arc<dyn ChangeBus>>,
}

impl VaultBuilder {
    pub fn new(config: VaultConfig) -> Self {
        Self {
            config,
            tiers: None,
            legacy_store: None,
            remote: None,
            change_bus: None,
        }
    }

    pub fn with_tiers(mut self, tiers: StorageTiers) -> Self {
        self.tiers = Some(tiers);
        self
    }

    /// Store holding legacy keys. Defaults to the small durable tier.
    pub fn with_legacy_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.legacy_store = Some(store);
        self
    }

    /// Enables the sync queue against `remote`.
    pub fn with_remote(mut self, remote: Arc<dyn RemotePersistence>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_change_bus(mut self, bus: Arc<dyn ChangeBus>) -> Self {
        self.change_bus = Some(bus);
        self
    }

    pub async fn build(self) -> Result<Vault> {
        self.config.validate()?;
        let config = self.config;

        let tiers = self.tiers.unwrap_or_else(StorageTiers::in_memory);
        let mut facade = StorageFacade::new(tiers, config.storage.clone());
        if let Some(bus) = self.change_bus {
            facade = facade.with_change_bus(bus);
        }
        let facade = Arc::new(facade);
        let replication = facade.spawn_replication_listener();

        let legacy = Arc::new(match self.legacy_store {
            Some(store) => LegacyAdapter::with_store(facade.clone(), store),
            None => LegacyAdapter::new(facade.clone()),
        });
        let chain = default_chain();
        chain.validate()?;

        let compat = Arc::new(CompatibilityLayer::new(
            facade.clone(),
            legacy.clone(),
            chain.clone(),
            config.compat.clone(),
        ));
        let shim = LegacyApiShim::new(compat.clone());
        let backups = Arc::new(BackupService::new(facade.clone(), config.backup.clone())?);

        let sync = match self.remote {
            Some(remote) => Some(Arc::new(
                SyncQueue::open(facade.clone(), remote, config.sync.clone()).await?,
            )),
            None => None,
        };

        let mut migrations = MigrationService::new(
            facade.clone(),
            legacy.clone(),
            chain,
            config.migration.clone(),
        )
        .with_backups(backups.clone());
        if let Some(queue) = &sync {
            migrations = migrations.with_sync_queue(queue.clone());
        }

        event!(
            Level::INFO,
            context = %facade.context_id(),
            sync = sync.is_some(),
            "vault assembled"
        );
        Ok(Vault {
            config,
            facade,
            legacy,
            compat,
            shim,
            backups,
            migrations: Arc::new(migrations),
            sync,
            replication,
        })
    }
}

pub struct Vault {
    config: VaultConfig,
    facade: Arc<StorageFacade>,
    legacy: Arc<LegacyAdapter>,
    compat: Arc<CompatibilityLayer>,
    shim: LegacyApiShim,
    backups: Arc<BackupService>,
    migrations: Arc<MigrationService>,
    sync: Option<Arc<SyncQueue>>,
    replication: Option<JoinHandle<()>>,
}

impl Vault {
    pub fn builder(config: VaultConfig) -> VaultBuilder {
        VaultBuilder::new(config)
    }

    pub async fn in_memory(config: VaultConfig) -> Result<Self> {
        VaultBuilder::new(config).build().await
    }

    /// Durable tiers under `root/small` and `root/large`; the ephemeral tier
    /// stays in memory.
    pub async fn open_dir(root: impl Into<PathBuf>, config: VaultConfig) -> Result<Self> {
        let root = root.into();
        let tiers = StorageTiers {
            ephemeral: Arc::new(MemoryKvStore::new("ephemeral")),
            small: Arc::new(FileKvStore::open("small", root.join("small")).await?),
            large: Arc::new(FileKvStore::open("large", root.join("large")).await?),
        };
        VaultBuilder::new(config).with_tiers(tiers).build().await
    }

    /// Loads compatibility state and, when configured, runs pending migrations.
    pub async fn initialize(&self) -> Result<VaultStartup> {
        let compat = self.compat.initialize().await?;
        let migration = if self.config.migration.run_on_startup {
            Some(
                self.migrations
                    .run_pending_migrations(&RunOptions::default())
                    .await?,
            )
        } else {
            None
        };
        Ok(VaultStartup { compat, migration })
    }

    /// Starts the background drain when a remote and an interval are configured.
    pub fn spawn_sync_worker(&self) -> Option<BackgroundWorker> {
        let queue = self.sync.clone()?;
        let interval_ms = self.config.sync.worker_interval_ms?;
        Some(spawn_sync_worker(queue, interval_ms))
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn facade(&self) -> &Arc<StorageFacade> {
        &self.facade
    }

    pub fn legacy(&self) -> &Arc<LegacyAdapter> {
        &self.legacy
    }

    pub fn compat(&self) -> &Arc<CompatibilityLayer> {
        &self.compat
    }

    pub fn shim(&self) -> &LegacyApiShim {
        &self.shim
    }

    pub fn backups(&self) -> &Arc<BackupService> {
        &self.backups
    }

    pub fn migrations(&self) -> &Arc<MigrationService> {
        &self.migrations
    }

    pub fn sync(&self) -> Option<&Arc<SyncQueue>> {
        self.sync.as_ref()
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if let Some(handle) = self.replication.take() {
            handle.abort();
        }
    }
}
