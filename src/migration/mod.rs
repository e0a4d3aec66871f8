//! Runs the pending legacy and version migrations as one guarded run.
//!
//! A run moves through [`MigrationPhase`]s: status check, optional backup,
//! step execution, integrity validation and recording. A failing step (in
//! non-progressive mode) or a failed validation restores the run's backup
//! and surfaces the failure to the caller. The rolled-back state is then
//! recorded under `migration_block`; later runs skip until the data changes.

pub mod integrity;
pub mod types;

pub use integrity::{IntegrityIssue, IntegrityIssueKind, IntegrityReport, check_integrity};
pub use types::{
    MigrationBlock, MigrationLogEntry, MigrationPhase, MigrationProgress, MigrationRun,
    MigrationStatus, PendingMigration, RunOptions, RunReason, StepAttempt, StepResult,
};

use crate::backup::{BackupService, RestoreOptions, checksum};
use crate::compat::versioning::{TransformChain, TransformStep, detect_version};
use crate::config::MigrationPolicy;
use crate::core::{
    CanonicalKey, ErrorKind, MIGRATION_BLOCK_KEY, MIGRATION_HISTORY_KEY, MIGRATION_LOG_KEY, Result,
    SCHEMA_VERSION_KEY, VaultError, canonical_json, now_ms, record_id,
};
use crate::legacy::{LegacyAdapter, LegacyOutcome, MigratedKeys};
use crate::storage::{ReadOptions, StorageFacade, WriteFlags};
use crate::sync::{NewOperation, SyncQueue};
use crate::worker::{BackgroundWorker, spawn_periodic};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Default, Clone, Copy)]
struct ProgressCounter {
    completed: usize,
    remaining: usize,
}

pub struct MigrationService {
    facade: Arc<StorageFacade>,
    legacy: Arc<LegacyAdapter>,
    chain: TransformChain,
    policy: MigrationPolicy,
    backups: Option<Arc<BackupService>>,
    sync: Option<Arc<SyncQueue>>,
    running: AtomicBool,
    phase: Mutex<MigrationPhase>,
    progress: Mutex<ProgressCounter>,
    /// Datasets brought in from legacy keys during the current run.
    recovered: Mutex<BTreeMap<CanonicalKey, Value>>,
}

/// Releases the run flag and returns the service to `Idle`.
struct RunGuard<'a> {
    service: &'a MigrationService,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.service.set_phase(MigrationPhase::Idle);
        self.service.running.store(false, Ordering::SeqCst);
    }
}

struct RunFailure {
    kind: ErrorKind,
    message: String,
}

impl MigrationService {
    pub fn new(
        facade: Arc<StorageFacade>,
        legacy: Arc<LegacyAdapter>,
        chain: TransformChain,
        policy: MigrationPolicy,
    ) -> Self {
        Self {
            facade,
            legacy,
            chain,
            policy,
            backups: None,
            sync: None,
            running: AtomicBool::new(false),
            phase: Mutex::new(MigrationPhase::Idle),
            progress: Mutex::new(ProgressCounter::default()),
            recovered: Mutex::new(BTreeMap::new()),
        }
    }

    /// Backups taken before a run and restored on rollback.
    pub fn with_backups(mut self, backups: Arc<BackupService>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Queue receiving records recovered from legacy keys.
    pub fn with_sync_queue(mut self, sync: Arc<SyncQueue>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn policy(&self) -> &MigrationPolicy {
        &self.policy
    }

    pub fn chain(&self) -> &TransformChain {
        &self.chain
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(MigrationPhase::Idle)
    }

    fn set_phase(&self, next: MigrationPhase) {
        if let Ok(mut phase) = self.phase.lock() {
            if *phase != next {
                event!(Level::DEBUG, from = ?*phase, to = ?next, "migration phase");
            }
            *phase = next;
        }
    }

    pub fn progress(&self) -> MigrationProgress {
        let counter = self.progress.lock().map(|c| *c).unwrap_or_default();
        let total = counter.completed + counter.remaining;
        let percent = if total == 0 {
            0.0
        } else {
            counter.completed as f64 / total as f64 * 100.0
        };
        MigrationProgress {
            completed: counter.completed,
            remaining: counter.remaining,
            percent,
        }
    }

    fn add_remaining(&self, units: usize) {
        if let Ok(mut counter) = self.progress.lock() {
            counter.remaining += units;
        }
    }

    fn complete_units(&self, units: usize) {
        if let Ok(mut counter) = self.progress.lock() {
            let units = units.min(counter.remaining);
            counter.remaining -= units;
            counter.completed += units;
        }
    }

    /// Stored `schema_version`. Unversioned vaults holding data (canonical or
    /// legacy) start from the oldest version; empty ones are current.
    pub async fn stored_version(&self) -> Result<u32> {
        let stored = self
            .facade
            .get(SCHEMA_VERSION_KEY, &ReadOptions::strict())
            .await?;
        if let Some(version) = stored
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
        {
            return Ok(version);
        }

        for key in CanonicalKey::ALL {
            if let Some(value) = self.facade.get(key.as_str(), &ReadOptions::strict()).await? {
                if !value.is_null() {
                    return Ok(crate::compat::versioning::OLDEST_SCHEMA_VERSION);
                }
            }
        }
        if self.legacy.check_migration_status().await?.needed {
            return Ok(crate::compat::versioning::OLDEST_SCHEMA_VERSION);
        }
        Ok(self.chain.current_version())
    }

    async fn write_schema_version(&self, version: u32) -> Result<()> {
        self.facade
            .set(
                SCHEMA_VERSION_KEY,
                Value::from(version),
                &WriteFlags::force_local(),
            )
            .await?;
        Ok(())
    }

    async fn pending_from(&self, current: u32) -> Result<Vec<PendingMigration>> {
        let mut pending = Vec::new();
        let legacy = self.legacy.check_migration_status().await?;
        if legacy.needed {
            pending.push(PendingMigration::Legacy { keys: legacy.keys });
        }
        for step in self.chain.resolve_chain(current)? {
            pending.push(PendingMigration::Version {
                from_version: step.from_version,
                to_version: step.to_version,
                description: step.description.clone(),
            });
        }
        Ok(pending)
    }

    /// Legacy datasets still to bring over, then the version ladder from the
    /// stored version.
    pub async fn get_pending_migrations(&self) -> Result<Vec<PendingMigration>> {
        let current = self.stored_version().await?;
        self.pending_from(current).await
    }

    pub async fn check_migration_status(&self) -> Result<MigrationStatus> {
        let current_version = self.stored_version().await?;
        let pending = self.pending_from(current_version).await?;
        let blocked = if pending.is_empty() {
            None
        } else {
            self.active_block().await?
        };
        Ok(MigrationStatus {
            needed: !pending.is_empty(),
            current_version,
            target_version: self.chain.current_version(),
            pending,
            blocked,
        })
    }

    /// Digest of every canonical dataset, the stored schema version and the
    /// legacy datasets still waiting.
    async fn data_fingerprint(&self) -> Result<String> {
        let mut snapshot = Map::new();
        for key in CanonicalKey::ALL {
            let value = self
                .facade
                .get(key.as_str(), &ReadOptions::strict())
                .await?
                .unwrap_or(Value::Null);
            snapshot.insert(key.as_str().to_string(), value);
        }
        let version = self
            .facade
            .get(SCHEMA_VERSION_KEY, &ReadOptions::strict())
            .await?
            .unwrap_or(Value::Null);
        snapshot.insert(SCHEMA_VERSION_KEY.to_string(), version);
        let legacy = self.legacy.check_migration_status().await?;
        snapshot.insert("legacy".to_string(), serde_json::to_value(&legacy.keys)?);
        Ok(checksum(canonical_json(&Value::Object(snapshot)).as_bytes()))
    }

    /// The stored block, if the data is still what the blocked run left behind.
    async fn active_block(&self) -> Result<Option<MigrationBlock>> {
        let block = match self
            .facade
            .get(MIGRATION_BLOCK_KEY, &ReadOptions::strict())
            .await?
        {
            Some(Value::Null) | None => return Ok(None),
            Some(value) => match serde_json::from_value::<MigrationBlock>(value) {
                Ok(block) => block,
                Err(err) => {
                    event!(Level::WARN, error = %err, "unreadable migration block, ignoring");
                    return Ok(None);
                }
            },
        };
        if block.fingerprint == self.data_fingerprint().await? {
            Ok(Some(block))
        } else {
            event!(Level::INFO, blocked_run = %block.run_id, "data changed since blocked run");
            Ok(None)
        }
    }

    async fn record_block(&self, run_id: &str, message: &str) {
        let block = match self.data_fingerprint().await {
            Ok(fingerprint) => MigrationBlock {
                run_id: run_id.to_string(),
                target_version: self.chain.current_version(),
                fingerprint,
                blocked_at: now_ms(),
                message: message.to_string(),
            },
            Err(err) => {
                event!(Level::WARN, error = %err, "could not fingerprint rolled-back data");
                return;
            }
        };
        let stored = match serde_json::to_value(&block) {
            Ok(value) => {
                self.facade
                    .set(MIGRATION_BLOCK_KEY, value, &WriteFlags::force_local())
                    .await
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = stored {
            event!(Level::WARN, error = %err, "failed to record migration block");
        }
    }

    async fn clear_block(&self) {
        match self.facade.get(MIGRATION_BLOCK_KEY, &ReadOptions::strict()).await {
            Ok(Some(Value::Null)) | Ok(None) => {}
            Ok(Some(_)) => {
                if let Err(err) = self.facade.delete(MIGRATION_BLOCK_KEY).await {
                    event!(Level::WARN, error = %err, "failed to clear migration block");
                }
            }
            Err(err) => event!(Level::WARN, error = %err, "failed to read migration block"),
        }
    }

    /// Checks every canonical dataset currently stored.
    pub async fn perform_integrity_check(&self) -> Result<IntegrityReport> {
        let mut datasets = BTreeMap::new();
        for key in CanonicalKey::ALL {
            match self.facade.get(key.as_str(), &ReadOptions::strict()).await? {
                Some(Value::Null) | None => {}
                Some(value) => {
                    datasets.insert(key, value);
                }
            }
        }
        let report = check_integrity(&datasets);
        event!(
            Level::INFO,
            valid = report.valid,
            checked = report.checked_records,
            issues = report.issues.len(),
            "integrity check finished"
        );
        Ok(report)
    }

    /// Runs every pending migration.
    ///
    /// A concurrent call returns a run with reason `AlreadyRunning`, and a run
    /// over data a previous run rolled back returns `Blocked` unless
    /// `options.force` is set. Failures that trigger a rollback are returned
    /// as `MigrationFailed` (or `RollbackFailed` when there is nothing to
    /// restore). Asking for a backup without a backup service is a
    /// validation error.
    pub async fn run_pending_migrations(&self, options: &RunOptions) -> Result<MigrationRun> {
        let run_id = uuid::Uuid::new_v4().to_string();
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            event!(Level::WARN, run_id = %run_id, "migration already running");
            let version = self.chain.current_version();
            return Ok(MigrationRun {
                run_id,
                started_at: now_ms(),
                duration_ms: 0,
                success: false,
                reason: RunReason::AlreadyRunning,
                from_version: version,
                to_version: version,
                steps: Vec::new(),
                migrated_count: 0,
                backup_id: None,
                rolled_back: false,
                integrity: None,
            });
        }
        let _guard = RunGuard { service: self };

        let span = info_span!("migration_run", run_id = %run_id);
        self.run(run_id, options).instrument(span).await
    }

    async fn run(&self, run_id: String, options: &RunOptions) -> Result<MigrationRun> {
        let started_at = now_ms();
        let clock = Instant::now();
        if let Ok(mut recovered) = self.recovered.lock() {
            recovered.clear();
        }
        if let Ok(mut counter) = self.progress.lock() {
            *counter = ProgressCounter::default();
        }

        self.set_phase(MigrationPhase::CheckingStatus);
        let from_version = self.stored_version().await?;
        let pending = self.pending_from(from_version).await?;

        let mut run = MigrationRun {
            run_id: run_id.clone(),
            started_at,
            duration_ms: 0,
            success: true,
            reason: RunReason::Completed,
            from_version,
            to_version: from_version,
            steps: Vec::new(),
            migrated_count: 0,
            backup_id: None,
            rolled_back: false,
            integrity: None,
        };

        if pending.is_empty() {
            self.set_phase(MigrationPhase::NoneNeeded);
            let stored = self
                .facade
                .get(SCHEMA_VERSION_KEY, &ReadOptions::strict())
                .await?;
            if stored.is_none_or(|value| value.is_null()) {
                self.write_schema_version(from_version).await?;
            }
            self.clear_block().await;
            run.reason = RunReason::NoneNeeded;
            run.duration_ms = clock.elapsed().as_millis() as u64;
            event!(Level::INFO, version = from_version, "no migrations pending");
            return Ok(run);
        }

        if !options.force {
            if let Some(block) = self.active_block().await? {
                event!(
                    Level::WARN,
                    blocked_run = %block.run_id,
                    "data unchanged since a rolled-back run; not migrating"
                );
                run.success = false;
                run.reason = RunReason::Blocked;
                run.duration_ms = clock.elapsed().as_millis() as u64;
                return Ok(run);
            }
        }

        let create_backup = options.create_backup.unwrap_or(self.policy.create_backup);
        if create_backup && self.backups.is_none() {
            return Err(VaultError::Validation(
                "migration requires a backup but no backup service is attached".to_string(),
            ));
        }

        let names = pending.iter().map(ToString::to_string).collect::<Vec<_>>();
        self.append_log(&run_id, "info", format!("pending: {}", names.join(", ")))
            .await;

        if create_backup {
            if let Some(backups) = &self.backups {
                self.set_phase(MigrationPhase::BackingUp);
                let meta = backups
                    .create_full_backup(&format!("before migration {}", run_id))
                    .await?;
                self.append_log(&run_id, "info", format!("backup {} created", meta.id))
                    .await;
                run.backup_id = Some(meta.id);
            }
        }

        self.set_phase(MigrationPhase::Executing);
        let mut version = from_version;
        let mut version_chain_intact = true;
        let mut failure: Option<RunFailure> = None;
        for step in &pending {
            let mut result = self.execute_single_migration(step).await;
            if result.success {
                if let Some(to_version) = step.target_version() {
                    if version_chain_intact {
                        match self.write_schema_version(to_version).await {
                            Ok(()) => version = to_version,
                            Err(err) => {
                                result.success = false;
                                result.error_kind = Some(err.kind());
                                result.error = Some(err.to_string());
                            }
                        }
                    }
                }
            }

            if result.success {
                run.migrated_count += result.records_migrated;
            } else {
                if step.target_version().is_some() {
                    version_chain_intact = false;
                }
                let message = format!(
                    "step {} failed: {}",
                    step,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                self.append_log(&run_id, "error", message.clone()).await;
                failure.get_or_insert(RunFailure {
                    kind: result.error_kind.unwrap_or(ErrorKind::MigrationFailed),
                    message,
                });
            }
            let stop = !result.success && !self.policy.progressive_mode;
            run.steps.push(result);
            if stop {
                break;
            }
        }
        run.to_version = version;

        if let Some(failure) = failure.as_ref().filter(|_| !self.policy.progressive_mode) {
            return Err(self.roll_back(run, clock, failure).await);
        }

        self.set_phase(MigrationPhase::Validating);
        let integrity = match self.perform_integrity_check().await {
            Ok(report) => report,
            Err(err) => {
                let failure = RunFailure {
                    kind: err.kind(),
                    message: format!("integrity check could not run: {}", err),
                };
                return Err(self.roll_back(run, clock, &failure).await);
            }
        };
        if !integrity.valid {
            let failure = RunFailure {
                kind: ErrorKind::Validation,
                message: format!(
                    "integrity check failed with {} issue(s): {}",
                    integrity.issues.len(),
                    integrity
                        .issues
                        .iter()
                        .map(|issue| issue.message.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
            };
            run.integrity = Some(integrity);
            return Err(self.roll_back(run, clock, &failure).await);
        }
        run.integrity = Some(integrity);

        self.set_phase(MigrationPhase::Recording);
        if let Some(failure) = failure {
            run.success = false;
            run.reason = RunReason::PartialFailure;
            event!(
                Level::WARN,
                error = %failure.message,
                "progressive migration finished with failures"
            );
        }
        run.duration_ms = clock.elapsed().as_millis() as u64;
        self.append_log(
            &run_id,
            if run.success { "info" } else { "warn" },
            format!(
                "run finished at v{} with {} record(s) migrated",
                run.to_version, run.migrated_count
            ),
        )
        .await;
        self.clear_block().await;
        self.record_history(&run).await;
        event!(
            Level::INFO,
            success = run.success,
            from = run.from_version,
            to = run.to_version,
            migrated = run.migrated_count,
            duration_ms = run.duration_ms,
            "migration run finished"
        );
        Ok(run)
    }

    /// Restores the run's backup (or the latest one) and builds the error the
    /// run surfaces.
    async fn roll_back(&self, mut run: MigrationRun, clock: Instant, failure: &RunFailure) -> VaultError {
        self.set_phase(MigrationPhase::RollingBack);
        event!(Level::ERROR, error = %failure.message, "migration failed; rolling back");
        run.success = false;
        run.reason = RunReason::RolledBack;

        let restored = self.restore_for_rollback(run.backup_id.as_deref()).await;
        run.duration_ms = clock.elapsed().as_millis() as u64;

        let error = match restored {
            Ok(backup_id) => {
                run.rolled_back = true;
                run.backup_id = Some(backup_id.clone());
                self.append_log(
                    &run.run_id,
                    "warn",
                    format!("rolled back to backup {}", backup_id),
                )
                .await;
                VaultError::MigrationFailed {
                    run_id: run.run_id.clone(),
                    kind: failure.kind,
                    message: failure.message.clone(),
                    rolled_back: true,
                }
            }
            Err(err) => {
                self.append_log(&run.run_id, "error", format!("rollback failed: {}", err))
                    .await;
                VaultError::RollbackFailed(format!(
                    "migration {} failed ({}) and could not be rolled back: {}",
                    run.run_id, failure.message, err
                ))
            }
        };
        self.record_block(&run.run_id, &failure.message).await;
        self.record_history(&run).await;
        error
    }

    async fn restore_for_rollback(&self, backup_id: Option<&str>) -> Result<String> {
        let backups = self
            .backups
            .as_ref()
            .ok_or_else(|| VaultError::NotFound("no backup service attached".to_string()))?;
        let backup_id = match backup_id {
            Some(id) => id.to_string(),
            None => backups
                .latest_backup()
                .await?
                .map(|meta| meta.id)
                .ok_or_else(|| VaultError::NotFound("no backup to restore".to_string()))?,
        };
        backups
            .restore_backup(
                &backup_id,
                &RestoreOptions {
                    safety_backup: false,
                },
            )
            .await?;
        self.reseed_recovered().await?;
        Ok(backup_id)
    }

    /// Legacy keys consumed by this run are gone, so their recovered data is
    /// written back on top of the restored snapshot.
    async fn reseed_recovered(&self) -> Result<()> {
        let recovered = self.recovered.lock()?.clone();
        if recovered.is_empty() {
            return Ok(());
        }
        let mut migrated = MigratedKeys::load(&self.facade).await?;
        for (key, value) in recovered {
            self.facade
                .set(key.as_str(), value, &WriteFlags::default())
                .await?;
            migrated.insert(key);
        }
        migrated.save(&self.facade).await
    }

    /// Runs one step with retries. Never fails; the outcome is in the result.
    pub async fn execute_single_migration(&self, step: &PendingMigration) -> StepResult {
        let span = info_span!("migration_step", step = %step);
        self.execute_with_retries(step).instrument(span).await
    }

    async fn execute_with_retries(&self, step: &PendingMigration) -> StepResult {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempts = Vec::new();
        let mut records_migrated = 0usize;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let clock = Instant::now();
            let outcome = match step {
                PendingMigration::Legacy { .. } => self.run_legacy_step(&mut records_migrated).await,
                PendingMigration::Version {
                    from_version,
                    to_version,
                    ..
                } => {
                    self.run_version_step(*from_version, *to_version, &mut records_migrated)
                        .await
                }
            };
            let duration_ms = clock.elapsed().as_millis() as u64;

            match outcome {
                Ok(()) => {
                    attempts.push(StepAttempt {
                        attempt,
                        duration_ms,
                        error: None,
                    });
                    event!(Level::INFO, attempt, records = records_migrated, "migration step done");
                    return StepResult {
                        step: step.clone(),
                        success: true,
                        attempts,
                        records_migrated,
                        error: None,
                        error_kind: None,
                    };
                }
                Err(err) => {
                    attempts.push(StepAttempt {
                        attempt,
                        duration_ms,
                        error: Some(err.to_string()),
                    });
                    if !err.is_retryable() || attempt >= max_attempts {
                        event!(Level::ERROR, attempt, error = %err, "migration step failed");
                        return StepResult {
                            step: step.clone(),
                            success: false,
                            attempts,
                            records_migrated,
                            error: Some(err.to_string()),
                            error_kind: Some(err.kind()),
                        };
                    }
                    let delay = self.policy.retry_delay_ms.saturating_mul(u64::from(attempt));
                    event!(Level::WARN, attempt, delay_ms = delay, error = %err, "retrying migration step");
                    sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn run_legacy_step(&self, migrated: &mut usize) -> Result<()> {
        let mut first_error = None;
        for key in CanonicalKey::ALL {
            match self.legacy.migrate_key(key).await {
                Ok(LegacyOutcome::Migrated { value, .. }) => {
                    *migrated += 1;
                    self.add_remaining(1);
                    self.complete_units(1);
                    if let Ok(mut recovered) = self.recovered.lock() {
                        recovered.insert(key, value.clone());
                    }
                    self.enqueue_recovered(key, &value).await;
                }
                Ok(_) => {}
                Err(err) => {
                    event!(Level::WARN, key = %key, error = %err, "legacy dataset not migrated");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn enqueue_recovered(&self, key: CanonicalKey, value: &Value) {
        if !self.policy.sync_legacy_to_remote {
            return;
        }
        let Some(sync) = &self.sync else {
            return;
        };
        let records = match value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        for record in records {
            let entity_id = if key.is_collection() {
                record_id(&record).unwrap_or_default()
            } else {
                key.as_str().to_string()
            };
            let operation = NewOperation::create(key.entity_type(), entity_id, record);
            if let Err(err) = sync.enqueue(operation).await {
                event!(Level::WARN, key = %key, error = %err, "failed to queue recovered record");
            }
        }
    }

    async fn run_version_step(&self, from_version: u32, to_version: u32, migrated: &mut usize) -> Result<()> {
        let step = self
            .chain
            .steps()
            .iter()
            .find(|step| step.from_version == from_version && step.to_version == to_version)
            .ok_or_else(|| VaultError::Transform {
                from_version,
                to_version,
                message: "step is not part of the transform chain".to_string(),
            })?;

        for key in CanonicalKey::ALL {
            let Some(value) = self.facade.get(key.as_str(), &ReadOptions::strict()).await? else {
                continue;
            };
            let due = count_at_version(key, &value, from_version);
            if due == 0 {
                continue;
            }
            self.add_remaining(due);

            let upgraded = match value {
                Value::Array(items) if self.policy.progressive_mode => {
                    self.apply_in_batches(step, key, items).await?
                }
                other => {
                    let upgraded = self.chain.apply_step(step, key, other)?;
                    self.complete_units(due);
                    upgraded
                }
            };
            self.facade
                .set(key.as_str(), upgraded, &WriteFlags::default())
                .await?;
            *migrated += due;
            event!(Level::DEBUG, key = %key, records = due, "dataset upgraded");
        }
        Ok(())
    }

    async fn apply_in_batches(&self, step: &TransformStep, key: CanonicalKey, items: Vec<Value>) -> Result<Value> {
        let batch_size = self.policy.batch_size.max(1);
        let batch_count = items.len().div_ceil(batch_size);
        let mut out = Vec::with_capacity(items.len());
        for (index, batch) in items.chunks(batch_size).enumerate() {
            let batch = Value::Array(batch.to_vec());
            let due = count_at_version(key, &batch, step.from_version);
            if let Value::Array(upgraded) = self.chain.apply_step(step, key, batch)? {
                out.extend(upgraded);
            }
            self.complete_units(due);
            if index + 1 < batch_count && self.policy.batch_pause_ms > 0 {
                sleep(Duration::from_millis(self.policy.batch_pause_ms)).await;
            }
        }
        Ok(Value::Array(out))
    }

    pub async fn history(&self) -> Result<Vec<MigrationRun>> {
        self.load_list(MIGRATION_HISTORY_KEY).await
    }

    pub async fn log(&self) -> Result<Vec<MigrationLogEntry>> {
        self.load_list(MIGRATION_LOG_KEY).await
    }

    async fn load_list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>> {
        match self.facade.get(key, &ReadOptions::strict()).await? {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    async fn push_bounded<T: Serialize + DeserializeOwned>(&self, key: &str, entry: T, limit: usize) -> Result<()> {
        let mut entries = self.load_list::<T>(key).await?;
        entries.push(entry);
        if entries.len() > limit {
            let excess = entries.len() - limit;
            entries.drain(..excess);
        }
        self.facade
            .set(key, serde_json::to_value(&entries)?, &WriteFlags::force_local())
            .await?;
        Ok(())
    }

    async fn append_log(&self, run_id: &str, level: &str, message: String) {
        let entry = MigrationLogEntry {
            timestamp: now_ms(),
            run_id: run_id.to_string(),
            level: level.to_string(),
            message,
        };
        if let Err(err) = self
            .push_bounded(MIGRATION_LOG_KEY, entry, self.policy.log_limit)
            .await
        {
            event!(Level::WARN, error = %err, "failed to append migration log");
        }
    }

    async fn record_history(&self, run: &MigrationRun) {
        if let Err(err) = self
            .push_bounded(MIGRATION_HISTORY_KEY, run.clone(), self.policy.history_limit)
            .await
        {
            event!(Level::WARN, error = %err, "failed to record migration history");
        }
    }
}

fn count_at_version(key: CanonicalKey, value: &Value, version: u32) -> usize {
    match value {
        Value::Array(items) if key.is_collection() => items
            .iter()
            .filter_map(Value::as_object)
            .filter(|record| detect_version(key, record) == version)
            .count(),
        Value::Object(record) if !key.is_collection() => {
            usize::from(detect_version(key, record) == version)
        }
        _ => 0,
    }
}

/// Periodically runs pending migrations for `service`.
pub fn spawn_migration_worker(service: Arc<MigrationService>, interval_ms: u64) -> BackgroundWorker {
    spawn_periodic("migration", interval_ms, move || {
        let service = service.clone();
        async move {
            match service.check_migration_status().await {
                Ok(status) if status.needed && status.blocked.is_none() => {
                    if let Err(err) = service.run_pending_migrations(&RunOptions::default()).await {
                        event!(Level::ERROR, error = %err, "background migration failed");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    event!(Level::WARN, error = %err, "migration status check failed");
                }
            }
        }
    })
}
