use super::integrity::IntegrityReport;
use crate::core::{CanonicalKey, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Migration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    CheckingStatus,
    NoneNeeded,
    BackingUp,
    Executing,
    Validating,
    Recording,
    RollingBack,
}

/// One unit of work reported by `get_pending_migrations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingMigration {
    /// Datasets that still have data under legacy keys.
    Legacy { keys: Vec<CanonicalKey> },
    Version {
        from_version: u32,
        to_version: u32,
        description: String,
    },
}

impl PendingMigration {
    pub fn target_version(&self) -> Option<u32> {
        match self {
            Self::Legacy { .. } => None,
            Self::Version { to_version, .. } => Some(*to_version),
        }
    }
}

impl fmt::Display for PendingMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy { keys } => {
                let names = keys.iter().map(|key| key.as_str()).collect::<Vec<_>>();
                write!(f, "legacy[{}]", names.join(","))
            }
            Self::Version {
                from_version,
                to_version,
                ..
            } => write!(f, "v{}->v{}", from_version, to_version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAttempt {
    pub attempt: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: PendingMigration,
    pub success: bool,
    pub attempts: Vec<StepAttempt>,
    /// Records (or datasets, for legacy steps) actually changed.
    pub records_migrated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    Completed,
    NoneNeeded,
    AlreadyRunning,
    /// Progressive run where some steps failed without failing validation.
    PartialFailure,
    RolledBack,
    /// A previous run rolled back and the data has not changed since.
    Blocked,
}

/// One execution of the pending step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    pub run_id: String,
    pub started_at: i64,
    pub duration_ms: u64,
    pub success: bool,
    pub reason: RunReason,
    pub from_version: u32,
    pub to_version: u32,
    pub steps: Vec<StepResult>,
    pub migrated_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    pub rolled_back: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub needed: bool,
    pub current_version: u32,
    pub target_version: u32,
    pub pending: Vec<PendingMigration>,
    /// Set after a rolled-back run until the data changes or a run is forced.
    pub blocked: Option<MigrationBlock>,
}

/// Written when a run rolls back, so the same data is not migrated (and
/// backed up) again on every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationBlock {
    pub run_id: String,
    pub target_version: u32,
    /// Digest of the datasets and pending legacy keys at rollback time.
    pub fingerprint: String,
    pub blocked_at: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationProgress {
    pub completed: usize,
    pub remaining: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationLogEntry {
    pub timestamp: i64,
    pub run_id: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides `MigrationPolicy::create_backup` for this run.
    pub create_backup: Option<bool>,
    /// Run even if a previous rollback blocked the same data.
    pub force: bool,
}
