use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, machine-readable classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    StorageQuota,
    Transform,
    Conflict,
    NotFound,
    Network,
    PayloadTooLarge,
    Storage,
    Serialization,
    Codec,
    Io,
    MigrationFailed,
    RollbackFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::StorageQuota => "storage_quota",
            Self::Transform => "transform",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Network => "network",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Storage => "storage",
            Self::Serialization => "serialization",
            Self::Codec => "codec",
            Self::Io => "io",
            Self::MigrationFailed => "migration_failed",
            Self::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage quota exceeded on {tier}: {message}")]
    StorageQuota { tier: String, message: String },

    #[error("Transform {from_version} -> {to_version} failed: {message}")]
    Transform {
        from_version: u32,
        to_version: u32,
        message: String,
    },

    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        server_version: Option<u64>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Payload of {size} bytes exceeds the {cap} byte cap")]
    PayloadTooLarge { size: usize, cap: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Migration run {run_id} failed ({kind}): {message}")]
    MigrationFailed {
        run_id: String,
        kind: ErrorKind,
        message: String,
        rolled_back: bool,
    },

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::StorageQuota { .. } => ErrorKind::StorageQuota,
            Self::Transform { .. } => ErrorKind::Transform,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Network(_) => ErrorKind::Network,
            Self::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Io(_) => ErrorKind::Io,
            Self::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            Self::RollbackFailed(_) => ErrorKind::RollbackFailed,
        }
    }

    /// Transient failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Storage | ErrorKind::Io
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for VaultError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Storage(format!("lock poisoned: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_for_taxonomy_variants() {
        let err = VaultError::Conflict {
            message: "stale".to_string(),
            server_version: Some(4),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.kind().as_str(), "conflict");
        assert!(!err.is_retryable());
        assert!(VaultError::Network("offline".into()).is_retryable());
    }

    #[test]
    fn serde_errors_convert() {
        let err: VaultError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
