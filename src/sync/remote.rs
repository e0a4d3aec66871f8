use super::types::SyncErrorType;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    pub server_version: Option<u64>,
    pub message: Option<String>,
}

/// Error returned by a [`RemotePersistence`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    /// HTTP-like status; `None` when the request never reached the server.
    pub status: Option<u16>,
    pub message: String,
    pub conflict: Option<ConflictInfo>,
}

impl RemoteFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            conflict: None,
        }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            conflict: None,
        }
    }

    pub fn conflict(server_version: Option<u64>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: Some(409),
            conflict: Some(ConflictInfo {
                server_version,
                message: Some(message.clone()),
            }),
            message,
        }
    }

    pub fn classify(&self) -> SyncErrorType {
        if self.conflict.is_some() {
            return SyncErrorType::Conflict;
        }
        match self.status {
            Some(409) => SyncErrorType::Conflict,
            Some(404) => SyncErrorType::NotFound,
            None | Some(408) | Some(429) => SyncErrorType::Network,
            Some(status) if status >= 500 => SyncErrorType::Network,
            Some(_) => SyncErrorType::Unknown,
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "remote returned {}: {}", status, self.message),
            None => write!(f, "remote unreachable: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteFailure {}

/// Remote persistence service the sync queue drains into.
#[async_trait]
pub trait RemotePersistence: Send + Sync {
    async fn create(&self, entity_type: &str, payload: &Value) -> Result<Value, RemoteFailure>;

    async fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteFailure>;

    async fn delete(&self, entity_type: &str, entity_id: &str) -> Result<(), RemoteFailure>;
}
