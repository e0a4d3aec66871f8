use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    /// Dispatch order when no explicit priority is set: create > update > delete.
    pub fn derived_priority(self) -> i32 {
        match self {
            Self::Create => 3,
            Self::Update => 2,
            Self::Delete => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorType {
    Conflict,
    NotFound,
    Network,
    Unknown,
}

impl SyncErrorType {
    /// Failures that another attempt cannot fix.
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::Conflict | Self::NotFound)
    }
}

/// One queued mutation for the remote persistence service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub status: OperationStatus,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<SyncErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl SyncOperation {
    pub fn effective_priority(&self) -> i32 {
        self.priority
            .unwrap_or_else(|| self.op_type.derived_priority())
    }

    pub fn targets(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.status == OperationStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

/// Caller-supplied part of a [`SyncOperation`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Option<Value>,
    pub priority: Option<i32>,
}

impl NewOperation {
    pub fn create(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            op_type: OperationType::Create,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload: Some(payload),
            priority: None,
        }
    }

    pub fn update(entity_type: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            op_type: OperationType::Update,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload: Some(payload),
            priority: None,
        }
    }

    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            op_type: OperationType::Delete,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload: None,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// How [`SyncQueue::enqueue`](super::SyncQueue::enqueue) applied an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(String),
    /// Folded into an existing pending operation with this id.
    Merged(String),
    /// A delete cancelled an unflushed create; `removed` entries were dropped.
    Cancelled { removed: usize },
    /// An identical pending delete already exists.
    Deduplicated(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_error: BTreeMap<String, usize>,
    pub oldest_pending: Option<i64>,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainSkip {
    Offline,
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub collected: usize,
    pub skipped: Option<DrainSkip>,
}
