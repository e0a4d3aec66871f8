//! Durable queue of remote mutations, drained while online.
//!
//! The queue lives in memory behind a mutex and is written through to the
//! `sync_queue` key after every change. The mutex is never held across a
//! remote call; operations being dispatched are tracked as in flight and
//! excluded from merging and cancellation.

pub mod remote;
pub mod types;

pub use remote::{ConflictInfo, RemoteFailure, RemotePersistence};
pub use types::{
    DrainReport, DrainSkip, EnqueueOutcome, NewOperation, OperationStatus, OperationType,
    QueueStats, SyncErrorType, SyncOperation,
};

use crate::config::SyncPolicy;
use crate::core::{Result, SYNC_QUEUE_KEY, now_ms};
use crate::storage::{ReadOptions, StorageFacade, WriteFlags};
use crate::worker::{BackgroundWorker, spawn_periodic};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

#[derive(Default)]
struct QueueState {
    operations: Vec<SyncOperation>,
    in_flight: HashSet<String>,
}

impl QueueState {
    fn is_open(&self, op: &SyncOperation) -> bool {
        op.status == OperationStatus::Pending && !self.in_flight.contains(&op.id)
    }
}

pub struct SyncQueue {
    facade: Arc<StorageFacade>,
    remote: Arc<dyn RemotePersistence>,
    policy: SyncPolicy,
    state: Mutex<QueueState>,
    online: AtomicBool,
    draining: AtomicBool,
}

/// Clears the drain flag when a drain ends, including on cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncQueue {
    /// Loads the persisted queue. Starts online.
    pub async fn open(
        facade: Arc<StorageFacade>,
        remote: Arc<dyn RemotePersistence>,
        policy: SyncPolicy,
    ) -> Result<Self> {
        let operations = match facade.get(SYNC_QUEUE_KEY, &ReadOptions::strict()).await? {
            Some(Value::Null) | None => Vec::new(),
            Some(value) => serde_json::from_value::<Vec<SyncOperation>>(value)?,
        };
        event!(
            Level::INFO,
            operations = operations.len(),
            "sync queue loaded"
        );
        Ok(Self {
            facade,
            remote,
            policy,
            state: Mutex::new(QueueState {
                operations,
                in_flight: HashSet::new(),
            }),
            online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records connectivity. Going online does not drain by itself; the
    /// worker or the caller triggers [`process_queue`](Self::process_queue).
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            event!(Level::INFO, online, "sync connectivity changed");
        }
    }

    async fn persist(&self, operations: &[SyncOperation]) -> Result<()> {
        self.facade
            .set(
                SYNC_QUEUE_KEY,
                serde_json::to_value(operations)?,
                &WriteFlags::force_local(),
            )
            .await?;
        Ok(())
    }

    /// Adds an operation, merging or cancelling against pending entries for
    /// the same entity. If the queue cannot be persisted the in-memory queue
    /// is left as it was and the error is returned.
    pub async fn enqueue(&self, operation: NewOperation) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        let snapshot = state.operations.clone();
        let outcome = match operation.op_type {
            OperationType::Create => push(&mut state, operation),
            OperationType::Update => merge_update(&mut state, operation),
            OperationType::Delete => apply_delete(&mut state, operation),
        };
        if let Err(err) = self.persist(&state.operations).await {
            state.operations = snapshot;
            event!(Level::WARN, error = %err, "sync queue not persisted; enqueue undone");
            return Err(err);
        }
        event!(Level::DEBUG, outcome = ?outcome, "sync operation enqueued");
        Ok(outcome)
    }

    /// Dispatches every due pending operation once, highest priority first.
    ///
    /// Never fails: remote and persistence errors are recorded on the
    /// operations and in the returned report. A drain already in progress or
    /// an offline queue makes this a no-op.
    pub async fn process_queue(&self) -> DrainReport {
        if !self.is_online() {
            return DrainReport {
                skipped: Some(DrainSkip::Offline),
                ..DrainReport::default()
            };
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return DrainReport {
                skipped: Some(DrainSkip::AlreadyRunning),
                ..DrainReport::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let span = info_span!("sync_drain");
        self.drain().instrument(span).await
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let order = {
            let state = self.state.lock().await;
            let now = now_ms();
            let mut due = state
                .operations
                .iter()
                .filter(|op| op.is_due(now) && state.is_open(op))
                .collect::<Vec<_>>();
            due.sort_by(|a, b| {
                b.effective_priority()
                    .cmp(&a.effective_priority())
                    .then(a.timestamp.cmp(&b.timestamp))
            });
            due.into_iter().map(|op| op.id.clone()).collect::<Vec<_>>()
        };

        for id in order {
            if !self.is_online() {
                event!(Level::INFO, "went offline mid-drain; stopping");
                break;
            }

            let operation = {
                let mut state = self.state.lock().await;
                let Some(index) = state
                    .operations
                    .iter()
                    .position(|op| op.id == id && op.status == OperationStatus::Pending)
                else {
                    continue;
                };
                let op = state.operations[index].clone();
                if waits_on_create(&state.operations[..index], &op) {
                    event!(Level::DEBUG, op_id = %op.id, "delete held until its create is sent");
                    continue;
                }
                state.in_flight.insert(op.id.clone());
                op
            };

            report.dispatched += 1;
            let outcome = self.dispatch(&operation).await;

            let mut state = self.state.lock().await;
            state.in_flight.remove(&id);
            let Some(op) = state.operations.iter_mut().find(|op| op.id == id) else {
                continue;
            };
            match outcome {
                Ok(()) => {
                    op.status = OperationStatus::Completed;
                    op.completed_at = Some(now_ms());
                    op.next_retry_at = None;
                    op.error_type = None;
                    op.last_error = None;
                    report.succeeded += 1;
                }
                Err(failure) => {
                    let error_type = failure.classify();
                    op.retries += 1;
                    op.error_type = Some(error_type);
                    op.last_error = Some(failure.to_string());
                    if error_type.is_permanent() || op.retries >= self.policy.max_retries {
                        op.status = OperationStatus::Failed;
                        op.next_retry_at = None;
                        report.failed += 1;
                        event!(
                            Level::WARN,
                            op_id = %op.id,
                            entity = %op.entity_id,
                            error_type = ?error_type,
                            retries = op.retries,
                            "sync operation failed"
                        );
                    } else {
                        op.next_retry_at =
                            Some(now_ms() + backoff_delay_ms(&self.policy, op.retries) as i64);
                        report.retried += 1;
                        event!(
                            Level::DEBUG,
                            op_id = %op.id,
                            retries = op.retries,
                            "sync operation scheduled for retry"
                        );
                    }
                }
            }
            if let Err(err) = self.persist(&state.operations).await {
                event!(Level::WARN, error = %err, "failed to persist sync queue");
            }
        }

        match self.garbage_collect().await {
            Ok(collected) => report.collected = collected,
            Err(err) => event!(Level::WARN, error = %err, "sync garbage collection failed"),
        }
        event!(
            Level::INFO,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            "sync drain finished"
        );
        report
    }

    async fn dispatch(&self, operation: &SyncOperation) -> std::result::Result<(), RemoteFailure> {
        let payload = operation
            .payload
            .clone()
            .unwrap_or_else(|| json!({ "id": operation.entity_id }));
        match operation.op_type {
            OperationType::Create => self
                .remote
                .create(&operation.entity_type, &payload)
                .await
                .map(|_| ()),
            OperationType::Update => self
                .remote
                .update(&operation.entity_type, &operation.entity_id, &payload)
                .await
                .map(|_| ()),
            OperationType::Delete => {
                self.remote
                    .delete(&operation.entity_type, &operation.entity_id)
                    .await
            }
        }
    }

    /// Resets failed operations still under the retry ceiling to pending.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut reset = 0usize;
        for op in state.operations.iter_mut() {
            if op.status == OperationStatus::Failed && op.retries < self.policy.max_retries {
                op.status = OperationStatus::Pending;
                op.next_retry_at = None;
                reset += 1;
            }
        }
        if reset > 0 {
            self.persist(&state.operations).await?;
        }
        Ok(reset)
    }

    /// Drops completed operations older than the retention window.
    pub async fn garbage_collect(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let cutoff = now_ms() - self.policy.completed_retention_ms as i64;
        let before = state.operations.len();
        state.operations.retain(|op| {
            !(op.status == OperationStatus::Completed
                && op.completed_at.unwrap_or(op.timestamp) <= cutoff)
        });
        let removed = before - state.operations.len();
        if removed > 0 {
            self.persist(&state.operations).await?;
            event!(Level::DEBUG, removed, "collected completed sync operations");
        }
        Ok(removed)
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total: state.operations.len(),
            in_flight: state.in_flight.len(),
            online: self.is_online(),
            ..QueueStats::default()
        };
        for op in &state.operations {
            match op.status {
                OperationStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending = Some(
                        stats
                            .oldest_pending
                            .map_or(op.timestamp, |oldest| oldest.min(op.timestamp)),
                    );
                }
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
            }
            *stats.by_type.entry(op.op_type.as_str().to_string()).or_default() += 1;
            if let Some(error_type) = op.error_type {
                let name = serde_json::to_value(error_type)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_default();
                *stats.by_error.entry(name).or_default() += 1;
            }
        }
        stats
    }

    /// Snapshot of all queued operations, in insertion order.
    pub async fn operations(&self) -> Vec<SyncOperation> {
        self.state.lock().await.operations.clone()
    }

    pub async fn pending_for(&self, entity_type: &str, entity_id: &str) -> Vec<SyncOperation> {
        let state = self.state.lock().await;
        state
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Pending && op.targets(entity_type, entity_id))
            .cloned()
            .collect()
    }
}

/// Retry delay after `retries` failed attempts, capped at `max_delay_ms`.
pub fn backoff_delay_ms(policy: &SyncPolicy, retries: u32) -> u64 {
    policy
        .base_delay_ms
        .saturating_mul(u64::from(retries))
        .min(policy.max_delay_ms)
}

/// Drains `queue` every `interval_ms` while it is online.
pub fn spawn_sync_worker(queue: Arc<SyncQueue>, interval_ms: u64) -> BackgroundWorker {
    spawn_periodic("sync", interval_ms, move || {
        let queue = queue.clone();
        async move {
            if queue.is_online() {
                queue.process_queue().await;
            }
        }
    })
}

fn push(state: &mut QueueState, operation: NewOperation) -> EnqueueOutcome {
    let id = uuid::Uuid::new_v4().to_string();
    // Strictly increasing timestamps keep FIFO order within a priority.
    let last = state.operations.iter().map(|op| op.timestamp).max();
    let timestamp = match last {
        Some(last) if last >= now_ms() => last + 1,
        _ => now_ms(),
    };
    state.operations.push(SyncOperation {
        id: id.clone(),
        op_type: operation.op_type,
        entity_type: operation.entity_type,
        entity_id: operation.entity_id,
        payload: operation.payload,
        status: OperationStatus::Pending,
        retries: 0,
        error_type: None,
        last_error: None,
        timestamp,
        next_retry_at: None,
        priority: operation.priority,
        completed_at: None,
    });
    EnqueueOutcome::Queued(id)
}

fn merge_payload(target: &mut Option<Value>, update: Option<Value>) {
    let Some(update) = update else {
        return;
    };
    match (target.as_mut(), update) {
        (Some(Value::Object(existing)), Value::Object(fields)) => {
            for (field, value) in fields {
                existing.insert(field, value);
            }
        }
        (_, update) => *target = Some(update),
    }
}

fn merge_update(state: &mut QueueState, operation: NewOperation) -> EnqueueOutcome {
    let target = state
        .operations
        .iter()
        .position(|op| {
            state.is_open(op)
                && op.op_type == OperationType::Update
                && op.targets(&operation.entity_type, &operation.entity_id)
        })
        .or_else(|| {
            state.operations.iter().position(|op| {
                state.is_open(op)
                    && op.op_type == OperationType::Create
                    && op.targets(&operation.entity_type, &operation.entity_id)
            })
        });

    let Some(index) = target else {
        return push(state, operation);
    };
    let existing = &mut state.operations[index];
    merge_payload(&mut existing.payload, operation.payload);
    if let Some(priority) = operation.priority {
        existing.priority = Some(existing.priority.map_or(priority, |p| p.max(priority)));
    }
    EnqueueOutcome::Merged(existing.id.clone())
}

fn apply_delete(state: &mut QueueState, operation: NewOperation) -> EnqueueOutcome {
    let entity_type = operation.entity_type.as_str();
    let entity_id = operation.entity_id.as_str();

    let pending_create = state.operations.iter().any(|op| {
        state.is_open(op) && op.op_type == OperationType::Create && op.targets(entity_type, entity_id)
    });
    // Anything dispatched at least once may exist on the server, even if the
    // attempt reported a failure.
    let reached_remote = state.operations.iter().any(|op| {
        op.targets(entity_type, entity_id)
            && (op.retries > 0
                || op.status != OperationStatus::Pending
                || state.in_flight.contains(&op.id))
    });

    if pending_create && !reached_remote {
        let before = state.operations.len();
        let in_flight = &state.in_flight;
        state.operations.retain(|op| {
            !(op.targets(entity_type, entity_id)
                && op.status == OperationStatus::Pending
                && !in_flight.contains(&op.id))
        });
        return EnqueueOutcome::Cancelled {
            removed: before - state.operations.len(),
        };
    }

    let in_flight = &state.in_flight;
    state.operations.retain(|op| {
        !(op.targets(entity_type, entity_id)
            && op.op_type == OperationType::Update
            && op.status == OperationStatus::Pending
            && !in_flight.contains(&op.id))
    });
    if let Some(existing) = state.operations.iter().find(|op| {
        state.is_open(op) && op.op_type == OperationType::Delete && op.targets(entity_type, entity_id)
    }) {
        return EnqueueOutcome::Deduplicated(existing.id.clone());
    }
    push(state, operation)
}

/// A delete queued behind a still-pending create for the same entity waits
/// for that create to be sent.
fn waits_on_create(earlier: &[SyncOperation], operation: &SyncOperation) -> bool {
    operation.op_type == OperationType::Delete
        && earlier.iter().any(|op| {
            op.op_type == OperationType::Create
                && op.status == OperationStatus::Pending
                && op.targets(&operation.entity_type, &operation.entity_id)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoragePolicy;
    use crate::core::VaultError;
    use crate::storage::{KvStore, MemoryKvStore, StorageTiers};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Records calls and fails the first `failures` of them with `failure`.
    struct ScriptedRemote {
        calls: StdMutex<Vec<String>>,
        failures: StdMutex<Vec<RemoteFailure>>,
    }

    impl ScriptedRemote {
        fn new(failures: Vec<RemoteFailure>) -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
                failures: StdMutex::new(failures),
            })
        }

        fn record(&self, call: String) -> std::result::Result<(), RemoteFailure> {
            self.calls.lock().unwrap().push(call);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemotePersistence for ScriptedRemote {
        async fn create(&self, entity_type: &str, payload: &Value) -> std::result::Result<Value, RemoteFailure> {
            self.record(format!("create:{}:{}", entity_type, payload["id"].as_str().unwrap_or("")))?;
            Ok(payload.clone())
        }

        async fn update(
            &self,
            entity_type: &str,
            entity_id: &str,
            payload: &Value,
        ) -> std::result::Result<Value, RemoteFailure> {
            self.record(format!("update:{}:{}", entity_type, entity_id))?;
            Ok(payload.clone())
        }

        async fn delete(&self, entity_type: &str, entity_id: &str) -> std::result::Result<(), RemoteFailure> {
            self.record(format!("delete:{}:{}", entity_type, entity_id))
        }
    }

    fn fast_policy() -> SyncPolicy {
        SyncPolicy {
            max_retries: 3,
            base_delay_ms: 0,
            ..SyncPolicy::default()
        }
    }

    async fn queue_with(remote: Arc<ScriptedRemote>) -> SyncQueue {
        SyncQueue::open(Arc::new(StorageFacade::in_memory()), remote, fast_policy())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn updates_merge_into_one_pending_entry() {
        let queue = queue_with(ScriptedRemote::new(vec![])).await;
        queue
            .enqueue(NewOperation::update("template", "t1", json!({"id": "t1", "name": "A"})))
            .await
            .unwrap();
        let outcome = queue
            .enqueue(NewOperation::update("template", "t1", json!({"content": "B"})))
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Merged(_)));

        let pending = queue.pending_for("template", "t1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].payload,
            Some(json!({"id": "t1", "name": "A", "content": "B"}))
        );
    }

    #[tokio::test]
    async fn delete_cancels_unflushed_create() {
        let remote = ScriptedRemote::new(vec![]);
        let queue = queue_with(remote.clone()).await;
        queue
            .enqueue(NewOperation::create("template", "t1", json!({"id": "t1"})))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::update("template", "t1", json!({"name": "x"})))
            .await
            .unwrap();
        let outcome = queue.enqueue(NewOperation::delete("template", "t1")).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Cancelled { removed: 1 });
        assert!(queue.operations().await.is_empty());

        queue.process_queue().await;
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_after_flushed_create_goes_remote() {
        let remote = ScriptedRemote::new(vec![]);
        let queue = queue_with(remote.clone()).await;
        queue
            .enqueue(NewOperation::create("template", "t1", json!({"id": "t1"})))
            .await
            .unwrap();
        queue.process_queue().await;

        let outcome = queue.enqueue(NewOperation::delete("template", "t1")).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        let again = queue.enqueue(NewOperation::delete("template", "t1")).await.unwrap();
        assert!(matches!(again, EnqueueOutcome::Deduplicated(_)));

        queue.process_queue().await;
        assert_eq!(remote.calls(), vec!["create:template:t1", "delete:template:t1"]);
    }

    #[tokio::test]
    async fn delete_after_failed_create_attempt_is_kept() {
        let remote = ScriptedRemote::new(vec![RemoteFailure::network("timeout")]);
        let policy = SyncPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast_policy()
        };
        let queue = SyncQueue::open(Arc::new(StorageFacade::in_memory()), remote.clone(), policy)
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::create("template", "t1", json!({"id": "t1"})))
            .await
            .unwrap();
        assert_eq!(queue.process_queue().await.retried, 1);

        let outcome = queue.enqueue(NewOperation::delete("template", "t1")).await.unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));
        assert_eq!(queue.pending_for("template", "t1").await.len(), 2);

        // The create is backing off, so the delete must not overtake it.
        let report = queue.process_queue().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(remote.calls(), vec!["create:template:t1"]);
    }

    /// Small store that rejects writes while `reject` is set.
    struct RejectingStore {
        inner: MemoryKvStore,
        reject: AtomicBool,
    }

    #[async_trait]
    impl KvStore for RejectingStore {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(VaultError::Storage("disk full".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }

        async fn size_bytes(&self) -> Result<u64> {
            self.inner.size_bytes().await
        }
    }

    #[tokio::test]
    async fn unpersisted_enqueue_is_undone() {
        let store = Arc::new(RejectingStore {
            inner: MemoryKvStore::new("small"),
            reject: AtomicBool::new(false),
        });
        let tiers = StorageTiers {
            ephemeral: Arc::new(MemoryKvStore::new("ephemeral")),
            small: store.clone(),
            large: Arc::new(MemoryKvStore::new("large")),
        };
        let facade = Arc::new(StorageFacade::new(tiers, StoragePolicy::default()));
        let queue = SyncQueue::open(facade, ScriptedRemote::new(vec![]), fast_policy())
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::create("folder", "f1", json!({"id": "f1"})))
            .await
            .unwrap();

        store.reject.store(true, Ordering::SeqCst);
        assert!(
            queue
                .enqueue(NewOperation::update("folder", "f1", json!({"name": "x"})))
                .await
                .is_err()
        );
        assert!(queue.enqueue(NewOperation::delete("folder", "f1")).await.is_err());
        store.reject.store(false, Ordering::SeqCst);

        let operations = queue.operations().await;
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].op_type, OperationType::Create);
        assert_eq!(operations[0].payload, Some(json!({"id": "f1"})));
    }

    #[tokio::test]
    async fn drains_by_priority_then_age() {
        let remote = ScriptedRemote::new(vec![]);
        let queue = queue_with(remote.clone()).await;
        queue.enqueue(NewOperation::delete("snippet", "s0")).await.unwrap();
        queue
            .enqueue(NewOperation::update("snippet", "s1", json!({"id": "s1"})))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::create("snippet", "s2", json!({"id": "s2"})))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::delete("snippet", "s3").with_priority(10))
            .await
            .unwrap();

        let report = queue.process_queue().await;
        assert_eq!(report.succeeded, 4);
        assert_eq!(
            remote.calls(),
            vec![
                "delete:snippet:s3",
                "create:snippet:s2",
                "update:snippet:s1",
                "delete:snippet:s0",
            ]
        );
    }

    #[tokio::test]
    async fn transient_failures_retry_and_permanent_ones_stop() {
        let remote = ScriptedRemote::new(vec![
            RemoteFailure::network("offline"),
            RemoteFailure::conflict(Some(4), "stale"),
        ]);
        let queue = queue_with(remote.clone()).await;
        queue
            .enqueue(NewOperation::create("folder", "f1", json!({"id": "f1"})))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::update("folder", "f2", json!({"id": "f2"})))
            .await
            .unwrap();

        let first = queue.process_queue().await;
        assert_eq!(first.retried, 1);
        assert_eq!(first.failed, 1);

        let second = queue.process_queue().await;
        assert_eq!(second.succeeded, 1);

        let stats = queue.get_queue_stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_error.get("conflict"), Some(&1));

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        assert_eq!(queue.get_queue_stats().await.pending, 1);
    }

    #[tokio::test]
    async fn offline_queue_does_not_drain() {
        let remote = ScriptedRemote::new(vec![]);
        let queue = queue_with(remote.clone()).await;
        queue
            .enqueue(NewOperation::create("folder", "f1", json!({"id": "f1"})))
            .await
            .unwrap();
        queue.set_online(false);
        let report = queue.process_queue().await;
        assert_eq!(report.skipped, Some(DrainSkip::Offline));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn queue_survives_reopen() {
        let facade = Arc::new(StorageFacade::in_memory());
        let remote = ScriptedRemote::new(vec![]);
        {
            let queue = SyncQueue::open(facade.clone(), remote.clone(), fast_policy())
                .await
                .unwrap();
            queue
                .enqueue(NewOperation::create("template", "t9", json!({"id": "t9"})))
                .await
                .unwrap();
        }
        let reopened = SyncQueue::open(facade, remote, fast_policy()).await.unwrap();
        assert_eq!(reopened.get_queue_stats().await.pending, 1);
    }

    #[test]
    fn backoff_is_linear_and_capped() {
        let policy = SyncPolicy {
            base_delay_ms: 100,
            max_delay_ms: 250,
            ..SyncPolicy::default()
        };
        assert_eq!(backoff_delay_ms(&policy, 0), 0);
        assert_eq!(backoff_delay_ms(&policy, 2), 200);
        assert_eq!(backoff_delay_ms(&policy, 9), 250);
    }
}
