//! Persistent state contract and in-memory reference implementation (§4.5,
//! §6.5).
//!
//! The store owns four logical tables: the internal/foreign key index, the
//! last-known baseline Document per internal key, the history of
//! [`DiffRecord`]s produced by each reconciliation cycle, and the queue of
//! pending [`WorkItem`]s waiting on the dispatcher. [`StoreReadOnly`] and
//! [`StoreReadWrite`] split the contract so call sites that only ever read
//! (e.g. `ListConflicts`) are provable at compile time not to mutate state.
//! [`InMemoryStore`] is the reference implementation: adequate for tests and
//! single-process deployments, not claimed to survive a restart.

use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use reconciler_core::diff::{Diff, Operation};
use reconciler_core::document::{Document, Path};
use reconciler_core::key::{DiffId, ForeignKey, InternalKey, OperationId, SourceName};
use reconciler_core::merge::MergeOutcome;

use crate::error::ReconcileError;

/// One source's operation that the merge step rejected, parked for
/// adjudication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedOperation {
    pub source: SourceName,
    pub operation: Operation,
}

/// The durable record of one reconciliation cycle (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffRecord {
    pub id: DiffId,
    pub key: InternalKey,
    /// The automerged operations written back to every source.
    pub applied: Diff,
    /// Operations that conflicted, in storage order; an operation's
    /// position here is its stable [`OperationId`].
    pub rejected: Vec<RejectedOperation>,
    pub recorded_at_unix: u64,
}

impl DiffRecord {
    /// Build a record from a merge outcome, flattening the outcome's
    /// per-source rejected Diffs into a single indexed list.
    #[must_use]
    pub fn from_outcome(id: DiffId, key: InternalKey, outcome: MergeOutcome, recorded_at_unix: u64) -> Self {
        let mut rejected = Vec::new();
        for diff in outcome.rejected {
            let source = diff.label.clone().unwrap_or_default();
            for op in diff.operations() {
                rejected.push(RejectedOperation {
                    source: source.clone(),
                    operation: op.clone(),
                });
            }
        }
        Self {
            id,
            key,
            applied: outcome.applied,
            rejected,
            recorded_at_unix,
        }
    }
}

/// One outstanding conflicting operation, as surfaced by `ListConflicts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingConflict {
    pub key: InternalKey,
    pub diff_id: DiffId,
    pub operation_id: OperationId,
    pub source: SourceName,
    pub path: Path,
    pub operation: Operation,
}

/// The value a human adjudicator chooses for a conflicting path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Write this value at the path.
    Set(String),
    /// Remove the path entirely.
    Delete,
}

/// A unit of pending work for the dispatcher: "re-reconcile `key` because
/// `source` reported a change" (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub key: InternalKey,
    pub source: SourceName,
}

/// Enqueued whenever a [`DiffRecord`] with non-empty `rejected` is
/// persisted. Drained by operators in batches via [`StoreReadWrite::fetch_notifications`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub key: InternalKey,
    pub diff_id: DiffId,
    pub created_at_unix: u64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Read-only half of the store contract.
pub trait StoreReadOnly: Send + Sync {
    /// The internal key that owns `fk`, if one has been linked.
    fn internal_key_for(&self, fk: &ForeignKey) -> impl std::future::Future<Output = Option<InternalKey>> + Send;

    /// Every foreign key currently linked to `key`.
    fn foreign_keys_for(&self, key: &InternalKey) -> impl std::future::Future<Output = Vec<ForeignKey>> + Send;

    /// The last-known baseline Document for `key`, if one has been recorded.
    fn baseline(&self, key: &InternalKey) -> impl std::future::Future<Output = Option<Document>> + Send;

    /// Diff records persisted for `key`, oldest first.
    fn diff_records(&self, key: &InternalKey) -> impl std::future::Future<Output = Vec<DiffRecord>> + Send;

    /// Every unresolved conflicting operation across every diff record for
    /// `key`.
    fn list_conflicts(&self, key: &InternalKey) -> impl std::future::Future<Output = Vec<PendingConflict>> + Send;

    /// Every internal key with at least one unresolved conflicting
    /// operation.
    fn conflicted_keys(&self) -> impl std::future::Future<Output = Vec<InternalKey>> + Send;
}

/// Read-write half of the store contract.
pub trait StoreReadWrite: StoreReadOnly {
    /// Mint a fresh internal key for `entity`, unique for the lifetime of
    /// the store. Used by `Notify` on first contact, when no foreign key is
    /// yet linked to any internal key.
    fn allocate_internal_key(&self, entity: &str) -> impl std::future::Future<Output = InternalKey> + Send;

    /// Link `fk` to `key`. Idempotent: re-linking the same pair is a no-op.
    fn link(&self, key: InternalKey, fk: ForeignKey) -> impl std::future::Future<Output = ()> + Send;

    /// Replace the baseline Document recorded for `key`.
    fn set_baseline(&self, key: InternalKey, doc: Document) -> impl std::future::Future<Output = ()> + Send;

    /// Persist a new diff record, assigning it the next [`DiffId`].
    fn append_diff_record(&self, key: InternalKey, outcome: MergeOutcome) -> impl std::future::Future<Output = DiffId> + Send;

    /// Resolve one conflicting operation. Returns an error if no such
    /// pending conflict exists.
    fn resolve(
        &self,
        key: &InternalKey,
        diff_id: DiffId,
        operation_id: OperationId,
        resolution: Resolution,
    ) -> impl std::future::Future<Output = Result<(), ReconcileError>> + Send;

    /// Drain every resolution recorded for `key` since it was last drained,
    /// for the reconciler to write back.
    fn drain_resolutions(&self, key: &InternalKey) -> impl std::future::Future<Output = Vec<(Path, Resolution)>> + Send;

    /// Enqueue a unit of dispatcher work.
    fn enqueue(&self, item: WorkItem) -> impl std::future::Future<Output = ()> + Send;

    /// Remove and return up to `max` queued work items, FIFO.
    fn dequeue(&self, max: usize) -> impl std::future::Future<Output = Vec<WorkItem>> + Send;

    /// Number of work items currently queued.
    fn queue_len(&self) -> impl std::future::Future<Output = usize> + Send;

    /// Atomically remove up to `max` pending notifications, oldest first,
    /// and report how many remain queued afterward. Never returns the same
    /// notification twice (§8 "Notification conservation").
    fn fetch_notifications(&self, max: usize) -> impl std::future::Future<Output = (usize, Vec<Notification>)> + Send;
}

#[derive(Default)]
struct Tables {
    fk_to_key: BTreeMap<ForeignKey, InternalKey>,
    key_to_fks: BTreeMap<InternalKey, Vec<ForeignKey>>,
    baselines: BTreeMap<InternalKey, Document>,
    diff_records: BTreeMap<InternalKey, Vec<DiffRecord>>,
    resolutions: BTreeMap<(DiffId, OperationId), (Path, Resolution)>,
    pending_writeback: BTreeMap<InternalKey, Vec<(Path, Resolution)>>,
    next_diff_id: u64,
    next_internal_id: u64,
    queue: VecDeque<WorkItem>,
    notifications: VecDeque<Notification>,
}

/// In-process store satisfying the store contract via a single
/// `tokio::sync::RwLock`. Adequate for tests and single-process
/// deployments; a durable backend swaps in behind the same trait.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreReadOnly for InMemoryStore {
    async fn internal_key_for(&self, fk: &ForeignKey) -> Option<InternalKey> {
        self.tables.read().await.fk_to_key.get(fk).cloned()
    }

    async fn foreign_keys_for(&self, key: &InternalKey) -> Vec<ForeignKey> {
        self.tables
            .read()
            .await
            .key_to_fks
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    async fn baseline(&self, key: &InternalKey) -> Option<Document> {
        self.tables.read().await.baselines.get(key).cloned()
    }

    async fn diff_records(&self, key: &InternalKey) -> Vec<DiffRecord> {
        self.tables
            .read()
            .await
            .diff_records
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    async fn list_conflicts(&self, key: &InternalKey) -> Vec<PendingConflict> {
        let tables = self.tables.read().await;
        let Some(records) = tables.diff_records.get(key) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for record in records {
            for (idx, rejected) in record.rejected.iter().enumerate() {
                let operation_id = OperationId(u32::try_from(idx).unwrap_or(u32::MAX));
                if tables.resolutions.contains_key(&(record.id, operation_id)) {
                    continue;
                }
                out.push(PendingConflict {
                    key: key.clone(),
                    diff_id: record.id,
                    operation_id,
                    source: rejected.source.clone(),
                    path: rejected.operation.path().clone(),
                    operation: rejected.operation.clone(),
                });
            }
        }
        out
    }

    async fn conflicted_keys(&self) -> Vec<InternalKey> {
        let keys: Vec<InternalKey> = self.tables.read().await.diff_records.keys().cloned().collect();
        let mut out = Vec::new();
        for key in keys {
            if !self.list_conflicts(&key).await.is_empty() {
                out.push(key);
            }
        }
        out
    }
}

impl StoreReadWrite for InMemoryStore {
    async fn allocate_internal_key(&self, entity: &str) -> InternalKey {
        let mut tables = self.tables.write().await;
        let id = tables.next_internal_id;
        tables.next_internal_id += 1;
        InternalKey::new(entity, id.to_string()).expect("entity and generated id are non-empty")
    }

    async fn link(&self, key: InternalKey, fk: ForeignKey) {
        let mut tables = self.tables.write().await;
        tables.fk_to_key.insert(fk.clone(), key.clone());
        let fks = tables.key_to_fks.entry(key).or_default();
        if !fks.contains(&fk) {
            fks.push(fk);
        }
    }

    async fn set_baseline(&self, key: InternalKey, doc: Document) {
        self.tables.write().await.baselines.insert(key, doc);
    }

    async fn append_diff_record(&self, key: InternalKey, outcome: MergeOutcome) -> DiffId {
        let mut tables = self.tables.write().await;
        let id = DiffId(tables.next_diff_id);
        tables.next_diff_id += 1;
        let recorded_at = now_unix();
        let record = DiffRecord::from_outcome(id, key.clone(), outcome, recorded_at);
        let has_rejected = !record.rejected.is_empty();
        tables.diff_records.entry(key.clone()).or_default().push(record);
        if has_rejected {
            tables.notifications.push_back(Notification {
                key,
                diff_id: id,
                created_at_unix: recorded_at,
            });
        }
        id
    }

    async fn resolve(
        &self,
        key: &InternalKey,
        diff_id: DiffId,
        operation_id: OperationId,
        resolution: Resolution,
    ) -> Result<(), ReconcileError> {
        let mut tables = self.tables.write().await;
        let Some(records) = tables.diff_records.get(key) else {
            return Err(ReconcileError::NotFound { key: key.clone() });
        };
        let Some(record) = records.iter().find(|r| r.id == diff_id) else {
            return Err(ReconcileError::NotFound { key: key.clone() });
        };
        let idx = operation_id.0 as usize;
        let Some(rejected) = record.rejected.get(idx) else {
            return Err(ReconcileError::NotFound { key: key.clone() });
        };
        let path = rejected.operation.path().clone();
        tables
            .resolutions
            .insert((diff_id, operation_id), (path.clone(), resolution.clone()));
        tables
            .pending_writeback
            .entry(key.clone())
            .or_default()
            .push((path, resolution));
        Ok(())
    }

    async fn drain_resolutions(&self, key: &InternalKey) -> Vec<(Path, Resolution)> {
        self.tables
            .write()
            .await
            .pending_writeback
            .remove(key)
            .unwrap_or_default()
    }

    async fn enqueue(&self, item: WorkItem) {
        self.tables.write().await.queue.push_back(item);
    }

    async fn dequeue(&self, max: usize) -> Vec<WorkItem> {
        let mut tables = self.tables.write().await;
        let n = max.min(tables.queue.len());
        tables.queue.drain(..n).collect()
    }

    async fn queue_len(&self) -> usize {
        self.tables.read().await.queue.len()
    }

    async fn fetch_notifications(&self, max: usize) -> (usize, Vec<Notification>) {
        let mut tables = self.tables.write().await;
        let n = max.min(tables.notifications.len());
        let drained = tables.notifications.drain(..n).collect();
        (tables.notifications.len(), drained)
    }
}
