//! The reconciliation cycle: fetch → diff → merge → write-back for one
//! internal key (§4.4).
//!
//! Each call to [`Reconciler::reconcile`] performs one full cycle:
//!
//! 1. Look up every foreign key linked to the internal key.
//! 2. Read the remembered baseline Document (empty if this is first
//!    contact).
//! 3. Fetch the current Document from every linked source.
//! 4. Diff each source's current Document against the baseline.
//! 5. Merge the per-source diffs with the configured [`MergeStrategy`].
//! 6. Apply the automerged operations to the baseline to get the new
//!    canonical Document.
//! 7. Write the new canonical Document back to every linked source, then
//!    persist the diff record (rejected operations become pending
//!    conflicts automatically, via the store). The baseline only advances
//!    once every write-back has succeeded; if any source is unavailable,
//!    the diff record is still persisted for operator inspection but the
//!    baseline is left unchanged for the next cycle to retry against.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reconciler_core::diff::{apply, diff, Diff, Operation};
use reconciler_core::document::Document;
use reconciler_core::key::{DiffId, InternalKey, SourceName};
use reconciler_core::merge::{merge, MergeStrategy};

use crate::driver::{DataSourceDriver as _, DriverRegistry};
use crate::error::ReconcileError;
use crate::store::{Resolution, StoreReadWrite};

/// Default per-driver-call timeout (§5), used when a caller doesn't
/// override it via [`Reconciler::with_driver_timeout`].
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary of one completed reconciliation cycle, returned for logging and
/// for the `Notify` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub key: InternalKey,
    /// `None` if no source reported a change since the last baseline.
    pub diff_id: Option<DiffId>,
    pub applied_count: usize,
    pub conflict_count: usize,
}

/// Drives the fetch/diff/merge/write-back cycle against a store and driver
/// registry.
pub struct Reconciler<S> {
    store: Arc<S>,
    drivers: Arc<DriverRegistry>,
    strategy: Box<dyn MergeStrategy>,
    driver_timeout: Duration,
}

impl<S: StoreReadWrite> Reconciler<S> {
    pub fn new(store: Arc<S>, drivers: Arc<DriverRegistry>, strategy: Box<dyn MergeStrategy>) -> Self {
        Self {
            store,
            drivers,
            strategy,
            driver_timeout: DEFAULT_DRIVER_TIMEOUT,
        }
    }

    /// Override the per-driver-call timeout (§5), read from
    /// `config.driver_timeout_secs` by the CLI at startup.
    #[must_use]
    pub const fn with_driver_timeout(mut self, driver_timeout: Duration) -> Self {
        self.driver_timeout = driver_timeout;
        self
    }

    /// Run `fut` (a single driver call against `source`) under
    /// [`Self::driver_timeout`]; an expired deadline surfaces as
    /// [`ReconcileError::Unavailable`] so the dispatcher retries it like any
    /// other transient driver failure.
    async fn with_timeout<T>(
        &self,
        source: &str,
        fut: impl Future<Output = Result<T, ReconcileError>>,
    ) -> Result<T, ReconcileError> {
        tokio::time::timeout(self.driver_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(ReconcileError::Unavailable {
                    source: SourceName::from(source),
                    detail: format!("driver call timed out after {:.1}s", self.driver_timeout.as_secs_f64()),
                })
            })
    }

    /// Run one reconciliation cycle for `key`.
    ///
    /// # Errors
    /// Returns [`ReconcileError::NotFound`] if no source is linked to
    /// `key`, [`ReconcileError::UnknownSource`] if a linked source has no
    /// registered driver, or whatever the driver itself reports (most
    /// commonly [`ReconcileError::Unavailable`]).
    pub async fn reconcile(&self, key: &InternalKey) -> Result<ReconcileOutcome, ReconcileError> {
        let fks = self.store.foreign_keys_for(key).await;
        if fks.is_empty() {
            return Err(ReconcileError::NotFound { key: key.clone() });
        }

        let baseline = self.store.baseline(key).await.unwrap_or_else(Document::empty);

        let mut patches = Vec::new();
        for fk in &fks {
            let driver = self.drivers.get(key.entity(), fk.source())?;
            let current = self
                .with_timeout(fk.source(), driver.read(fk))
                .await?
                .unwrap_or_else(Document::empty);
            let patch = diff(&baseline, &current).with_label(fk.source().to_owned());
            if !patch.is_empty() {
                patches.push(patch);
            }
        }

        if patches.is_empty() {
            return Ok(ReconcileOutcome {
                key: key.clone(),
                diff_id: None,
                applied_count: 0,
                conflict_count: 0,
            });
        }

        let outcome = merge(&patches, self.strategy.as_ref());
        let applied_count = outcome.applied.len();
        let conflict_count: usize = outcome.rejected.iter().map(Diff::len).sum();

        let resolved = apply(&outcome.applied, &baseline)?;

        // §4.4 step 7: write back to every present source first. The
        // DiffRecord is always persisted so operators can inspect it even
        // if write-back fails, but the baseline only advances once every
        // `set` has succeeded — otherwise the next cycle would diff
        // sources that still hold their pre-merge Documents against an
        // already-advanced baseline.
        let write_back = self.write_document_to_all_sources(key, &fks, &resolved).await;
        let diff_id = self.store.append_diff_record(key.clone(), outcome).await;
        write_back?;

        self.store.set_baseline(key.clone(), resolved).await;

        Ok(ReconcileOutcome {
            key: key.clone(),
            diff_id: Some(diff_id),
            applied_count,
            conflict_count,
        })
    }

    /// Apply every resolution recorded for `key` since it was last drained,
    /// update the baseline, and write the result back to every linked
    /// source.
    ///
    /// # Errors
    /// Propagates driver errors and [`reconciler_core::diff::DiffMismatch`]
    /// if the baseline changed incompatibly between resolution and
    /// write-back.
    pub async fn write_back_resolutions(&self, key: &InternalKey) -> Result<(), ReconcileError> {
        let resolutions = self.store.drain_resolutions(key).await;
        if resolutions.is_empty() {
            return Ok(());
        }

        let baseline = self.store.baseline(key).await.unwrap_or_else(Document::empty);
        let mut ops = Vec::new();
        for (path, resolution) in resolutions {
            let current = baseline.get(&path).map(str::to_owned);
            let op = match (current, resolution) {
                (Some(old), Resolution::Set(new)) if old != new => {
                    Operation::Replace { path, old_value: old, new_value: new }
                }
                (None, Resolution::Set(new)) => Operation::Insert { path, value: new },
                (Some(old), Resolution::Delete) => Operation::Delete { path, old_value: old },
                (Some(_), Resolution::Set(_)) | (None, Resolution::Delete) => continue,
            };
            ops.push(op);
        }
        if ops.is_empty() {
            return Ok(());
        }
        ops.sort_by(|a, b| a.path().cmp(b.path()));
        let patch = Diff::from_sorted_operations(ops);
        let resolved = apply(&patch, &baseline)?;

        let fks = self.store.foreign_keys_for(key).await;
        self.write_document_to_all_sources(key, &fks, &resolved).await?;

        self.store.set_baseline(key.clone(), resolved).await;
        Ok(())
    }

    async fn write_document_to_all_sources(
        &self,
        key: &InternalKey,
        fks: &[reconciler_core::key::ForeignKey],
        doc: &Document,
    ) -> Result<(), ReconcileError> {
        for fk in fks {
            let driver = self.drivers.get(key.entity(), fk.source())?;
            match self.with_timeout(fk.source(), driver.read(fk)).await? {
                Some(_) => self.with_timeout(fk.source(), driver.update(fk, doc)).await?,
                None => self.with_timeout(fk.source(), driver.create(fk, doc)).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::AnyDriver;
    use crate::drivers::memory::MemoryDriver;
    use crate::store::InMemoryStore;
    use reconciler_core::key::ForeignKey;
    use reconciler_core::merge::RejectOnDisagreement;
    use serde_json::json;

    async fn setup() -> (Reconciler<InMemoryStore>, Arc<InMemoryStore>, MemoryDriver, MemoryDriver) {
        let store = Arc::new(InMemoryStore::new());
        let crm = MemoryDriver::new();
        let billing = MemoryDriver::new();

        let mut registry = DriverRegistry::new();
        registry.insert("customer", "crm", AnyDriver::Memory(crm.clone()));
        registry.insert("customer", "billing", AnyDriver::Memory(billing.clone()));

        let key = InternalKey::new("customer", "42").unwrap();
        store.link(key.clone(), ForeignKey::new("customer", "crm", "cust_001").unwrap()).await;
        store.link(key.clone(), ForeignKey::new("customer", "billing", "acct_001").unwrap()).await;

        let reconciler = Reconciler::new(store.clone(), Arc::new(registry), Box::new(RejectOnDisagreement));
        (reconciler, store, crm, billing)
    }

    #[tokio::test]
    async fn first_contact_seeds_baseline_from_single_source() {
        let (reconciler, store, crm, _billing) = setup().await;
        let key = InternalKey::new("customer", "42").unwrap();
        crm.seed(&ForeignKey::new("customer", "crm", "cust_001").unwrap(), Document::from_json(&json!({"tier": "gold"})).unwrap()).await;

        let outcome = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.applied_count, 1);
        assert_eq!(outcome.conflict_count, 0);

        let baseline = store.baseline(&key).await.unwrap();
        assert_eq!(baseline.get(&reconciler_core::document::Path::parse("tier").unwrap()), Some("gold"));
    }

    #[tokio::test]
    async fn agreeing_sources_automerge_and_write_back() {
        let (reconciler, _store, crm, billing) = setup().await;
        let key = InternalKey::new("customer", "42").unwrap();
        let doc = Document::from_json(&json!({"tier": "gold"})).unwrap();
        crm.seed(&ForeignKey::new("customer", "crm", "cust_001").unwrap(), doc.clone()).await;

        let outcome = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.conflict_count, 0);

        let billing_doc = billing.read(&ForeignKey::new("customer", "billing", "acct_001").unwrap()).await.unwrap();
        assert_eq!(billing_doc, Some(doc));
    }

    #[tokio::test]
    async fn conflicting_sources_are_parked_not_written_back() {
        let (reconciler, store, crm, billing) = setup().await;
        let key = InternalKey::new("customer", "42").unwrap();
        crm.seed(&ForeignKey::new("customer", "crm", "cust_001").unwrap(), Document::from_json(&json!({"tier": "gold"})).unwrap()).await;
        billing.seed(&ForeignKey::new("customer", "billing", "acct_001").unwrap(), Document::from_json(&json!({"tier": "platinum"})).unwrap()).await;

        let outcome = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.applied_count, 0);
        assert_eq!(outcome.conflict_count, 2);

        let conflicts = store.list_conflicts(&key).await;
        assert_eq!(conflicts.len(), 2);
    }

    #[tokio::test]
    async fn resolving_a_conflict_writes_the_chosen_value_back() {
        let (reconciler, store, crm, billing) = setup().await;
        let key = InternalKey::new("customer", "42").unwrap();
        crm.seed(&ForeignKey::new("customer", "crm", "cust_001").unwrap(), Document::from_json(&json!({"tier": "gold"})).unwrap()).await;
        billing.seed(&ForeignKey::new("customer", "billing", "acct_001").unwrap(), Document::from_json(&json!({"tier": "platinum"})).unwrap()).await;

        reconciler.reconcile(&key).await.unwrap();
        let conflict = store.list_conflicts(&key).await.into_iter().next().unwrap();
        store
            .resolve(&key, conflict.diff_id, conflict.operation_id, Resolution::Set("gold".to_owned()))
            .await
            .unwrap();

        reconciler.write_back_resolutions(&key).await.unwrap();

        let billing_doc = billing.read(&ForeignKey::new("customer", "billing", "acct_001").unwrap()).await.unwrap().unwrap();
        assert_eq!(billing_doc.get(&reconciler_core::document::Path::parse("tier").unwrap()), Some("gold"));
    }

    #[tokio::test]
    async fn unchanged_sources_produce_no_op_cycle() {
        let (reconciler, _store, _crm, _billing) = setup().await;
        let key = InternalKey::new("customer", "42").unwrap();
        let outcome = reconciler.reconcile(&key).await.unwrap();
        assert_eq!(outcome.diff_id, None);
        assert_eq!(outcome.applied_count, 0);
    }

    #[tokio::test]
    async fn reconcile_unknown_key_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Reconciler::new(store, Arc::new(DriverRegistry::new()), Box::new(RejectOnDisagreement));
        let key = InternalKey::new("customer", "ghost").unwrap();
        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { .. }));
    }

    /// §5: a driver call that hasn't returned by the configured deadline is
    /// treated as `Unavailable`, not left to hang forever.
    #[tokio::test]
    async fn driver_call_past_timeout_is_unavailable() {
        use crate::config::SourceConfig;
        use crate::drivers::shell::ShellDriver;

        let store = Arc::new(InMemoryStore::new());
        let slow = ShellDriver::new(
            "crm".to_owned(),
            SourceConfig {
                create: "cat > /dev/null && echo '{}'".to_owned(),
                read: "sleep 2 && echo '{}'".to_owned(),
                update: "cat".to_owned(),
                delete: "true".to_owned(),
            },
        );
        let mut registry = DriverRegistry::new();
        registry.insert("customer", "crm", AnyDriver::Shell(slow));

        let key = InternalKey::new("customer", "1").unwrap();
        store.link(key.clone(), ForeignKey::new("customer", "crm", "cust_001").unwrap()).await;

        let reconciler = Reconciler::new(store, Arc::new(registry), Box::new(RejectOnDisagreement))
            .with_driver_timeout(Duration::from_millis(50));

        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Unavailable { .. }));
    }

    /// §4.4 step 7 / §8 "cycle atomicity": if write-back to any present
    /// source fails, the diff record is still persisted for inspection but
    /// the baseline is left exactly as it was before the cycle.
    #[tokio::test]
    async fn write_back_failure_leaves_baseline_unchanged() {
        use crate::config::SourceConfig;
        use crate::drivers::shell::ShellDriver;

        let store = Arc::new(InMemoryStore::new());
        let key = InternalKey::new("customer", "42").unwrap();

        let ok = MemoryDriver::new();
        ok.seed(&ForeignKey::new("customer", "ok", "cust_001").unwrap(), Document::from_json(&json!({"tier": "gold"})).unwrap()).await;

        let bad = ShellDriver::new(
            "bad".to_owned(),
            SourceConfig {
                create: "cat > /dev/null && echo '{}'".to_owned(),
                read: "echo '{\"tier\": \"silver\"}'".to_owned(),
                update: "exit 1".to_owned(),
                delete: "true".to_owned(),
            },
        );

        let mut registry = DriverRegistry::new();
        registry.insert("customer", "ok", AnyDriver::Memory(ok));
        registry.insert("customer", "bad", AnyDriver::Shell(bad));

        store.link(key.clone(), ForeignKey::new("customer", "ok", "cust_001").unwrap()).await;
        store.link(key.clone(), ForeignKey::new("customer", "bad", "acct_001").unwrap()).await;
        store.set_baseline(key.clone(), Document::from_json(&json!({"tier": "silver"})).unwrap()).await;

        let reconciler = Reconciler::new(store.clone(), Arc::new(registry), Box::new(RejectOnDisagreement));

        let err = reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Unavailable { .. }));

        let baseline = store.baseline(&key).await.unwrap();
        assert_eq!(baseline.get(&reconciler_core::document::Path::parse("tier").unwrap()), Some("silver"));
        assert_eq!(store.diff_records(&key).await.len(), 1, "diff record is persisted even though write-back failed");
    }
}
