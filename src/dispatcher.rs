//! Consumes queued notifications and drives the reconciler with bounded
//! concurrency, per-key serialization, and retry with backoff (§4.6).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tokio::sync::{Mutex, Semaphore};

use reconciler_core::key::InternalKey;

use crate::error::ReconcileError;
use crate::reconciler::Reconciler;
use crate::store::{StoreReadWrite, WorkItem};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential backoff delay for a 1-based retry `attempt`, capped at five
/// minutes and jittered by +/-25% so retrying workers don't thunder in
/// lockstep.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(8);
    let exp = BASE_BACKOFF.saturating_mul(1u32 << shift);
    let capped = exp.min(MAX_BACKOFF);
    let jitter_frac = rand::rng().random_range(-0.25..=0.25_f64);
    let millis = (capped.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0);
    Duration::from_millis(millis as u64)
}

/// Outcome of one `flush_work_queue` pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Drives [`Reconciler`] cycles for queued [`WorkItem`]s.
pub struct Dispatcher<S> {
    store: Arc<S>,
    reconciler: Arc<Reconciler<S>>,
    workers: usize,
    retry_limit: u32,
}

impl<S: StoreReadWrite + 'static> Dispatcher<S> {
    #[must_use]
    pub fn new(store: Arc<S>, reconciler: Arc<Reconciler<S>>, workers: u32, retry_limit: u32) -> Self {
        Self {
            store,
            reconciler,
            workers: (workers as usize).max(1),
            retry_limit,
        }
    }

    /// Submit a unit of work for later processing by [`Self::flush_work_queue`].
    pub async fn notify(&self, item: WorkItem) {
        self.store.enqueue(item).await;
    }

    /// Drain every queued [`WorkItem`], running up to `workers` cycles
    /// concurrently. Two items for the same internal key never run
    /// concurrently: a later item for a key already in flight is put back
    /// on the queue for the next pass. Each item retries transient
    /// ([`ReconcileError::is_retryable`]) failures with backoff up to
    /// `retry_limit` attempts before counting as failed.
    pub async fn flush_work_queue(&self) -> FlushSummary {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let in_flight: Arc<Mutex<HashSet<InternalKey>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();

        loop {
            let batch = self.store.dequeue(self.workers).await;
            if batch.is_empty() {
                if in_flight.lock().await.is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
                continue;
            }
            for item in batch {
                let key = item.key.clone();
                {
                    let mut guard = in_flight.lock().await;
                    if guard.contains(&key) {
                        drop(guard);
                        self.store.enqueue(item).await;
                        continue;
                    }
                    guard.insert(key.clone());
                }

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                let reconciler = Arc::clone(&self.reconciler);
                let in_flight = Arc::clone(&in_flight);
                let retry_limit = self.retry_limit;

                handles.push(tokio::spawn(async move {
                    let result = process_with_retry(&reconciler, &key, retry_limit).await;
                    in_flight.lock().await.remove(&key);
                    drop(permit);
                    result
                }));
            }
        }

        let mut summary = FlushSummary::default();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => summary.succeeded += 1,
                Ok(Err(_)) | Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

async fn process_with_retry<S: StoreReadWrite>(
    reconciler: &Reconciler<S>,
    key: &InternalKey,
    retry_limit: u32,
) -> Result<(), ReconcileError> {
    let mut attempt = 0;
    loop {
        match reconciler.reconcile(key).await {
            Ok(_) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < retry_limit => {
                attempt += 1;
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AnyDriver, DriverRegistry};
    use crate::drivers::memory::MemoryDriver;
    use crate::store::InMemoryStore;
    use reconciler_core::document::Document;
    use reconciler_core::key::ForeignKey;
    use reconciler_core::merge::RejectOnDisagreement;
    use serde_json::json;

    #[test]
    fn backoff_delay_grows_and_caps() {
        let d1 = backoff_delay(1);
        assert!(d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(2_500));
        let d_high = backoff_delay(20);
        assert!(d_high <= Duration::from_secs(301));
    }

    #[tokio::test]
    async fn flush_processes_queued_notifications() {
        let store = Arc::new(InMemoryStore::new());
        let crm = MemoryDriver::new();
        let mut registry = DriverRegistry::new();
        registry.insert("customer", "crm", AnyDriver::Memory(crm.clone()));

        let key = InternalKey::new("customer", "1").unwrap();
        let fk = ForeignKey::new("customer", "crm", "cust_1").unwrap();
        store.link(key.clone(), fk.clone()).await;
        crm.seed(&fk, Document::from_json(&json!({"tier": "gold"})).unwrap()).await;

        let reconciler = Arc::new(Reconciler::new(store.clone(), Arc::new(registry), Box::new(RejectOnDisagreement)));
        let dispatcher = Dispatcher::new(store.clone(), reconciler, 4, 8);

        dispatcher
            .notify(WorkItem { key: key.clone(), source: "crm".to_owned() })
            .await;
        let summary = dispatcher.flush_work_queue().await;
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        assert!(store.baseline(&key).await.is_some());
    }

    #[tokio::test]
    async fn flush_of_many_notifications_processes_all() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = DriverRegistry::new();
        let mut keys = Vec::new();
        for i in 0..25 {
            let entity_key = InternalKey::new("customer", i.to_string()).unwrap();
            let fk = ForeignKey::new("customer", "crm", format!("cust_{i}")).unwrap();
            let driver = MemoryDriver::new();
            driver.seed(&fk, Document::from_json(&json!({"tier": "gold"})).unwrap()).await;
            registry.insert("customer", format!("crm{i}"), AnyDriver::Memory(driver));
            store.link(entity_key.clone(), ForeignKey::new("customer", format!("crm{i}"), format!("cust_{i}")).unwrap()).await;
            keys.push(entity_key);
        }

        let reconciler = Arc::new(Reconciler::new(store.clone(), Arc::new(registry), Box::new(RejectOnDisagreement)));
        let dispatcher = Dispatcher::new(store.clone(), reconciler, 4, 8);

        for key in &keys {
            dispatcher.notify(WorkItem { key: key.clone(), source: "crm".to_owned() }).await;
        }

        let summary = dispatcher.flush_work_queue().await;
        assert_eq!(summary.succeeded, 25);
    }
}
