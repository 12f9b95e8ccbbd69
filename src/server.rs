//! Accepts connections on the configured Unix socket and dispatches decoded
//! requests to the reconciler, store, and dispatcher (§4.7).
//!
//! Each connection is a strict request/response loop: read one request, hand
//! it to [`handle_request`], write the one response, repeat until the peer
//! disconnects. Distinct connections are serviced concurrently; in-process
//! concurrency across keys is the Dispatcher's responsibility, not this
//! module's.

use std::path::Path as FsPath;
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use reconciler_core::key::{DiffId, ForeignKey, InternalKey, OperationId};

use crate::dispatcher::Dispatcher;
use crate::error::ReconcileError;
use crate::reconciler::Reconciler;
use crate::store::{Resolution, StoreReadWrite, WorkItem};
use crate::wire::{self, ChangeNotification, ConflictEntry, Request, Response};

/// Bundles the pieces a connection handler needs, so `tokio::spawn`ed tasks
/// can clone a single handle instead of threading four `Arc`s around.
pub struct Server<S> {
    store: Arc<S>,
    reconciler: Arc<Reconciler<S>>,
    dispatcher: Arc<Dispatcher<S>>,
    socket_path: std::path::PathBuf,
}

impl<S: StoreReadWrite + 'static> Server<S> {
    #[must_use]
    pub fn new(
        store: Arc<S>,
        reconciler: Arc<Reconciler<S>>,
        dispatcher: Arc<Dispatcher<S>>,
        socket_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            store,
            reconciler,
            dispatcher,
            socket_path: socket_path.into(),
        }
    }

    /// Bind the Unix socket (removing a stale file left by a prior run) and
    /// accept connections until the process is killed.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Io`] if the socket cannot be bound.
    pub async fn run(&self) -> Result<(), ReconcileError> {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "reconciler listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let store = Arc::clone(&self.store);
            let reconciler = Arc::clone(&self.reconciler);
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, store, reconciler, dispatcher).await {
                    warn!(%err, "connection ended with an error");
                }
            });
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &FsPath {
        &self.socket_path
    }
}

async fn handle_connection<S: StoreReadWrite>(
    mut stream: UnixStream,
    store: Arc<S>,
    reconciler: Arc<Reconciler<S>>,
    dispatcher: Arc<Dispatcher<S>>,
) -> Result<(), ReconcileError> {
    loop {
        let request = match wire::read_request(&mut stream).await {
            Ok(req) => req,
            Err(ReconcileError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(err) => {
                let response = Response::Error(err.to_wire_kind(), err.to_string());
                wire::write_response(&mut stream, &response).await?;
                continue;
            }
        };

        let response = handle_request(request, &store, &reconciler, &dispatcher).await;
        wire::write_response(&mut stream, &response).await?;
    }
}

/// Route one decoded [`Request`] to the reconciler/store/dispatcher and
/// build the [`Response`] to send back. Never returns `Err`: every failure
/// is translated into [`Response::Error`] so the connection loop can always
/// write exactly one response frame per request.
pub async fn handle_request<S: StoreReadWrite>(
    request: Request,
    store: &Arc<S>,
    reconciler: &Arc<Reconciler<S>>,
    dispatcher: &Arc<Dispatcher<S>>,
) -> Response {
    match request {
        Request::Notify(notification) => handle_notify(notification, store, dispatcher).await,
        Request::ListConflicts => handle_list_conflicts(store).await,
        Request::Resolve { diff_id, operation_ids } => {
            handle_resolve(diff_id, &operation_ids, store, reconciler).await
        }
        Request::FlushWorkQueue => {
            let summary = dispatcher.flush_work_queue().await;
            Response::FlushWorkQueue((summary.succeeded + summary.failed) as u64)
        }
    }
}

async fn handle_notify<S: StoreReadWrite>(
    notification: ChangeNotification,
    store: &Arc<S>,
    dispatcher: &Arc<Dispatcher<S>>,
) -> Response {
    let fk = match ForeignKey::new(
        notification.entity.as_str(),
        notification.source.as_str(),
        notification.foreign_id.as_str(),
    ) {
        Ok(fk) => fk,
        Err(e) => {
            return error_response(ReconcileError::InvalidMessage { detail: e.to_string() });
        }
    };

    let key = match store.internal_key_for(&fk).await {
        Some(key) => key,
        None => {
            let key = store.allocate_internal_key(&notification.entity).await;
            store.link(key.clone(), fk.clone()).await;
            key
        }
    };

    dispatcher
        .notify(WorkItem { key, source: notification.source })
        .await;
    dispatcher.flush_work_queue().await;
    Response::NotifyOk
}

async fn handle_list_conflicts<S: StoreReadWrite>(store: &Arc<S>) -> Response {
    let mut entries = Vec::new();
    for key in store.conflicted_keys().await {
        let baseline = store.baseline(&key).await.unwrap_or_default();
        let pending = store.list_conflicts(&key).await;
        for record in store.diff_records(&key).await {
            let rejected: Vec<(OperationId, reconciler_core::diff::Operation)> = pending
                .iter()
                .filter(|c| c.diff_id == record.id)
                .map(|c| (c.operation_id, c.operation.clone()))
                .collect();
            if rejected.is_empty() {
                continue;
            }
            entries.push(ConflictEntry {
                key: key.clone(),
                baseline: baseline.clone(),
                applied: record.applied.clone(),
                diff_id: record.id,
                rejected,
            });
        }
    }
    Response::ListConflicts(entries)
}

async fn handle_resolve<S: StoreReadWrite>(
    diff_id: DiffId,
    operation_ids: &[OperationId],
    store: &Arc<S>,
    reconciler: &Arc<Reconciler<S>>,
) -> Response {
    let Some(key) = find_key_for_diff(store, diff_id).await else {
        return error_response(ReconcileError::Internal {
            detail: format!("no outstanding conflict record {diff_id}"),
        });
    };

    let records = store.diff_records(&key).await;
    let Some(record) = records.into_iter().find(|r| r.id == diff_id) else {
        return error_response(ReconcileError::Internal {
            detail: format!("diff record {diff_id} vanished between lookup and resolve"),
        });
    };

    for operation_id in operation_ids {
        let Some(rejected) = record.rejected.get(operation_id.0 as usize) else {
            continue;
        };
        let resolution = match rejected.operation.final_value() {
            Some(value) => Resolution::Set(value.to_owned()),
            None => Resolution::Delete,
        };
        if let Err(err) = store.resolve(&key, diff_id, *operation_id, resolution).await {
            return error_response(err);
        }
    }

    match reconciler.write_back_resolutions(&key).await {
        Ok(()) => Response::ResolveOk,
        Err(err) => error_response(err),
    }
}

async fn find_key_for_diff<S: StoreReadWrite>(store: &Arc<S>, diff_id: DiffId) -> Option<InternalKey> {
    for key in store.conflicted_keys().await {
        if store.diff_records(&key).await.iter().any(|r| r.id == diff_id) {
            return Some(key);
        }
    }
    None
}

fn error_response(err: ReconcileError) -> Response {
    Response::Error(err.to_wire_kind(), err.to_string())
}
