//! Supervisor for concurrent transfer workers.
//!
//! Owns the shared collaborators, the ack routing table and the parent
//! cancellation token. Each transfer runs as its own task with a private ack
//! inbox and a child token; cancelling the parent orphans every worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ReplError, Result};
use crate::replica::TransferId;
use crate::snapshot::SnapshotProvider;
use crate::streaming::channel::{ack_channel, AckSender, DataSink};
use crate::streaming::liveness::LivenessMonitor;
use crate::streaming::protocol::AckMessage;
use crate::streaming::sender::{
    ReplicationWorker, TransferAbort, TransferReport, TransferRequest, WorkerConfig, WorkerContext,
};
use crate::trail::TrailStore;
use crate::transport::control::ControlConnector;

/// Outcome of a spawned transfer task
pub type TransferHandle = JoinHandle<std::result::Result<TransferReport, TransferAbort>>;

/// Routes receiver acks to the inbox of the transfer they name.
#[derive(Debug, Clone, Default)]
pub struct AckRouter {
    routes: Arc<Mutex<HashMap<TransferId, AckSender>>>,
}

impl AckRouter {
    pub fn new() -> Self {
        Self::default()
    }

    // The lock is never held across an await
    fn routes(&self) -> MutexGuard<'_, HashMap<TransferId, AckSender>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an inbox for `id`. Returns false if `id` already has one.
    pub fn register(&self, id: TransferId, tx: AckSender) -> bool {
        let mut routes = self.routes();
        if routes.contains_key(&id) {
            return false;
        }
        routes.insert(id, tx);
        true
    }

    pub fn unregister(&self, id: &TransferId) {
        self.routes().remove(id);
    }

    pub fn is_registered(&self, id: &TransferId) -> bool {
        self.routes().contains_key(id)
    }

    /// Deliver `ack` to its transfer. Unroutable acks are logged and dropped.
    pub async fn route(&self, ack: AckMessage) {
        let Some(id) = ack.id.clone() else {
            tracing::warn!(msg = %ack.msg, "dropping ack without transfer id");
            return;
        };

        // Clone the sender so a full inbox never blocks other routes
        let tx = self.routes().get(&id).cloned();
        match tx {
            Some(tx) => {
                if tx.send(ack).await.is_err() {
                    tracing::warn!(%id, "transfer finished before its ack arrived");
                }
            }
            None => tracing::warn!(%id, msg = %ack.msg, "dropping ack for unknown transfer"),
        }
    }
}

/// Drops the route for a transfer when its task ends, however it ends.
struct RouteGuard {
    router: AckRouter,
    id: TransferId,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.router.unregister(&self.id);
    }
}

pub struct Supervisor {
    config: WorkerConfig,
    connector: Arc<dyn ControlConnector>,
    trails: Arc<dyn TrailStore>,
    snapshots: Arc<dyn SnapshotProvider>,
    data: Arc<dyn DataSink>,
    router: AckRouter,
    token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: WorkerConfig,
        connector: Arc<dyn ControlConnector>,
        trails: Arc<dyn TrailStore>,
        snapshots: Arc<dyn SnapshotProvider>,
        data: Arc<dyn DataSink>,
    ) -> Self {
        Self {
            config,
            connector,
            trails,
            snapshots,
            data,
            router: AckRouter::new(),
            token: CancellationToken::new(),
        }
    }

    /// Router to hand to whatever listens for receiver acks.
    pub fn router(&self) -> AckRouter {
        self.router.clone()
    }

    pub fn trails(&self) -> Arc<dyn TrailStore> {
        self.trails.clone()
    }

    /// Start a worker for `request` on its own task.
    ///
    /// Fails if a transfer with the same id is still running.
    pub async fn spawn_transfer(&self, request: TransferRequest) -> Result<TransferHandle> {
        if self.token.is_cancelled() {
            return Err(ReplError::ChannelClosed("supervisor"));
        }

        let id = request.transfer_id();
        let (tx, acks) = ack_channel();
        if !self.router.register(id.clone(), tx) {
            return Err(ReplError::DuplicateTransfer(id.to_string()));
        }

        let ctx = WorkerContext {
            connector: self.connector.clone(),
            trails: self.trails.clone(),
            snapshots: self.snapshots.clone(),
            data: self.data.clone(),
            acks,
            liveness: LivenessMonitor::new(self.token.child_token()),
        };
        let worker = ReplicationWorker::new(self.config.clone(), request, ctx);
        tracing::info!(%id, "starting transfer");

        let route = RouteGuard {
            router: self.router.clone(),
            id,
        };
        Ok(tokio::spawn(async move {
            let _route = route;
            worker.run().await
        }))
    }

    /// Look up the last successful trail and send `request` incrementally
    /// from it, or in full if there is none.
    pub async fn spawn_incremental(&self, mut request: TransferRequest) -> Result<TransferHandle> {
        request.previous = self.trails.latest_succeeded(request.replica.id).await?;
        self.spawn_transfer(request).await
    }

    /// Orphan every running worker. Workers stop at their next liveness check.
    pub fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.token.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
