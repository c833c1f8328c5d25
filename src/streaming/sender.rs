//! Replication worker for one snapshot transfer.
//!
//! Connects the control channel, makes sure a trail and the local snapshot
//! exist, handshakes with the receiver, streams `btrfs send` output onto the
//! data bus, waits for the receiver's verdict and records it on the trail.
//!
//! Every failure ends the transfer. Steps that fail before a trail exists, or
//! whose failure is the trail write itself, use [`FailurePolicy::fail_fast`].
//! Everything else uses [`FailurePolicy::fail_and_record`] so the trail never
//! stays `pending` when the cause is known.

use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::Instrument;

use crate::config::Config;
use crate::replica::{snapshot_path, Replica, ReplicaTrail, TrailUpdate, TransferId};
use crate::snapshot::SnapshotProvider;
use crate::streaming::channel::{AckInbox, DataSink, TransferStats, ACK_TIMEOUT};
use crate::streaming::liveness::LivenessMonitor;
use crate::streaming::protocol::{AckKind, AckMessage, ControlMessage, DataFrame};
use crate::trail::TrailStore;
use crate::transport::control::{ControlConnector, Endpoint};
use crate::transport::diff::{
    DiffCommand, DiffExit, DiffStreamProcess, ReadOutcome, DIFF_CHUNK_SIZE, READ_POLL_INTERVAL,
};

/// Process exit status for every failed transfer
pub const EXIT_FAILURE_CODE: i32 = 3;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Mount point prefix for snapshot paths
    pub mnt_pt: String,
    /// Diff tool binary
    pub diff_tool: PathBuf,
    /// Bound on each ack wait
    pub ack_timeout: Duration,
    /// Bound on each diff stdout read
    pub read_poll_interval: Duration,
    /// Maximum bytes per data frame
    pub chunk_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mnt_pt: "/mnt2/".to_string(),
            diff_tool: PathBuf::from("/sbin/btrfs"),
            ack_timeout: ACK_TIMEOUT,
            read_poll_interval: READ_POLL_INTERVAL,
            chunk_size: DIFF_CHUNK_SIZE,
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            mnt_pt: config.mnt_pt.clone(),
            diff_tool: config.diff_tool.clone(),
            ack_timeout: config.ack_timeout(),
            read_poll_interval: config.read_poll_interval(),
            chunk_size: config.chunk_size,
        }
    }
}

/// One snapshot to send.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub replica: Replica,
    pub snap_name: String,
    /// Address the receiver knows this sender by
    pub sender_ip: String,
    pub data_port: u16,
    pub meta_port: u16,
    /// Last successful trail; present for an incremental send
    pub previous: Option<ReplicaTrail>,
}

impl TransferRequest {
    pub fn transfer_id(&self) -> TransferId {
        TransferId::new(&self.sender_ip, &self.replica, &self.snap_name)
    }

    pub fn is_incremental(&self) -> bool {
        self.previous.is_some()
    }

    /// `Begin` announcement for this transfer.
    pub fn begin_message(&self) -> ControlMessage {
        ControlMessage::Begin {
            id: self.transfer_id(),
            pool: self.replica.dpool.clone(),
            share: self.replica.share.clone(),
            snap: self.snap_name.clone(),
            ip: self.sender_ip.clone(),
            data_port: self.data_port,
            meta_port: self.meta_port,
            incremental: self.is_incremental(),
        }
    }

    /// Diff invocation: incremental against `previous` when present.
    pub fn diff_command(&self, config: &WorkerConfig) -> DiffCommand {
        let pool = &self.replica.pool;
        let share = &self.replica.share;
        let current = snapshot_path(&config.mnt_pt, pool, share, &self.snap_name);
        match &self.previous {
            Some(prev) => {
                let parent = snapshot_path(&config.mnt_pt, pool, share, &prev.snap_name);
                DiffCommand::incremental(&config.diff_tool, parent, current)
            }
            None => DiffCommand::full(&config.diff_tool, current),
        }
    }
}

/// Collaborators a worker drives.
pub struct WorkerContext {
    pub connector: Arc<dyn ControlConnector>,
    pub trails: Arc<dyn TrailStore>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub data: Arc<dyn DataSink>,
    pub acks: AckInbox,
    pub liveness: LivenessMonitor,
}

/// Successful transfer summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub transfer_id: TransferId,
    pub trail_id: u64,
    pub incremental: bool,
    pub bytes_sent: u64,
    pub kb_sent: u64,
    pub chunks_sent: u64,
}

/// Why a transfer ended early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferAbort {
    /// Logged only; no trail was updated
    #[error("{message}")]
    Fatal { message: String },

    /// The trail was marked `failed` with `message` (best effort)
    #[error("{message}")]
    Recorded { trail_id: u64, message: String },

    /// The supervisor went away mid-transfer
    #[error("supervisor exited; transfer abandoned")]
    Orphaned,
}

impl TransferAbort {
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE_CODE
    }
}

/// The two failure disciplines a transfer step can use.
#[derive(Clone)]
pub struct FailurePolicy {
    trails: Arc<dyn TrailStore>,
    trail_id: Option<u64>,
}

impl FailurePolicy {
    pub fn new(trails: Arc<dyn TrailStore>) -> Self {
        Self {
            trails,
            trail_id: None,
        }
    }

    pub fn with_trail(mut self, trail_id: u64) -> Self {
        self.trail_id = Some(trail_id);
        self
    }

    /// Run `work`; on error log `msg` and abort without touching the trail.
    pub async fn fail_fast<T, E, F>(&self, msg: impl Into<String>, work: F) -> Result<T, TransferAbort>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        match work.await {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = msg.into();
                tracing::error!(error = %e, "{}", message);
                Err(TransferAbort::Fatal { message })
            }
        }
    }

    /// Run `work`; on error log `msg`, mark the trail failed and abort.
    pub async fn fail_and_record<T, E, F>(
        &self,
        msg: impl Into<String>,
        work: F,
    ) -> Result<T, TransferAbort>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        match work.await {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = msg.into();
                tracing::error!(error = %e, "{}", message);
                Err(self.record(message).await)
            }
        }
    }

    /// Mark the trail failed with `message`. A failure to do so is logged
    /// and does not replace the first cause.
    pub async fn record(&self, message: String) -> TransferAbort {
        let Some(trail_id) = self.trail_id else {
            return TransferAbort::Fatal { message };
        };
        if let Err(e) = self
            .trails
            .update_trail(trail_id, &TrailUpdate::failed(message.clone()))
            .await
        {
            tracing::error!(trail_id, error = %e, "could not record failure on trail");
        }
        TransferAbort::Recorded { trail_id, message }
    }
}

/// Sends one snapshot to the receiver.
pub struct ReplicationWorker {
    config: WorkerConfig,
    request: TransferRequest,
    id: TransferId,
    ctx: WorkerContext,
    stats: TransferStats,
}

impl ReplicationWorker {
    pub fn new(config: WorkerConfig, request: TransferRequest, ctx: WorkerContext) -> Self {
        let id = request.transfer_id();
        Self {
            config,
            request,
            id,
            ctx,
            stats: TransferStats::default(),
        }
    }

    pub fn transfer_id(&self) -> &TransferId {
        &self.id
    }

    /// Run the transfer to completion or the first failure.
    pub async fn run(self) -> Result<TransferReport, TransferAbort> {
        let span = tracing::info_span!("transfer", id = %self.id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) -> Result<TransferReport, TransferAbort> {
        let receiver = self.request.replica.appliance.clone();
        let snap = self.request.snap_name.clone();
        let policy = FailurePolicy::new(self.ctx.trails.clone());

        // Connect control channel
        let endpoint = Endpoint::new(&receiver, self.request.meta_port);
        let mut control = policy
            .fail_fast(
                format!(
                    "Failed to connect to receiver {} on meta port {} for snapshot {}. Aborting.",
                    receiver, self.request.meta_port, snap
                ),
                self.ctx.connector.connect(&endpoint),
            )
            .await?;

        // Create or resume the trail
        let trail = policy
            .fail_fast(
                format!("Failed to create replica trail for snapshot {}. Aborting.", snap),
                self.ctx
                    .trails
                    .create_trail(self.request.replica.id, &snap),
            )
            .await?;
        let policy = policy.with_trail(trail.id);
        tracing::debug!(trail_id = trail.id, "using replica trail");

        // Snapshot may already exist from a previous failed attempt
        let snapshot_msg = format!("Failed to create snapshot {}. Aborting.", snap);
        let exists = policy
            .fail_and_record(
                snapshot_msg.clone(),
                self.ctx
                    .snapshots
                    .snapshot_exists(&self.request.replica, &snap),
            )
            .await?;
        if !exists {
            policy
                .fail_and_record(
                    snapshot_msg,
                    self.ctx
                        .snapshots
                        .create_snapshot(&self.request.replica, &snap),
                )
                .await?;
        }

        // Handshake
        tracing::debug!("sending begin");
        policy
            .fail_and_record(
                format!(
                    "Failed to send begin to receiver {}, most likely a network error. Aborting.",
                    receiver
                ),
                control.send(&self.request.begin_message()),
            )
            .await?;
        self.process_ack(
            &policy,
            format!(
                "Timeout occurred ({} seconds) waiting for OK from receiver {} to start sending data. Aborting.",
                self.config.ack_timeout.as_secs(),
                receiver
            ),
        )
        .await?;

        // Stream the diff
        let cmd = self.request.diff_command(&self.config);
        if cmd.is_incremental() {
            tracing::info!("sending incremental replica: {}", cmd);
        } else {
            tracing::info!("sending full replica: {}", cmd);
        }

        let mut proc = match cmd.spawn(self.config.chunk_size, self.config.read_poll_interval) {
            Ok(proc) => proc,
            Err(e) => {
                let msg = format!("Failed to start the diff command ({}). Aborting.", cmd);
                tracing::error!(error = %e, "{}", msg);
                self.publish_end_fail().await;
                return Err(policy.record(msg).await);
            }
        };
        tracing::debug!(pid = ?proc.id(), "diff started");

        let exit = self.stream(&mut proc, &policy).await?;
        tracing::debug!(
            bytes_sent = self.stats.bytes_sent,
            "diff finished ({}), waiting for receiver confirmation",
            exit.describe()
        );

        // Final verdict
        let ack = self
            .process_ack(
                &policy,
                format!(
                    "Timeout occurred ({} seconds) waiting for final confirmation from receiver {} for snapshot {}. Aborting.",
                    self.config.ack_timeout.as_secs(),
                    receiver,
                    snap
                ),
            )
            .await?;
        tracing::debug!(msg = %ack.msg, "confirmation received");

        let failure = if !exit.success() {
            Some(format!(
                "Diff command for snapshot {} failed ({}). Aborting.",
                snap,
                exit.describe()
            ))
        } else if ack.kind() == AckKind::ReceiveError {
            Some(format!(
                "Receiver {} returned a processing error for snapshot {}. Check it for more information.",
                receiver, snap
            ))
        } else {
            None
        };

        let update = match &failure {
            Some(msg) => TrailUpdate::failed(msg.clone()),
            None => TrailUpdate::succeeded(self.stats.bytes_sent),
        };
        policy
            .fail_fast(
                format!("Failed to update final replica status for snapshot {}. Aborting.", snap),
                self.ctx.trails.update_trail(trail.id, &update),
            )
            .await?;

        if let Some(message) = failure {
            tracing::error!("{}", message);
            return Err(TransferAbort::Recorded {
                trail_id: trail.id,
                message,
            });
        }

        tracing::info!(kb_sent = self.stats.kb_sent(), "replica sent");
        Ok(TransferReport {
            transfer_id: self.id.clone(),
            trail_id: trail.id,
            incremental: self.request.is_incremental(),
            bytes_sent: self.stats.bytes_sent,
            kb_sent: self.stats.kb_sent(),
            chunks_sent: self.stats.chunks_sent,
        })
    }

    /// Pop one ack within the configured bound. A receiver `error` ack fails
    /// the transfer with the receiver's text; other acks are returned as-is.
    async fn process_ack(
        &mut self,
        policy: &FailurePolicy,
        timeout_msg: String,
    ) -> Result<AckMessage, TransferAbort> {
        let ack = policy
            .fail_and_record(
                timeout_msg,
                self.ctx.acks.recv_within(self.config.ack_timeout),
            )
            .await?;

        if let AckKind::Error(text) = ack.kind() {
            let msg = format!("Error on Receiver: {}", text);
            tracing::error!("{}", msg);
            return Err(policy.record(msg).await);
        }
        Ok(ack)
    }

    /// Pump diff output onto the data bus until the process has exited and
    /// stdout is drained, then publish exactly one sentinel.
    async fn stream(
        &mut self,
        proc: &mut DiffStreamProcess,
        policy: &FailurePolicy,
    ) -> Result<DiffExit, TransferAbort> {
        let read_msg = format!(
            "Failed reading diff data for snapshot {}. Aborting.",
            self.request.snap_name
        );
        let publish_msg = format!(
            "Failed to send diff data to the receiver for snapshot {}. Aborting.",
            self.request.snap_name
        );

        loop {
            let alive = match proc.is_alive() {
                Ok(alive) => alive,
                Err(e) => return Err(self.abort_stream(proc, policy, &read_msg, e).await),
            };

            let outcome = match proc.read_available().await {
                Ok(outcome) => outcome,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    ReadOutcome::WouldBlock
                }
                Err(e) => return Err(self.abort_stream(proc, policy, &read_msg, e).await),
            };

            if let ReadOutcome::Data(bytes) = outcome {
                let len = bytes.len();
                let frame = DataFrame::chunk(self.id.clone(), bytes);
                self.publish(policy, &publish_msg, &frame).await?;
                self.stats.record_chunk(len);
                tracing::trace!(bytes_sent = self.stats.bytes_sent, "chunk published");
            }

            if !alive && proc.is_drained() {
                let exit = proc.finish().await;
                let frame = if exit.success() {
                    DataFrame::end_success(self.id.clone())
                } else {
                    DataFrame::end_fail(self.id.clone())
                };
                self.publish(policy, &publish_msg, &frame).await?;
                tracing::debug!(
                    sentinel = if exit.success() { "END_SUCCESS" } else { "END_FAIL" },
                    "sent end of stream"
                );
                return Ok(exit);
            }

            if !self.ctx.liveness.is_supervised() {
                tracing::error!(
                    "Supervisor exited. Sender for snapshot {} cannot go on. Aborting.",
                    self.request.snap_name
                );
                return Err(TransferAbort::Orphaned);
            }
        }
    }

    async fn abort_stream(
        &self,
        proc: &mut DiffStreamProcess,
        policy: &FailurePolicy,
        msg: &str,
        err: std::io::Error,
    ) -> TransferAbort {
        tracing::error!(error = %err, "{}", msg);
        if let Err(e) = proc.terminate().await {
            tracing::error!(error = %e, "failed to terminate diff process");
        }
        self.publish_end_fail().await;
        policy.record(msg.to_string()).await
    }

    /// Publish one frame, waiting for room on the bus. A full bus never
    /// outlives the supervisor.
    async fn publish(
        &self,
        policy: &FailurePolicy,
        msg: &str,
        frame: &DataFrame,
    ) -> Result<(), TransferAbort> {
        tokio::select! {
            biased;
            res = policy.fail_and_record(msg, self.ctx.data.publish(frame)) => res,
            _ = self.ctx.liveness.token().cancelled() => {
                tracing::error!(
                    "Supervisor exited while sending snapshot {}. Aborting.",
                    self.request.snap_name
                );
                Err(TransferAbort::Orphaned)
            }
        }
    }

    /// Tell the receiver not to wait for more data. Best effort.
    async fn publish_end_fail(&self) {
        let frame = DataFrame::end_fail(self.id.clone());
        tokio::select! {
            biased;
            res = self.ctx.data.publish(&frame) => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "failed to publish END_FAIL");
                }
            }
            _ = self.ctx.liveness.token().cancelled() => {
                tracing::error!("supervisor exited before END_FAIL could be published");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::TrailStatus;
    use crate::snapshot::BtrfsSnapshotProvider;
    use crate::streaming::channel::{ack_channel, data_bus};
    use crate::streaming::protocol::DataPayload;
    use crate::trail::MemoryTrailStore;
    use crate::transport::control::ChannelConnector;
    use std::io;
    use std::path::Path;
    use std::pin::Pin;
    use std::process::Stdio;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    /// Diff stdout that fails every read
    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "device error")))
        }
    }

    fn request(previous: Option<ReplicaTrail>) -> TransferRequest {
        TransferRequest {
            replica: Replica {
                id: 4,
                pool: "pool0".to_string(),
                share: "docs".to_string(),
                appliance: "10.0.0.2".to_string(),
                dpool: "backup".to_string(),
            },
            snap_name: "docs_2".to_string(),
            sender_ip: "10.0.0.1".to_string(),
            data_port: 10002,
            meta_port: 10003,
            previous,
        }
    }

    fn prev_trail() -> ReplicaTrail {
        ReplicaTrail {
            id: 1,
            replica_id: 4,
            snap_name: "docs_1".to_string(),
            status: TrailStatus::Succeeded,
            kb_sent: Some(10),
            error: None,
            started_at: chrono::Utc::now(),
            ended_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn test_full_diff_command() {
        let cmd = request(None).diff_command(&WorkerConfig::default());
        assert!(!cmd.is_incremental());
        assert_eq!(cmd.args(), vec!["send", "/mnt2/pool0/docs_docs_2"]);
    }

    #[test]
    fn test_incremental_diff_command() {
        let cmd = request(Some(prev_trail())).diff_command(&WorkerConfig::default());
        assert_eq!(cmd.parent(), Some(Path::new("/mnt2/pool0/docs_docs_1")));
        assert_eq!(
            cmd.args(),
            vec!["send", "-p", "/mnt2/pool0/docs_docs_1", "/mnt2/pool0/docs_docs_2"]
        );
    }

    #[test]
    fn test_begin_message_fields() {
        match request(Some(prev_trail())).begin_message() {
            ControlMessage::Begin {
                id,
                pool,
                incremental,
                ..
            } => {
                assert_eq!(id.as_str(), "10.0.0.1_pool0_docs_docs_2");
                assert_eq!(pool, "backup");
                assert!(incremental);
            }
            other => panic!("Expected Begin, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_fast_leaves_trail() {
        let store = Arc::new(MemoryTrailStore::new());
        let trail = store.create_trail(1, "s").await.unwrap();
        let policy = FailurePolicy::new(store.clone()).with_trail(trail.id);

        let err = policy
            .fail_fast("boom", async { Err::<(), _>("io") })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransferAbort::Fatal {
                message: "boom".to_string()
            }
        );
        let trail = store.get_trail(trail.id).await.unwrap();
        assert_eq!(trail.status, TrailStatus::Pending);
    }

    #[tokio::test]
    async fn test_fail_and_record_marks_trail() {
        let store = Arc::new(MemoryTrailStore::new());
        let trail = store.create_trail(1, "s").await.unwrap();
        let policy = FailurePolicy::new(store.clone()).with_trail(trail.id);

        let err = policy
            .fail_and_record("send failed", async { Err::<(), _>("io") })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "send failed");
        assert_eq!(err.exit_code(), EXIT_FAILURE_CODE);

        let trail = store.get_trail(trail.id).await.unwrap();
        assert_eq!(trail.status, TrailStatus::Failed);
        assert_eq!(trail.error.as_deref(), Some("send failed"));
        assert!(trail.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_record_swallows_secondary_failure() {
        let store = Arc::new(MemoryTrailStore::new());
        // No trail 77 exists, so the cleanup update fails
        let policy = FailurePolicy::new(store).with_trail(77);
        let err = policy.record("primary".to_string()).await;
        assert_eq!(
            err,
            TransferAbort::Recorded {
                trail_id: 77,
                message: "primary".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_error_kills_diff_and_ends_stream() {
        let store = Arc::new(MemoryTrailStore::new());
        let trail = store.create_trail(4, "docs_2").await.unwrap();
        let (bus, mut bus_rx) = data_bus();
        let (connector, _control_rx) = ChannelConnector::new();
        let (_ack_tx, acks) = ack_channel();
        let ctx = WorkerContext {
            connector: Arc::new(connector),
            trails: store.clone(),
            snapshots: Arc::new(BtrfsSnapshotProvider::new("/bin/false", "/mnt2/")),
            data: Arc::new(bus),
            acks,
            liveness: LivenessMonitor::detached(),
        };
        let mut worker = ReplicationWorker::new(WorkerConfig::default(), request(None), ctx);
        let id = worker.transfer_id().clone();

        // A diff tool that keeps running while its stdout is broken
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut proc = DiffStreamProcess::from_child(
            child,
            Box::new(FailingReader),
            DIFF_CHUNK_SIZE,
            READ_POLL_INTERVAL,
        );
        let policy = FailurePolicy::new(store.clone()).with_trail(trail.id);

        let err = worker.stream(&mut proc, &policy).await.unwrap_err();
        assert!(matches!(err, TransferAbort::Recorded { .. }));
        assert_eq!(proc.exit_code(), Some(None));

        let trail = store.get_trail(trail.id).await.unwrap();
        assert_eq!(trail.status, TrailStatus::Failed);
        assert!(trail
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Failed reading diff data")));

        let mut frames = Vec::new();
        while let Some(raw) = bus_rx.try_recv() {
            frames.push(DataFrame::decode_for(&id, &raw));
        }
        assert_eq!(frames, vec![Some(DataPayload::EndFail)]);
    }

    #[tokio::test]
    async fn test_fail_and_record_without_trail_is_fatal() {
        let policy = FailurePolicy::new(Arc::new(MemoryTrailStore::new()));
        let err = policy
            .fail_and_record("early", async { Err::<(), _>("io") })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferAbort::Fatal { .. }));
    }
}
