//! Channel types connecting a transfer worker to the outside world.
//!
//! Ack inbox: receiver acks -> worker (one inbox per transfer)
//! Data bus: all workers -> receiver data port (shared, multi-producer)

use crate::error::{ReplError, Result};
use crate::streaming::protocol::{AckMessage, DataFrame};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bound on every wait for a receiver acknowledgment
pub const ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Channel size for acks routed to one worker
pub const ACK_CHANNEL_SIZE: usize = 16;

/// Data bus capacity in frames; publishers wait once it is full
pub const DATA_CHANNEL_SIZE: usize = 32;

// =============================================================================
// AckInbox: receiver -> worker
// =============================================================================

/// Producer half of an ack inbox, held by whoever listens to the receiver
pub type AckSender = mpsc::Sender<AckMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckWaitError {
    #[error("no acknowledgment within {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("ack inbox closed")]
    Closed,
}

/// Inbound acknowledgments for a single transfer.
#[derive(Debug)]
pub struct AckInbox {
    rx: mpsc::Receiver<AckMessage>,
}

impl AckInbox {
    /// Pop one ack, waiting at most `timeout`.
    pub async fn recv_within(
        &mut self,
        timeout: Duration,
    ) -> std::result::Result<AckMessage, AckWaitError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(ack)) => Ok(ack),
            Ok(None) => Err(AckWaitError::Closed),
            Err(_) => Err(AckWaitError::Timeout(timeout)),
        }
    }
}

/// Create a bounded ack inbox.
pub fn ack_channel() -> (AckSender, AckInbox) {
    let (tx, rx) = mpsc::channel(ACK_CHANNEL_SIZE);
    (tx, AckInbox { rx })
}

// =============================================================================
// DataSink: worker -> receiver
// =============================================================================

/// Destination for diff data frames.
///
/// Implementations must preserve publish order per publisher and must never
/// alter the transfer id tag. `publish` waits while the destination is full.
#[async_trait]
pub trait DataSink: Send + Sync {
    async fn publish(&self, frame: &DataFrame) -> Result<()>;
}

/// Shared publish side of the data bus. Clone one per worker.
#[derive(Debug, Clone)]
pub struct DataBus {
    tx: mpsc::Sender<Bytes>,
}

/// Single consumer of the data bus, normally the network forwarder.
#[derive(Debug)]
pub struct DataBusReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl DataBusReceiver {
    /// Next raw bus message, or `None` once every publisher is dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl DataSink for DataBus {
    async fn publish(&self, frame: &DataFrame) -> Result<()> {
        self.tx
            .send(frame.encode())
            .await
            .map_err(|_| ReplError::ChannelClosed("data"))
    }
}

/// Create the data bus, holding at most [`DATA_CHANNEL_SIZE`] frames.
pub fn data_bus() -> (DataBus, DataBusReceiver) {
    let (tx, rx) = mpsc::channel(DATA_CHANNEL_SIZE);
    (DataBus { tx }, DataBusReceiver { rx })
}

// =============================================================================
// Transfer statistics
// =============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Diff bytes published, sentinels excluded
    pub bytes_sent: u64,

    /// Non-empty data frames published
    pub chunks_sent: u64,
}

impl TransferStats {
    pub fn record_chunk(&mut self, len: usize) {
        self.bytes_sent += len as u64;
        self.chunks_sent += 1;
    }

    pub fn kb_sent(&self) -> u64 {
        self.bytes_sent / 1024
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::TransferId;
    use crate::streaming::protocol::DataPayload;

    fn id(name: &str) -> TransferId {
        TransferId::from(name.to_string())
    }

    #[tokio::test]
    async fn test_ack_delivered() {
        let (tx, mut inbox) = ack_channel();
        tx.send(AckMessage::ok(id("t1"), "ok")).await.unwrap();

        let ack = inbox.recv_within(ACK_TIMEOUT).await.unwrap();
        assert_eq!(ack.msg, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout() {
        let (_tx, mut inbox) = ack_channel();
        let err = inbox.recv_within(ACK_TIMEOUT).await.unwrap_err();
        assert_eq!(err, AckWaitError::Timeout(ACK_TIMEOUT));
        assert_eq!(
            err.to_string(),
            "no acknowledgment within 60 seconds".to_string()
        );
    }

    #[tokio::test]
    async fn test_ack_closed() {
        let (tx, mut inbox) = ack_channel();
        drop(tx);
        assert_eq!(
            inbox.recv_within(ACK_TIMEOUT).await.unwrap_err(),
            AckWaitError::Closed
        );
    }

    #[tokio::test]
    async fn test_concurrent_publishers_keep_order() {
        let (bus, mut rx) = data_bus();

        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    let frame = DataFrame::chunk(id(name), Bytes::from(vec![i]));
                    bus.publish(&frame).await.unwrap();
                    tokio::task::yield_now().await;
                }
                bus.publish(&DataFrame::end_success(id(name))).await.unwrap();
            }));
        }
        drop(bus);

        // More frames than the bus holds, so drain while they publish
        let mut seen = std::collections::HashMap::<&str, Vec<DataPayload>>::new();
        while let Some(raw) = rx.recv().await {
            for name in ["a", "b", "c"] {
                if let Some(p) = DataFrame::decode_for(&id(name), &raw) {
                    seen.entry(name).or_default().push(p);
                }
            }
        }
        for h in handles {
            h.await.unwrap();
        }

        for name in ["a", "b", "c"] {
            let payloads = &seen[name];
            assert_eq!(payloads.len(), 51);
            for (i, p) in payloads[..50].iter().enumerate() {
                assert_eq!(p, &DataPayload::Chunk(Bytes::from(vec![i as u8])));
            }
            assert_eq!(payloads[50], DataPayload::EndSuccess);
        }
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped() {
        let (bus, rx) = data_bus();
        drop(rx);
        let err = bus
            .publish(&DataFrame::end_fail(id("t1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::ChannelClosed("data")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_consumer_blocks_publisher() {
        let (bus, mut rx) = data_bus();
        let chunk = Bytes::from(vec![0u8; 1024]);
        for _ in 0..DATA_CHANNEL_SIZE {
            bus.publish(&DataFrame::chunk(id("t1"), chunk.clone()))
                .await
                .unwrap();
        }

        // Bus is full: the next publish waits instead of buffering
        let frame = DataFrame::chunk(id("t1"), chunk.clone());
        let waited = tokio::time::timeout(Duration::from_secs(5), bus.publish(&frame)).await;
        assert!(waited.is_err());

        assert!(rx.recv().await.is_some());
        tokio::time::timeout(Duration::from_secs(5), bus.publish(&frame))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_transfer_stats() {
        let mut stats = TransferStats::default();
        stats.record_chunk(1500);
        stats.record_chunk(600);
        assert_eq!(stats.bytes_sent, 2100);
        assert_eq!(stats.chunks_sent, 2);
        assert_eq!(stats.kb_sent(), 2);
    }
}
