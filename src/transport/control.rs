//! Network plumbing to the receiver: control push, ack listener, data forwarder.
//!
//! Every stream uses the length-prefixed frames from `streaming::protocol`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::ReplError;
use crate::streaming::channel::DataBusReceiver;
use crate::streaming::protocol::{
    encode_frame, read_frame, write_frame, AckMessage, ControlMessage, MessageType,
};
use crate::streaming::supervisor::AckRouter;

/// Default bound on establishing the control connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A `tcp://host:port` address on the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form accepted by `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Control channel
// =============================================================================

/// One-way channel to the receiver's control endpoint.
#[async_trait]
pub trait ControlChannel: Send {
    async fn send(&mut self, msg: &ControlMessage) -> Result<()>;
}

/// Opens control channels; lets tests and co-located receivers skip TCP.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ControlChannel>>;
}

pub struct TcpControlChannel {
    stream: TcpStream,
}

#[async_trait]
impl ControlChannel for TcpControlChannel {
    async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        write_frame(&mut self.stream, &msg.encode()?).await?;
        self.stream
            .flush()
            .await
            .context("Failed to flush control message")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl ControlConnector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ControlChannel>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(endpoint.addr()))
            .await
            .map_err(|_| {
                ReplError::Network(format!(
                    "timed out connecting to {} after {:?}",
                    endpoint, self.timeout
                ))
            })?
            .with_context(|| format!("Failed to connect to {}", endpoint))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpControlChannel { stream }))
    }
}

/// In-process control channel backed by an mpsc queue.
pub struct ChannelControl {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

#[async_trait]
impl ControlChannel for ChannelControl {
    async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        self.tx
            .send(msg.clone())
            .map_err(|_| ReplError::ChannelClosed("control"))?;
        Ok(())
    }
}

/// Connector handing out [`ChannelControl`]s that all feed one queue.
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ControlConnector for ChannelConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn ControlChannel>> {
        Ok(Box::new(ChannelControl {
            tx: self.tx.clone(),
        }))
    }
}

// =============================================================================
// Ack listener
// =============================================================================

/// Accept receiver connections and route their acks until the listener fails.
pub async fn serve_acks(listener: TcpListener, router: AckRouter) -> Result<()> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("Failed to accept ack connection")?;
        tracing::debug!(%peer, "ack connection accepted");

        let router = router.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            if let Err(e) = read_acks(&mut stream, &router).await {
                tracing::warn!(%peer, "ack connection failed: {:#}", e);
            }
        });
    }
}

/// Route every ack frame from `reader` until a clean end of stream.
pub async fn read_acks<R: AsyncRead + Unpin>(reader: &mut R, router: &AckRouter) -> Result<()> {
    loop {
        let (msg_type, payload) = match read_frame(reader).await {
            Ok(frame) => frame,
            Err(e) if is_eof(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        match msg_type {
            MessageType::Ack => {
                let ack = AckMessage::decode(payload)?;
                router.route(ack).await;
            }
            other => {
                tracing::warn!("ignoring unexpected {:?} frame on ack connection", other);
            }
        }
    }
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}

// =============================================================================
// Data forwarder
// =============================================================================

/// Drain the data bus onto `writer` in publish order.
///
/// Returns the number of bus messages forwarded once all publishers are gone.
pub async fn forward_data<W: AsyncWrite + Unpin>(
    mut rx: DataBusReceiver,
    writer: &mut W,
) -> Result<u64> {
    let mut forwarded = 0u64;
    while let Some(raw) = rx.recv().await {
        write_frame(writer, &encode_frame(MessageType::Data, &raw)?).await?;
        writer.flush().await.context("Failed to flush data frame")?;
        forwarded += 1;
    }
    Ok(forwarded)
}
