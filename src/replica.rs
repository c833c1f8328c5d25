//! Replication relationship and trail records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A replication relationship between a local share and a remote appliance.
///
/// Provided by the scheduler and never mutated by a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub id: u64,
    /// Source pool holding the share
    pub pool: String,
    /// Share being replicated
    pub share: String,
    /// Receiver appliance address (IP or hostname)
    pub appliance: String,
    /// Pool on the receiver that holds the replica
    pub dpool: String,
}

/// Outcome of one replication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TrailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrailStatus::Pending => "pending",
            TrailStatus::Succeeded => "succeeded",
            TrailStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrailStatus::Pending)
    }
}

impl fmt::Display for TrailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one snapshot transfer attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaTrail {
    pub id: u64,
    pub replica_id: u64,
    pub snap_name: String,
    pub status: TrailStatus,
    /// Kilobytes sent, only set on success
    pub kb_sent: Option<u64>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Terminal update applied to a trail.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailUpdate {
    pub status: TrailStatus,
    pub error: Option<String>,
    pub kb_sent: Option<u64>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TrailUpdate {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TrailStatus::Failed,
            error: Some(error.into()),
            kb_sent: None,
            ended_at: Some(Utc::now()),
        }
    }

    /// `bytes_sent` is converted to whole kilobytes, truncating.
    pub fn succeeded(bytes_sent: u64) -> Self {
        Self {
            status: TrailStatus::Succeeded,
            error: None,
            kb_sent: Some(bytes_sent / 1024),
            ended_at: Some(Utc::now()),
        }
    }

    pub fn apply(&self, trail: &mut ReplicaTrail) {
        trail.status = self.status;
        if self.error.is_some() {
            trail.error = self.error.clone();
        }
        if self.kb_sent.is_some() {
            trail.kb_sent = self.kb_sent;
        }
        if self.ended_at.is_some() {
            trail.ended_at = self.ended_at;
        }
    }
}

/// Correlates control, data and ack traffic for one snapshot send.
///
/// Formatted as `<sender_ip>_<pool>_<share>_<snap_name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(sender_ip: &str, replica: &Replica, snap_name: &str) -> Self {
        Self(format!(
            "{}_{}_{}_{}",
            sender_ip, replica.pool, replica.share, snap_name
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<String> for TransferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location of a share snapshot: `<mnt_pt><pool>/<share>_<snap_name>`.
///
/// `mnt_pt` is concatenated verbatim and normally ends with `/`.
pub fn snapshot_path(mnt_pt: &str, pool: &str, share: &str, snap_name: &str) -> PathBuf {
    PathBuf::from(format!("{}{}/{}_{}", mnt_pt, pool, share, snap_name))
}

/// Location of the live share subvolume: `<mnt_pt><pool>/<share>`.
pub fn share_path(mnt_pt: &str, pool: &str, share: &str) -> PathBuf {
    PathBuf::from(format!("{}{}/{}", mnt_pt, pool, share))
}
