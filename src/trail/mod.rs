//! Replication trail persistence.
//!
//! One trail per transfer attempt. At most one trail per (replica, snapshot)
//! is `pending` at a time: creating a trail while one is pending returns the
//! pending one so a retried transfer resumes the same record.

mod file;
mod memory;

pub use file::FileTrailStore;
pub use memory::MemoryTrailStore;

use crate::error::{ReplError, Result};
use crate::replica::{ReplicaTrail, TrailStatus, TrailUpdate};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait TrailStore: Send + Sync {
    /// Return the pending trail for `(replica_id, snap_name)` or create one.
    async fn create_trail(&self, replica_id: u64, snap_name: &str) -> Result<ReplicaTrail>;

    async fn update_trail(&self, trail_id: u64, update: &TrailUpdate) -> Result<ReplicaTrail>;

    async fn get_trail(&self, trail_id: u64) -> Result<ReplicaTrail>;

    /// All trails of a replica, oldest first.
    async fn list(&self, replica_id: u64) -> Result<Vec<ReplicaTrail>>;

    /// Most recent succeeded trail, the base for an incremental send.
    async fn latest_succeeded(&self, replica_id: u64) -> Result<Option<ReplicaTrail>>;
}

/// Trail records plus id allocation, shared by the store implementations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct TrailBook {
    next_id: u64,
    trails: Vec<ReplicaTrail>,
}

impl TrailBook {
    pub(crate) fn create_or_reuse(&mut self, replica_id: u64, snap_name: &str) -> ReplicaTrail {
        if let Some(existing) = self.trails.iter().find(|t| {
            t.replica_id == replica_id && t.snap_name == snap_name && !t.status.is_terminal()
        }) {
            tracing::info!(
                trail_id = existing.id,
                "reusing pending trail for {} from a previous attempt",
                snap_name
            );
            return existing.clone();
        }

        self.next_id += 1;
        let trail = ReplicaTrail {
            id: self.next_id,
            replica_id,
            snap_name: snap_name.to_string(),
            status: TrailStatus::Pending,
            kb_sent: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.trails.push(trail.clone());
        trail
    }

    pub(crate) fn update(&mut self, trail_id: u64, update: &TrailUpdate) -> Result<ReplicaTrail> {
        let trail = self
            .trails
            .iter_mut()
            .find(|t| t.id == trail_id)
            .ok_or(ReplError::TrailNotFound(trail_id))?;
        update.apply(trail);
        Ok(trail.clone())
    }

    pub(crate) fn get(&self, trail_id: u64) -> Result<ReplicaTrail> {
        self.trails
            .iter()
            .find(|t| t.id == trail_id)
            .cloned()
            .ok_or(ReplError::TrailNotFound(trail_id))
    }

    pub(crate) fn list(&self, replica_id: u64) -> Vec<ReplicaTrail> {
        self.trails
            .iter()
            .filter(|t| t.replica_id == replica_id)
            .cloned()
            .collect()
    }

    pub(crate) fn latest_succeeded(&self, replica_id: u64) -> Option<ReplicaTrail> {
        self.trails
            .iter()
            .filter(|t| t.replica_id == replica_id && t.status == TrailStatus::Succeeded)
            .max_by_key(|t| t.id)
            .cloned()
    }
}
