//! Local snapshot provisioning.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{ReplError, Result};
use crate::replica::{share_path, snapshot_path, Replica};

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot_exists(&self, replica: &Replica, snap_name: &str) -> Result<bool>;

    async fn create_snapshot(&self, replica: &Replica, snap_name: &str) -> Result<()>;
}

/// Read-only btrfs snapshots under the appliance mount point.
#[derive(Debug, Clone)]
pub struct BtrfsSnapshotProvider {
    btrfs: PathBuf,
    mnt_pt: String,
}

impl BtrfsSnapshotProvider {
    pub fn new(btrfs: impl Into<PathBuf>, mnt_pt: impl Into<String>) -> Self {
        Self {
            btrfs: btrfs.into(),
            mnt_pt: mnt_pt.into(),
        }
    }
}

#[async_trait]
impl SnapshotProvider for BtrfsSnapshotProvider {
    async fn snapshot_exists(&self, replica: &Replica, snap_name: &str) -> Result<bool> {
        let path = snapshot_path(&self.mnt_pt, &replica.pool, &replica.share, snap_name);
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn create_snapshot(&self, replica: &Replica, snap_name: &str) -> Result<()> {
        let share_dir = share_path(&self.mnt_pt, &replica.pool, &replica.share);
        let dest = snapshot_path(&self.mnt_pt, &replica.pool, &replica.share, snap_name);

        let output = Command::new(&self.btrfs)
            .arg("subvolume")
            .arg("snapshot")
            .arg("-r")
            .arg(&share_dir)
            .arg(&dest)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ReplError::Spawn {
                program: self.btrfs.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ReplError::Snapshot(format!(
                "failed to snapshot {} to {}: {}",
                share_dir.display(),
                dest.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!("created snapshot {}", dest.display());
        Ok(())
    }
}
