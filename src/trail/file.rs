// File-backed trail store
//
// Keeps every trail in one JSON document (default ~/.local/share/snapsend/trails.json).
// Each operation takes an exclusive lock on a sibling .lock file, reloads the
// document, and rewrites it atomically, so several sender processes can share it.

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{TrailBook, TrailStore};
use crate::error::{ReplError, Result};
use crate::replica::{ReplicaTrail, TrailUpdate};

#[derive(Debug, Serialize, Deserialize)]
struct TrailFile {
    version: u32,
    #[serde(flatten)]
    book: TrailBook,
}

#[derive(Debug, Clone)]
pub struct FileTrailStore {
    path: PathBuf,
}

impl FileTrailStore {
    /// Format version
    const FORMAT_VERSION: u32 = 1;

    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    /// Default location (~/.local/share/snapsend/trails.json)
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = if let Some(dir) = dirs::data_local_dir() {
            dir
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local").join("share")
        } else {
            return Err(ReplError::Config(
                "Cannot determine data directory (HOME not set)".to_string(),
            ));
        };
        Ok(data_dir.join("snapsend").join("trails.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<TrailBook> {
        if !path.exists() {
            return Ok(TrailBook::default());
        }
        let data = fs::read(path)?;
        if data.is_empty() {
            return Ok(TrailBook::default());
        }
        let file: TrailFile = serde_json::from_slice(&data)?;
        if file.version != Self::FORMAT_VERSION {
            return Err(ReplError::Trail(format!(
                "unsupported trail file version {} in {}",
                file.version,
                path.display()
            )));
        }
        Ok(file.book)
    }

    /// Save the whole book (atomic write)
    fn save(path: &Path, book: &TrailBook) -> Result<()> {
        let temp_file = path.with_extension("tmp");

        {
            let mut file = fs::File::create(&temp_file)?;
            let doc = TrailFile {
                version: Self::FORMAT_VERSION,
                book: book.clone(),
            };
            serde_json::to_writer_pretty(&mut file, &doc)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }

        // Atomic rename
        fs::rename(&temp_file, path)?;

        Ok(())
    }

    /// Run `f` against the current book under the store lock.
    fn transact<T>(
        path: &Path,
        write: bool,
        f: impl FnOnce(&mut TrailBook) -> Result<T>,
    ) -> Result<T> {
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.with_extension("lock"))?;
        lock.lock_exclusive()?;

        let mut book = Self::load(path)?;
        let out = f(&mut book)?;
        if write {
            Self::save(path, &book)?;
        }

        // Lock is released when `lock` is closed
        Ok(out)
    }

    async fn run<T, F>(&self, write: bool, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TrailBook) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::transact(&path, write, f))
            .await
            .map_err(|e| ReplError::Trail(format!("trail store task failed: {}", e)))?
    }
}

#[async_trait]
impl TrailStore for FileTrailStore {
    async fn create_trail(&self, replica_id: u64, snap_name: &str) -> Result<ReplicaTrail> {
        let snap_name = snap_name.to_string();
        self.run(true, move |book| Ok(book.create_or_reuse(replica_id, &snap_name)))
            .await
    }

    async fn update_trail(&self, trail_id: u64, update: &TrailUpdate) -> Result<ReplicaTrail> {
        let update = update.clone();
        self.run(true, move |book| book.update(trail_id, &update))
            .await
    }

    async fn get_trail(&self, trail_id: u64) -> Result<ReplicaTrail> {
        self.run(false, move |book| book.get(trail_id)).await
    }

    async fn list(&self, replica_id: u64) -> Result<Vec<ReplicaTrail>> {
        self.run(false, move |book| Ok(book.list(replica_id))).await
    }

    async fn latest_succeeded(&self, replica_id: u64) -> Result<Option<ReplicaTrail>> {
        self.run(false, move |book| Ok(book.latest_succeeded(replica_id)))
            .await
    }
}
