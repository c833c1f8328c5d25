use async_trait::async_trait;
use std::sync::Mutex;

use super::{TrailBook, TrailStore};
use crate::error::{ReplError, Result};
use crate::replica::{ReplicaTrail, TrailUpdate};

/// Non-durable trail store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTrailStore {
    book: Mutex<TrailBook>,
}

impl MemoryTrailStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut TrailBook) -> Result<T>) -> Result<T> {
        let mut book = self
            .book
            .lock()
            .map_err(|_| ReplError::Trail("trail store lock poisoned".to_string()))?;
        f(&mut book)
    }
}

#[async_trait]
impl TrailStore for MemoryTrailStore {
    async fn create_trail(&self, replica_id: u64, snap_name: &str) -> Result<ReplicaTrail> {
        self.with_book(|book| Ok(book.create_or_reuse(replica_id, snap_name)))
    }

    async fn update_trail(&self, trail_id: u64, update: &TrailUpdate) -> Result<ReplicaTrail> {
        self.with_book(|book| book.update(trail_id, update))
    }

    async fn get_trail(&self, trail_id: u64) -> Result<ReplicaTrail> {
        self.with_book(|book| book.get(trail_id))
    }

    async fn list(&self, replica_id: u64) -> Result<Vec<ReplicaTrail>> {
        self.with_book(|book| Ok(book.list(replica_id)))
    }

    async fn latest_succeeded(&self, replica_id: u64) -> Result<Option<ReplicaTrail>> {
        self.with_book(|book| Ok(book.latest_succeeded(replica_id)))
    }
}
