//! Shard coordination and the resumable migration cursor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::scan::{ShardScanner, START};
use crate::cluster::ShardDescriptor;
use crate::connection::Connection;
use crate::error::{MigrationError, Result};

/// Lifecycle of one shard pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Not started, or waiting to be retried
    Pending,
    /// Pages are being fetched
    Scanning,
    /// Final page fetched, its writes are in flight
    Draining,
    /// Every page written
    Done,
    /// Unreachable; excluded until retried
    Failed(String),
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scanning => write!(f, "scanning"),
            Self::Draining => write!(f, "draining"),
            Self::Done => write!(f, "done"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Progress of one shard.
#[derive(Debug, Clone)]
pub struct ShardState {
    /// Shard being scanned
    pub descriptor: ShardDescriptor,
    /// Cursor of the next page to fetch; advanced only after a batch is written
    pub cursor: u64,
    /// Keys fetched and written so far
    pub keys_fetched: u64,
    /// Batches written so far
    pub batches: u64,
    /// Status
    pub status: ShardStatus,
}

/// A batch of keys handed to a shard pipeline.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Shard the keys came from
    pub shard_id: String,
    /// Cursor the page was fetched at
    pub cursor: u64,
    /// Cursor to continue from once this batch is written
    pub next_cursor: u64,
    /// Keys
    pub keys: Vec<Bytes>,
}

impl Batch {
    /// True if this is the shard's final batch
    pub fn is_last(&self) -> bool {
        self.next_cursor == START
    }
}

/// Saved position of one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCursor {
    /// Next cursor to fetch
    pub cursor: u64,
    /// Keys fetched so far
    pub keys_fetched: u64,
    /// Shard has been fully migrated
    pub done: bool,
}

/// Resumable position of a whole run: one cursor per shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCursor {
    /// Per-shard positions, keyed by shard id
    pub shards: BTreeMap<String, ShardCursor>,
}

impl MigrationCursor {
    /// Keys fetched across all shards
    pub fn keys_fetched(&self) -> u64 {
        self.shards.values().map(|s| s.keys_fetched).sum()
    }

    /// True if every shard was fully migrated
    pub fn is_complete(&self) -> bool {
        !self.shards.is_empty() && self.shards.values().all(|s| s.done)
    }

    /// Load a checkpoint written by [`MigrationCursor::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            MigrationError::Config(format!("invalid checkpoint {:?}: {}", path, e))
        })
    }

    /// Write the checkpoint as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MigrationError::Config(format!("cannot encode checkpoint: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Keep `path` in step with this checkpoint: written while any shard is
    /// unfinished, removed once every shard is done. Returns true if written.
    pub fn persist(&self, path: &Path) -> Result<bool> {
        if !self.is_complete() {
            self.save(path)?;
            return Ok(true);
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Tracks every source shard and hands out their batches.
///
/// Shared by all shard pipelines. The lock is never held across a network
/// call: a pipeline reads its cursor, scans, then records the result.
pub struct ShardCoordinator {
    scanner: ShardScanner,
    shards: RwLock<Vec<ShardState>>,
}

impl ShardCoordinator {
    /// Coordinator over `shards`, all pending at the start of their keyspace
    pub fn new(shards: Vec<ShardDescriptor>, scanner: ShardScanner) -> Self {
        let shards = shards
            .into_iter()
            .map(|descriptor| ShardState {
                descriptor,
                cursor: START,
                keys_fetched: 0,
                batches: 0,
                status: ShardStatus::Pending,
            })
            .collect::<Vec<_>>();
        debug!(
            shards = shards.len(),
            count = scanner.count(),
            pattern = scanner.pattern().unwrap_or("*"),
            "shard coordinator ready"
        );
        Self {
            scanner,
            shards: RwLock::new(shards),
        }
    }

    /// Restore positions from a checkpoint. Shards the checkpoint does not
    /// know start from the beginning.
    pub fn resume_from(&self, checkpoint: &MigrationCursor) {
        let mut shards = self.shards.write();
        for shard in shards.iter_mut() {
            match checkpoint.shards.get(&shard.descriptor.id) {
                Some(saved) => {
                    shard.cursor = saved.cursor;
                    shard.keys_fetched = saved.keys_fetched;
                    shard.status = if saved.done {
                        ShardStatus::Done
                    } else {
                        ShardStatus::Pending
                    };
                    debug!(shard = %shard.descriptor.id, cursor = saved.cursor, done = saved.done, "resuming shard");
                }
                None => {
                    warn!(shard = %shard.descriptor.id, "shard not in checkpoint, starting from the beginning");
                }
            }
        }
    }

    /// Descriptors of the shards waiting to run
    pub fn pending(&self) -> Vec<ShardDescriptor> {
        self.shards
            .read()
            .iter()
            .filter(|s| s.status == ShardStatus::Pending)
            .map(|s| s.descriptor.clone())
            .collect()
    }

    /// Fetch the next batch of `shard_id`. `None` once the shard is done or
    /// no longer runnable.
    ///
    /// The shard's cursor is not moved; call [`ShardCoordinator::commit`]
    /// after the batch has been written.
    pub async fn next_batch(
        &self,
        shard_id: &str,
        conn: &mut dyn Connection,
    ) -> Result<Option<Batch>> {
        let cursor = {
            let mut shards = self.shards.write();
            let shard = find_mut(&mut shards, shard_id)?;
            match shard.status {
                ShardStatus::Pending | ShardStatus::Scanning => {
                    shard.status = ShardStatus::Scanning;
                    shard.cursor
                }
                _ => return Ok(None),
            }
        };

        let page = self.scanner.next(conn, cursor).await?;

        if page.is_last() {
            let mut shards = self.shards.write();
            let shard = find_mut(&mut shards, shard_id)?;
            if shard.status == ShardStatus::Scanning {
                shard.status = ShardStatus::Draining;
            }
        }

        Ok(Some(Batch {
            shard_id: shard_id.to_string(),
            cursor,
            next_cursor: page.cursor,
            keys: page.keys,
        }))
    }

    /// Record that `batch` has been written: advance its shard's cursor.
    pub fn commit(&self, batch: &Batch) -> Result<()> {
        let mut shards = self.shards.write();
        let shard = find_mut(&mut shards, &batch.shard_id)?;
        if shard.cursor != batch.cursor {
            return Err(MigrationError::Aborted(format!(
                "shard {} committed out of order",
                batch.shard_id
            )));
        }
        shard.cursor = batch.next_cursor;
        shard.keys_fetched += batch.keys.len() as u64;
        shard.batches += 1;
        if batch.is_last() {
            shard.status = ShardStatus::Done;
        }
        Ok(())
    }

    /// Stop a shard at a batch boundary; it stays resumable from its cursor.
    pub fn pause(&self, shard_id: &str) {
        let mut shards = self.shards.write();
        if let Ok(shard) = find_mut(&mut shards, shard_id) {
            if matches!(shard.status, ShardStatus::Scanning | ShardStatus::Draining) {
                shard.status = ShardStatus::Pending;
            }
        }
    }

    /// Mark a shard unreachable. Its cursor stays at the last written batch.
    pub fn fail(&self, shard_id: &str, reason: impl Into<String>) {
        let mut shards = self.shards.write();
        if let Ok(shard) = find_mut(&mut shards, shard_id) {
            shard.status = ShardStatus::Failed(reason.into());
        }
    }

    /// Mark every shard that is still mid-flight as failed.
    pub fn fail_unsettled(&self, reason: &str) {
        let mut shards = self.shards.write();
        for shard in shards.iter_mut() {
            if matches!(shard.status, ShardStatus::Scanning | ShardStatus::Draining) {
                shard.status = ShardStatus::Failed(reason.to_string());
            }
        }
    }

    /// Put a failed shard back in the queue. Returns false if it was not failed.
    pub fn retry(&self, shard_id: &str) -> bool {
        let mut shards = self.shards.write();
        match find_mut(&mut shards, shard_id) {
            Ok(shard) if matches!(shard.status, ShardStatus::Failed(_)) => {
                shard.status = ShardStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// True once every shard is done. A failed shard keeps this false.
    pub fn all_exhausted(&self) -> bool {
        self.shards
            .read()
            .iter()
            .all(|s| s.status == ShardStatus::Done)
    }

    /// Failed shards and their reasons
    pub fn failed(&self) -> Vec<(String, String)> {
        self.shards
            .read()
            .iter()
            .filter_map(|s| match &s.status {
                ShardStatus::Failed(reason) => Some((s.descriptor.id.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of shards that are done
    pub fn done_count(&self) -> usize {
        self.shards
            .read()
            .iter()
            .filter(|s| s.status == ShardStatus::Done)
            .count()
    }

    /// Keys fetched and written across all shards; never decreases.
    pub fn keys_fetched(&self) -> u64 {
        self.shards.read().iter().map(|s| s.keys_fetched).sum()
    }

    /// Copy of every shard's state
    pub fn snapshot(&self) -> Vec<ShardState> {
        self.shards.read().clone()
    }

    /// Current resumable position
    pub fn checkpoint(&self) -> MigrationCursor {
        let shards = self
            .shards
            .read()
            .iter()
            .map(|s| {
                (
                    s.descriptor.id.clone(),
                    ShardCursor {
                        cursor: s.cursor,
                        keys_fetched: s.keys_fetched,
                        done: s.status == ShardStatus::Done,
                    },
                )
            })
            .collect();
        MigrationCursor { shards }
    }
}

fn find_mut<'a>(shards: &'a mut [ShardState], id: &str) -> Result<&'a mut ShardState> {
    shards
        .iter_mut()
        .find(|s| s.descriptor.id == id)
        .ok_or_else(|| MigrationError::Topology(format!("unknown shard '{}'", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SlotRange;
    use crate::testing::MemoryStore;

    fn descriptor(id: &str) -> ShardDescriptor {
        ShardDescriptor {
            id: id.to_string(),
            addr: id.to_string(),
            slots: vec![SlotRange::full()],
        }
    }

    fn store_with_keys(n: usize) -> MemoryStore {
        let store = MemoryStore::new("s1");
        for i in 0..n {
            store.set(format!("k{:03}", i), "v");
        }
        store
    }

    #[tokio::test]
    async fn test_batches_until_exhausted() {
        let store = store_with_keys(5);
        let mut conn = store.connection();
        let coordinator = ShardCoordinator::new(vec![descriptor("s1")], ShardScanner::new(2, None));

        let mut batches = 0;
        while let Some(batch) = coordinator.next_batch("s1", &mut conn).await.unwrap() {
            batches += 1;
            coordinator.commit(&batch).unwrap();
        }
        assert_eq!(batches, 3);
        assert!(coordinator.all_exhausted());
        assert_eq!(coordinator.keys_fetched(), 5);
        assert!(coordinator.checkpoint().is_complete());
    }

    #[tokio::test]
    async fn test_final_batch_drains_before_done() {
        let store = store_with_keys(1);
        let mut conn = store.connection();
        let coordinator = ShardCoordinator::new(vec![descriptor("s1")], ShardScanner::new(10, None));

        let batch = coordinator.next_batch("s1", &mut conn).await.unwrap().unwrap();
        assert!(batch.is_last());
        assert_eq!(coordinator.snapshot()[0].status, ShardStatus::Draining);
        assert!(!coordinator.all_exhausted());

        coordinator.commit(&batch).unwrap();
        assert_eq!(coordinator.snapshot()[0].status, ShardStatus::Done);
    }

    #[tokio::test]
    async fn test_failed_shard_blocks_exhaustion_until_retried() {
        let store = store_with_keys(4);
        let mut conn = store.connection();
        let coordinator = ShardCoordinator::new(
            vec![descriptor("s1"), descriptor("s2")],
            ShardScanner::new(2, None),
        );

        let batch = coordinator.next_batch("s1", &mut conn).await.unwrap().unwrap();
        coordinator.commit(&batch).unwrap();
        coordinator.fail("s1", "connection reset");

        assert!(!coordinator.all_exhausted());
        assert_eq!(coordinator.failed().len(), 1);
        assert!(coordinator.next_batch("s1", &mut conn).await.unwrap().is_none());

        assert!(coordinator.retry("s1"));
        assert!(!coordinator.retry("s2"));
        let resumed = coordinator.next_batch("s1", &mut conn).await.unwrap().unwrap();
        assert_eq!(resumed.cursor, batch.next_cursor);
    }

    #[tokio::test]
    async fn test_checkpoint_resume() {
        let store = store_with_keys(6);
        let mut conn = store.connection();
        let first = ShardCoordinator::new(vec![descriptor("s1")], ShardScanner::new(2, None));
        let batch = first.next_batch("s1", &mut conn).await.unwrap().unwrap();
        first.commit(&batch).unwrap();
        first.pause("s1");
        let checkpoint = first.checkpoint();
        assert!(!checkpoint.is_complete());
        assert_eq!(checkpoint.keys_fetched(), 2);

        let second = ShardCoordinator::new(vec![descriptor("s1")], ShardScanner::new(2, None));
        second.resume_from(&checkpoint);
        let mut remaining = 0;
        while let Some(batch) = second.next_batch("s1", &mut conn).await.unwrap() {
            remaining += batch.keys.len();
            second.commit(&batch).unwrap();
        }
        assert_eq!(remaining, 4);
        assert_eq!(second.keys_fetched(), 6);
    }

    #[test]
    fn test_out_of_order_commit_is_rejected() {
        let coordinator = ShardCoordinator::new(vec![descriptor("s1")], ShardScanner::new(2, None));
        let stale = Batch {
            shard_id: "s1".into(),
            cursor: 42,
            next_cursor: 44,
            keys: vec![],
        };
        assert!(coordinator.commit(&stale).is_err());
    }

    #[test]
    fn test_checkpoint_file_round_trip() {
        let mut cursor = MigrationCursor::default();
        cursor.shards.insert(
            "node-a".into(),
            ShardCursor {
                cursor: 128,
                keys_fetched: 1000,
                done: false,
            },
        );
        let path = std::env::temp_dir().join(format!("checkpoint-{}.json", uuid::Uuid::new_v4()));
        cursor.save(&path).unwrap();
        let loaded = MigrationCursor::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, cursor);
    }
}
