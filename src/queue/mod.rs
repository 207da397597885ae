// queue/mod.rs - Durable offline queue of pending local operations
//
// FIFO of operations awaiting server acknowledgement, persisted as a single
// JSON file rewritten atomically on every mutation (temp file, fsync,
// rename). Deduplicates by op id; the change-log reader may deliver the
// same operation more than once.

use crate::protocol::{QueueStatus, QueuedOperation, SyncOperation};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// On-disk layout of the queue file.
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    saved_at: DateTime<Utc>,
    items: Vec<QueuedOperation>,
}

const QUEUE_FILE_VERSION: u32 = 1;

/// Counts of queued operations by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retrying: usize,
    pub failed: usize,
    pub total: usize,
}

/// Durable FIFO of operations produced locally and not yet acknowledged.
pub struct OfflineQueue {
    path: PathBuf,
    items: Vec<QueuedOperation>,
    index: HashMap<u64, usize>,
    max_retries: u32,
    open: bool,
}

impl OfflineQueue {
    /// Creates a closed queue bound to a file path. Call `open` before use.
    pub fn new(path: impl Into<PathBuf>, max_retries: u32) -> Self {
        Self {
            path: path.into(),
            items: Vec::new(),
            index: HashMap::new(),
            max_retries,
            open: false,
        }
    }

    /// Loads the queue file, creating the storage directory if absent.
    ///
    /// A corrupt file is logged and treated as an empty queue rather than
    /// blocking sync. Fails if the queue is already open.
    pub async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::State("queue is already open".to_string()));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<QueueFile>(&bytes) {
                Ok(file) => {
                    self.items = file.items;
                    tracing::info!(
                        "Loaded offline queue with {} item(s) from {}",
                        self.items.len(),
                        self.path.display()
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Offline queue file {} is unreadable, starting empty: {}",
                        self.path.display(),
                        e
                    );
                    self.items.clear();
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.items.clear();
            }
            Err(e) => return Err(e.into()),
        }

        self.rebuild_index();
        self.open = true;
        Ok(())
    }

    /// Persists and closes the queue. Subsequent operations fail.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.persist().await?;
        self.open = false;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Appends a new pending operation unless its op id is already queued.
    /// Returns false for duplicates.
    pub async fn enqueue(&mut self, operation: SyncOperation) -> Result<bool> {
        self.ensure_open()?;
        if self.index.contains_key(&operation.op_id) {
            tracing::debug!("Skipping duplicate op {}", operation.op_id);
            return Ok(false);
        }
        self.insert(operation);
        self.persist().await?;
        Ok(true)
    }

    /// Appends a batch, skipping duplicates, with a single persistence pass.
    /// Returns the number of operations added.
    pub async fn enqueue_all(&mut self, operations: Vec<SyncOperation>) -> Result<usize> {
        self.ensure_open()?;
        let mut added = 0;
        for operation in operations {
            if self.index.contains_key(&operation.op_id) {
                continue;
            }
            self.insert(operation);
            added += 1;
        }
        if added > 0 {
            self.persist().await?;
        }
        Ok(added)
    }

    /// Returns up to `limit` operations in FIFO order with op id greater
    /// than `since_op_id`. Does not mutate the queue.
    pub fn get_pending(
        &self,
        since_op_id: u64,
        limit: usize,
        include_retrying: bool,
    ) -> Result<Vec<QueuedOperation>> {
        self.ensure_open()?;
        Ok(self
            .items
            .iter()
            .filter(|item| item.operation.op_id > since_op_id)
            .filter(|item| match item.status {
                QueueStatus::Pending => true,
                QueueStatus::Retrying => include_retrying,
                QueueStatus::Failed => false,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    /// Removes every operation with op id <= `up_to_op_id`. Returns the
    /// number removed.
    pub async fn acknowledge(&mut self, up_to_op_id: u64) -> Result<usize> {
        self.ensure_open()?;
        let before = self.items.len();
        self.items.retain(|item| item.operation.op_id > up_to_op_id);
        let removed = before - self.items.len();
        if removed > 0 {
            self.rebuild_index();
            self.persist().await?;
            tracing::debug!("Acknowledged {} op(s) up to {}", removed, up_to_op_id);
        }
        Ok(removed)
    }

    /// Removes a single operation regardless of position (used when a
    /// conflict resolution discards the local change).
    pub async fn remove(&mut self, op_id: u64) -> Result<bool> {
        self.ensure_open()?;
        let Some(&idx) = self.index.get(&op_id) else {
            return Ok(false);
        };
        self.items.remove(idx);
        self.rebuild_index();
        self.persist().await?;
        Ok(true)
    }

    /// Replaces a queued operation in place (used when a conflict
    /// resolution rewrites the entity version or payload).
    pub async fn replace(&mut self, operation: SyncOperation) -> Result<bool> {
        self.ensure_open()?;
        let Some(&idx) = self.index.get(&operation.op_id) else {
            return Ok(false);
        };
        let item = &mut self.items[idx];
        item.operation = operation;
        item.status = QueueStatus::Pending;
        item.retry_count = 0;
        item.last_error = None;
        self.persist().await?;
        Ok(true)
    }

    /// Records a failed push attempt. At the retry ceiling the operation
    /// transitions to Failed and is no longer offered by `get_pending`.
    pub async fn mark_failed(&mut self, op_id: u64, error: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let Some(&idx) = self.index.get(&op_id) else {
            return Err(Error::State(format!("op {} is not queued", op_id)));
        };
        let item = &mut self.items[idx];
        item.retry_count += 1;
        item.status = if item.retry_count >= self.max_retries {
            QueueStatus::Failed
        } else {
            QueueStatus::Retrying
        };
        item.last_error = error.map(str::to_string);
        item.last_attempt_at = Some(Utc::now());
        if item.status == QueueStatus::Failed {
            tracing::warn!(
                "Op {} failed permanently after {} attempt(s): {}",
                op_id,
                item.retry_count,
                item.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        self.persist().await?;
        Ok(())
    }

    /// Returns failed operations to pending with a fresh retry budget.
    pub async fn reset_failed(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let mut reset = 0;
        for item in &mut self.items {
            if item.status == QueueStatus::Failed {
                item.status = QueueStatus::Pending;
                item.retry_count = 0;
                item.last_error = None;
                reset += 1;
            }
        }
        if reset > 0 {
            self.persist().await?;
            tracing::info!("Reset {} failed op(s) for retry", reset);
        }
        Ok(reset)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.ensure_open()?;
        let mut stats = QueueStats {
            total: self.items.len(),
            ..QueueStats::default()
        };
        for item in &self.items {
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Retrying => stats.retrying += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Discards every queued operation. Operator recovery only.
    pub async fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        let dropped = self.items.len();
        self.items.clear();
        self.index.clear();
        self.persist().await?;
        tracing::info!("Cleared offline queue ({} op(s) discarded)", dropped);
        Ok(())
    }

    /// Greatest op id ever enqueued and still queued, used to seed the
    /// op id allocator after a restart.
    pub fn max_op_id(&self) -> Option<u64> {
        self.items.iter().map(|item| item.operation.op_id).max()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::State("offline queue is closed".to_string()))
        }
    }

    fn insert(&mut self, operation: SyncOperation) {
        let op_id = operation.op_id;
        self.items.push(QueuedOperation::new(operation));
        self.index.insert(op_id, self.items.len() - 1);
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.operation.op_id, idx))
            .collect();
    }

    /// Atomic rewrite: serialize to a temp file, fsync, rename over the
    /// live file.
    async fn persist(&self) -> Result<()> {
        let file = QueueFile {
            version: QUEUE_FILE_VERSION,
            saved_at: Utc::now(),
            items: self.items.clone(),
        };
        let json = serde_json::to_vec(&file)?;
        let tmp_path = tmp_path_for(&self.path);

        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(&json).await?;
        tmp.sync_all().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "queue.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpType;

    fn op(op_id: u64) -> SyncOperation {
        SyncOperation {
            op_id,
            db_id: "app".into(),
            device_id: "device-a".into(),
            collection: "notes".into(),
            entity_id: format!("n{}", op_id),
            op_type: OpType::Upsert,
            entity_version: op_id,
            entity_cbor: Some(vec![0xA0]),
            timestamp_ms: 0,
        }
    }

    async fn open_queue(dir: &tempfile::TempDir) -> OfflineQueue {
        let mut queue = OfflineQueue::new(dir.path().join("queue.json"), 3);
        queue.open().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn enqueue_deduplicates_by_op_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;

        assert!(queue.enqueue(op(1)).await.unwrap());
        assert!(!queue.enqueue(op(1)).await.unwrap());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn pending_is_fifo_and_respects_filters() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;
        queue.enqueue_all(vec![op(1), op(2), op(3)]).await.unwrap();
        queue.mark_failed(2, Some("timeout")).await.unwrap();

        let pending = queue.get_pending(0, 10, false).unwrap();
        assert_eq!(
            pending.iter().map(|i| i.operation.op_id).collect::<Vec<_>>(),
            vec![1, 3]
        );

        let with_retrying = queue.get_pending(0, 10, true).unwrap();
        assert_eq!(with_retrying.len(), 3);

        let after = queue.get_pending(1, 10, true).unwrap();
        assert_eq!(after[0].operation.op_id, 2);
    }

    #[tokio::test]
    async fn acknowledge_truncates_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;
        queue.enqueue_all(vec![op(1), op(2), op(3)]).await.unwrap();

        let removed = queue.acknowledge(2).await.unwrap();
        assert_eq!(removed, 2);
        let pending = queue.get_pending(0, 10, true).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.op_id, 3);
    }

    #[tokio::test]
    async fn retry_ceiling_transitions_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;
        queue.enqueue(op(1)).await.unwrap();

        queue.mark_failed(1, Some("503")).await.unwrap();
        queue.mark_failed(1, Some("503")).await.unwrap();
        assert_eq!(queue.stats().unwrap().retrying, 1);

        queue.mark_failed(1, Some("503")).await.unwrap();
        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert!(queue.get_pending(0, 10, true).unwrap().is_empty());

        assert_eq!(queue.reset_failed().await.unwrap(), 1);
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let mut queue = OfflineQueue::new(&path, 3);
        queue.open().await.unwrap();
        queue.enqueue_all(vec![op(1), op(2), op(3)]).await.unwrap();
        queue.close().await.unwrap();

        let mut reopened = OfflineQueue::new(&path, 3);
        reopened.open().await.unwrap();
        let pending = reopened.get_pending(0, 10, true).unwrap();
        assert_eq!(
            pending.iter().map(|i| i.operation.op_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        tokio::fs::write(&path, b"not json at all").await.unwrap();

        let mut queue = OfflineQueue::new(&path, 3);
        queue.open().await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn closed_queue_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;
        queue.close().await.unwrap();

        assert!(matches!(queue.enqueue(op(1)).await, Err(Error::State(_))));
        assert!(matches!(queue.get_pending(0, 1, false), Err(Error::State(_))));
        assert!(matches!(queue.acknowledge(1).await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn double_open_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;
        assert!(matches!(queue.open().await, Err(Error::State(_))));
    }

    #[tokio::test]
    async fn replace_rewrites_and_resets_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;
        queue.enqueue(op(1)).await.unwrap();
        queue.mark_failed(1, Some("conflict")).await.unwrap();

        let mut rewritten = op(1);
        rewritten.entity_version = 9;
        assert!(queue.replace(rewritten).await.unwrap());

        let pending = queue.get_pending(0, 10, false).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.entity_version, 9);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn accounting_invariant_holds_over_mixed_workload() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = open_queue(&dir).await;

        let mut enqueued = 0usize;
        let mut acknowledged = 0usize;
        for round in 1u64..=20 {
            if queue.enqueue(op(round)).await.unwrap() {
                enqueued += 1;
            }
            // Duplicate delivery from the change-log reader.
            queue.enqueue(op(round)).await.unwrap();

            if round % 5 == 0 {
                acknowledged += queue.acknowledge(round - 2).await.unwrap();
            }
            if round % 7 == 0 {
                queue.mark_failed(round, Some("flaky")).await.unwrap();
            }
        }

        assert_eq!(queue.len(), enqueued - acknowledged);

        let mut seen = std::collections::HashSet::new();
        for item in queue.get_pending(0, usize::MAX, true).unwrap() {
            assert!(seen.insert(item.operation.op_id));
        }
    }
}
