// changelog/mod.rs - Translating the storage engine's WAL into sync operations
//
// The embedded storage engine is an external collaborator; this module only
// consumes its change-log interface. A poll reads forward from the last
// committed log sequence number in two passes: analyze (group records by
// transaction, find commit markers) and emit (one SyncOperation per data
// record of each committed transaction).

pub mod poller;

use crate::protocol::{OpType, SyncOperation};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub use poller::ChangeLogPoller;

/// Payload of one write-ahead-log record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalPayload {
    /// Transaction start marker.
    Begin,
    /// One data change inside a transaction.
    Data {
        collection: String,
        entity_id: String,
        /// Full post-image; None for deletes.
        after_image: Option<Vec<u8>>,
    },
    /// Transaction commit marker. Transactions without one are skipped.
    Commit,
}

/// A low-level record as exposed by the storage engine's log.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Log sequence number, strictly increasing.
    pub lsn: u64,
    pub txn_id: u64,
    pub payload: WalPayload,
}

/// The change-log interface consumed from the storage engine.
///
/// No file notification is available; callers poll at a fixed cadence.
pub trait ChangeLog: Send + Sync {
    /// Returns records with `lsn > from_lsn` in log order, up to `max`.
    fn read_from(&self, from_lsn: u64, max: usize) -> Result<Vec<WalRecord>>;
}

/// Collections whose name starts with this prefix are engine-internal and
/// never replicated.
const INTERNAL_COLLECTION_PREFIX: char = '_';

/// Records read per poll before the reader yields back to the runtime.
const READ_BATCH: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct LsnFile {
    version: u32,
    last_seen_lsn: u64,
}

/// Tails a change log and produces logical sync operations.
///
/// Delivery into the offline queue is at-least-once; the queue dedups by
/// op id. Op ids are allocated here, monotonic and gap-free per device.
pub struct ChangeLogReader<L: ChangeLog> {
    log: Arc<L>,
    db_id: String,
    device_id: String,
    lsn_path: PathBuf,
    last_seen_lsn: u64,
    next_op_id: u64,
    last_entity_version: u64,
}

impl<L: ChangeLog> ChangeLogReader<L> {
    /// Opens the reader, restoring `last_seen_lsn` from its state file.
    ///
    /// `next_op_id` seeds the op id allocator; pass one past the greatest
    /// op id known to the offline queue so ids stay gap-free across
    /// restarts.
    pub async fn open(
        log: Arc<L>,
        db_id: impl Into<String>,
        device_id: impl Into<String>,
        lsn_path: impl Into<PathBuf>,
        next_op_id: u64,
    ) -> Result<Self> {
        let lsn_path = lsn_path.into();
        if let Some(parent) = lsn_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let last_seen_lsn = match tokio::fs::read(&lsn_path).await {
            Ok(bytes) => match serde_json::from_slice::<LsnFile>(&bytes) {
                Ok(file) => file.last_seen_lsn,
                Err(e) => {
                    tracing::warn!(
                        "Change-log state file {} is unreadable, rereading from 0: {}",
                        lsn_path.display(),
                        e
                    );
                    0
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            log,
            db_id: db_id.into(),
            device_id: device_id.into(),
            lsn_path,
            last_seen_lsn,
            next_op_id: next_op_id.max(1),
            last_entity_version: 0,
        })
    }

    pub fn last_seen_lsn(&self) -> u64 {
        self.last_seen_lsn
    }

    /// Runs one poll: analyze then emit. Returns the operations produced.
    pub async fn poll_once(&mut self) -> Result<Vec<SyncOperation>> {
        let records = self.read_available()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // Analyze pass: which transactions have a commit marker, and where
        // does the committed prefix end. Records past the first record of a
        // still-open transaction stay in the log for the next poll so a
        // late commit is never lost and nothing is emitted twice.
        let mut committed: HashSet<u64> = HashSet::new();
        for record in &records {
            if matches!(record.payload, WalPayload::Commit) {
                committed.insert(record.txn_id);
            }
        }
        let open_txn_start = records
            .iter()
            .filter(|r| !committed.contains(&r.txn_id))
            .map(|r| r.lsn)
            .min();
        let emit_limit = match open_txn_start {
            Some(lsn) => lsn.saturating_sub(1),
            None => records.last().map(|r| r.lsn).unwrap_or(self.last_seen_lsn),
        };
        if emit_limit <= self.last_seen_lsn {
            return Ok(Vec::new());
        }

        // Emit pass: committed data records in log order.
        let mut ops = Vec::new();
        for record in &records {
            if record.lsn > emit_limit || !committed.contains(&record.txn_id) {
                continue;
            }
            let WalPayload::Data {
                collection,
                entity_id,
                after_image,
            } = &record.payload
            else {
                continue;
            };
            if collection.starts_with(INTERNAL_COLLECTION_PREFIX) {
                continue;
            }

            let op_type = if after_image.is_none() {
                OpType::Delete
            } else {
                OpType::Upsert
            };
            ops.push(SyncOperation {
                op_id: self.next_op_id(),
                db_id: self.db_id.clone(),
                device_id: self.device_id.clone(),
                collection: collection.clone(),
                entity_id: entity_id.clone(),
                op_type,
                entity_version: self.next_entity_version(),
                entity_cbor: after_image.clone(),
                timestamp_ms: Utc::now().timestamp_millis(),
            });
        }

        self.last_seen_lsn = emit_limit;
        self.persist_lsn().await?;

        if !ops.is_empty() {
            tracing::debug!(
                "Change log emitted {} op(s), lsn now {}",
                ops.len(),
                self.last_seen_lsn
            );
        }
        Ok(ops)
    }

    /// Reads everything currently available past the last seen lsn.
    fn read_available(&self) -> Result<Vec<WalRecord>> {
        let mut records = Vec::new();
        let mut from = self.last_seen_lsn;
        loop {
            let batch = self.log.read_from(from, READ_BATCH)?;
            let len = batch.len();
            if let Some(last) = batch.last() {
                from = last.lsn;
            }
            records.extend(batch);
            if len < READ_BATCH {
                break;
            }
        }
        Ok(records)
    }

    fn next_op_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    /// Strictly monotonic version counter derived from the wall clock.
    fn next_entity_version(&mut self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_entity_version = now.max(self.last_entity_version + 1);
        self.last_entity_version
    }

    async fn persist_lsn(&self) -> Result<()> {
        let file = LsnFile {
            version: 1,
            last_seen_lsn: self.last_seen_lsn,
        };
        let json = serde_json::to_vec(&file)?;
        let tmp = self.lsn_path.with_extension("tmp");
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&json).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, &self.lsn_path).await?;
        Ok(())
    }
}

/// In-memory change log for tests and demos.
#[derive(Default)]
pub struct MemoryChangeLog {
    inner: parking_lot::Mutex<MemoryLogInner>,
}

#[derive(Default)]
struct MemoryLogInner {
    records: Vec<WalRecord>,
    next_lsn: u64,
    next_txn: u64,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a whole transaction: begin, data records, commit.
    pub fn commit_txn(&self, changes: Vec<(&str, &str, Option<Vec<u8>>)>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_txn += 1;
        let txn_id = inner.next_txn;
        Self::push(&mut inner, txn_id, WalPayload::Begin);
        for (collection, entity_id, after_image) in changes {
            Self::push(
                &mut inner,
                txn_id,
                WalPayload::Data {
                    collection: collection.to_string(),
                    entity_id: entity_id.to_string(),
                    after_image,
                },
            );
        }
        Self::push(&mut inner, txn_id, WalPayload::Commit);
        txn_id
    }

    /// Appends a transaction without its commit marker (crash in flight).
    pub fn begin_txn(&self, changes: Vec<(&str, &str, Option<Vec<u8>>)>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_txn += 1;
        let txn_id = inner.next_txn;
        Self::push(&mut inner, txn_id, WalPayload::Begin);
        for (collection, entity_id, after_image) in changes {
            Self::push(
                &mut inner,
                txn_id,
                WalPayload::Data {
                    collection: collection.to_string(),
                    entity_id: entity_id.to_string(),
                    after_image,
                },
            );
        }
        txn_id
    }

    /// Appends the commit marker for an earlier `begin_txn`.
    pub fn commit(&self, txn_id: u64) {
        let mut inner = self.inner.lock();
        Self::push(&mut inner, txn_id, WalPayload::Commit);
    }

    fn push(inner: &mut MemoryLogInner, txn_id: u64, payload: WalPayload) {
        inner.next_lsn += 1;
        let lsn = inner.next_lsn;
        inner.records.push(WalRecord { lsn, txn_id, payload });
    }
}

impl ChangeLog for MemoryChangeLog {
    fn read_from(&self, from_lsn: u64, max: usize) -> Result<Vec<WalRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|r| r.lsn > from_lsn)
            .take(max)
            .cloned()
            .collect())
    }
}

// Blanket impl so Arc<MemoryChangeLog> etc. satisfy reader bounds directly.
impl<L: ChangeLog + ?Sized> ChangeLog for Arc<L> {
    fn read_from(&self, from_lsn: u64, max: usize) -> Result<Vec<WalRecord>> {
        (**self).read_from(from_lsn, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reader(
        log: Arc<MemoryChangeLog>,
        dir: &tempfile::TempDir,
    ) -> ChangeLogReader<MemoryChangeLog> {
        ChangeLogReader::open(log, "app", "device-a", dir.path().join("lsn.json"), 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn committed_txn_is_emitted_in_order() {
        let log = Arc::new(MemoryChangeLog::new());
        log.commit_txn(vec![
            ("notes", "n1", Some(vec![0xA0])),
            ("notes", "n2", None),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(log, &dir).await;
        let ops = reader.poll_once().await.unwrap();

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].entity_id, "n1");
        assert_eq!(ops[0].op_type, OpType::Upsert);
        assert_eq!(ops[0].entity_cbor, Some(vec![0xA0]));
        assert_eq!(ops[1].entity_id, "n2");
        assert_eq!(ops[1].op_type, OpType::Delete);
        assert_eq!(ops[1].entity_cbor, None);
        assert_eq!(ops[0].op_id + 1, ops[1].op_id);
        assert!(ops[0].entity_version < ops[1].entity_version);
    }

    #[tokio::test]
    async fn uncommitted_txn_is_held_back_until_commit() {
        let log = Arc::new(MemoryChangeLog::new());
        let txn = log.begin_txn(vec![("notes", "n1", Some(vec![0x01]))]);

        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(log.clone(), &dir).await;
        assert!(reader.poll_once().await.unwrap().is_empty());

        log.commit(txn);
        let ops = reader.poll_once().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].entity_id, "n1");

        // Nothing is emitted twice.
        assert!(reader.poll_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_collections_are_skipped() {
        let log = Arc::new(MemoryChangeLog::new());
        log.commit_txn(vec![
            ("_meta", "m1", Some(vec![0x01])),
            ("notes", "n1", Some(vec![0x02])),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(log, &dir).await;
        let ops = reader.poll_once().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].collection, "notes");
    }

    #[tokio::test]
    async fn lsn_survives_restart() {
        let log = Arc::new(MemoryChangeLog::new());
        log.commit_txn(vec![("notes", "n1", Some(vec![0x01]))]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lsn.json");
        let mut first =
            ChangeLogReader::open(log.clone(), "app", "device-a", &path, 1)
                .await
                .unwrap();
        let ops = first.poll_once().await.unwrap();
        assert_eq!(ops.len(), 1);
        let lsn = first.last_seen_lsn();

        let mut second = ChangeLogReader::open(log, "app", "device-a", &path, 2)
            .await
            .unwrap();
        assert_eq!(second.last_seen_lsn(), lsn);
        assert!(second.poll_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interleaved_open_txn_blocks_later_records() {
        let log = Arc::new(MemoryChangeLog::new());
        let open = log.begin_txn(vec![("notes", "held", Some(vec![0x01]))]);
        log.commit_txn(vec![("notes", "later", Some(vec![0x02]))]);

        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(log.clone(), &dir).await;
        // The open transaction's records come first in the log, so nothing
        // past them may be consumed yet.
        assert!(reader.poll_once().await.unwrap().is_empty());

        log.commit(open);
        let ops = reader.poll_once().await.unwrap();
        let ids: Vec<_> = ops.iter().map(|o| o.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["held", "later"]);
    }
}
