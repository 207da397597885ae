// server/oplog.rs - Per-database oplog state and durable append file
//
// The in-memory log carries three indexes: entries by dense cursor, head
// version per entity, and a per-(device, op) dedup map for idempotent push
// retries. Durability is an append-only file of length-prefixed CBOR
// frames, replayed at startup.

use crate::codec::{decode_from_slice, encode_to_vec};
use crate::protocol::ServerOplogEntry;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Server-side head state of one entity.
#[derive(Debug, Clone)]
pub struct HeadVersion {
    pub entity_version: u64,
    /// Cursor of the oplog entry that produced this head.
    pub cursor: u64,
    pub device_id: String,
    pub op_id: u64,
    pub timestamp_ms: i64,
}

/// In-memory oplog for one logical database.
///
/// Entries are dense from cursor 1; `entries[cursor - 1]` is the entry at
/// `cursor`.
#[derive(Default)]
pub struct DbLog {
    entries: Vec<ServerOplogEntry>,
    heads: HashMap<(String, String), HeadVersion>,
    dedup: HashMap<(String, u64), u64>,
}

impl DbLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the log and its indexes from replayed entries.
    pub fn from_entries(entries: Vec<ServerOplogEntry>) -> Result<Self> {
        let mut log = Self::new();
        for entry in entries {
            if entry.server_cursor != log.cursor() + 1 {
                return Err(Error::Storage(format!(
                    "oplog gap: expected cursor {}, found {}",
                    log.cursor() + 1,
                    entry.server_cursor
                )));
            }
            log.apply(entry);
        }
        Ok(log)
    }

    /// Current cursor: the greatest assigned value, 0 when empty.
    pub fn cursor(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self, collection: &str, entity_id: &str) -> Option<&HeadVersion> {
        self.heads
            .get(&(collection.to_string(), entity_id.to_string()))
    }

    /// Cursor under which this (device, op) was already accepted, if any.
    pub fn dedup(&self, device_id: &str, op_id: u64) -> Option<u64> {
        self.dedup.get(&(device_id.to_string(), op_id)).copied()
    }

    pub fn entry_at(&self, cursor: u64) -> Option<&ServerOplogEntry> {
        if cursor == 0 {
            return None;
        }
        self.entries.get(cursor as usize - 1)
    }

    /// Appends an entry whose cursor must be the next dense value, and
    /// updates the indexes.
    pub fn apply(&mut self, entry: ServerOplogEntry) {
        debug_assert_eq!(entry.server_cursor, self.cursor() + 1);
        let op = &entry.operation;
        self.heads.insert(
            (op.collection.clone(), op.entity_id.clone()),
            HeadVersion {
                entity_version: op.entity_version,
                cursor: entry.server_cursor,
                device_id: op.device_id.clone(),
                op_id: op.op_id,
                timestamp_ms: op.timestamp_ms,
            },
        );
        self.dedup
            .insert((op.device_id.clone(), op.op_id), entry.server_cursor);
        self.entries.push(entry);
    }

    /// Pull read: up to `limit` entries after `since`, optionally filtered
    /// by collection set and excluding one device. Returns the page, the
    /// greatest cursor returned (or `since`), and whether more matching
    /// entries remain.
    pub fn entries_since(
        &self,
        since: u64,
        limit: usize,
        collections: Option<&[String]>,
        exclude_device_id: Option<&str>,
    ) -> (Vec<ServerOplogEntry>, u64, bool) {
        let matches = |entry: &ServerOplogEntry| {
            if let Some(device) = exclude_device_id {
                if entry.operation.device_id == device {
                    return false;
                }
            }
            if let Some(cols) = collections {
                if !cols.iter().any(|c| *c == entry.operation.collection) {
                    return false;
                }
            }
            true
        };

        let start = (since as usize).min(self.entries.len());
        let mut page = Vec::new();
        let mut has_more = false;
        for entry in &self.entries[start..] {
            if !matches(entry) {
                continue;
            }
            if page.len() == limit {
                has_more = true;
                break;
            }
            page.push(entry.clone());
        }

        let next_cursor = page.last().map(|e| e.server_cursor).unwrap_or(since);
        (page, next_cursor, has_more)
    }
}

/// Append-only durable backing for one database's oplog.
///
/// Frame layout: 4-byte little-endian length, then the CBOR-encoded entry.
/// A truncated trailing frame (crash mid-write) is dropped on load.
pub struct OplogFile {
    path: PathBuf,
    file: tokio::fs::File,
}

impl OplogFile {
    /// Opens (creating if needed) the file and replays its entries.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<ServerOplogEntry>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (entries, valid_len, total_len) = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let total = bytes.len() as u64;
                let (entries, valid) = Self::parse(&bytes, &path)?;
                (entries, valid, total)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0, 0),
            Err(e) => return Err(e.into()),
        };

        // A crash mid-append leaves a partial frame; cut it off before new
        // appends land behind it.
        if valid_len < total_len {
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(valid_len).await?;
            file.sync_all().await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok((Self { path, file }, entries))
    }

    fn parse(bytes: &[u8], path: &Path) -> Result<(Vec<ServerOplogEntry>, u64)> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= bytes.len() {
            let len = u32::from_le_bytes(
                bytes[offset..offset + 4]
                    .try_into()
                    .map_err(|_| Error::Storage("oplog frame header read failed".into()))?,
            ) as usize;
            if offset + 4 + len > bytes.len() {
                tracing::warn!(
                    "Dropping truncated trailing frame in {} ({} byte(s) short)",
                    path.display(),
                    offset + 4 + len - bytes.len()
                );
                return Ok((entries, offset as u64));
            }
            let entry: ServerOplogEntry =
                decode_from_slice(&bytes[offset + 4..offset + 4 + len]).map_err(|e| {
                    Error::Storage(format!("corrupt oplog frame in {}: {}", path.display(), e))
                })?;
            entries.push(entry);
            offset += 4 + len;
        }
        if offset < bytes.len() {
            tracing::warn!("Dropping truncated frame header in {}", path.display());
        }
        Ok((entries, offset as u64))
    }

    /// Appends entries and fsyncs. Callers must not expose the entries to
    /// readers until this returns.
    pub async fn append(&mut self, entries: &[ServerOplogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            let frame = encode_to_vec(entry)?;
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(&frame);
        }
        self.file.write_all(&buf).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpType, SyncOperation};

    fn entry(cursor: u64, device: &str, op_id: u64, entity: &str, version: u64) -> ServerOplogEntry {
        ServerOplogEntry {
            server_cursor: cursor,
            operation: SyncOperation {
                op_id,
                db_id: "app".into(),
                device_id: device.into(),
                collection: "notes".into(),
                entity_id: entity.into(),
                op_type: OpType::Upsert,
                entity_version: version,
                entity_cbor: Some(vec![0xA0]),
                timestamp_ms: 1,
            },
        }
    }

    #[test]
    fn apply_maintains_indexes() {
        let mut log = DbLog::new();
        log.apply(entry(1, "a", 1, "n1", 1));
        log.apply(entry(2, "b", 1, "n1", 2));

        assert_eq!(log.cursor(), 2);
        let head = log.head("notes", "n1").unwrap();
        assert_eq!(head.entity_version, 2);
        assert_eq!(head.device_id, "b");
        assert_eq!(log.dedup("a", 1), Some(1));
        assert_eq!(log.dedup("b", 1), Some(2));
        assert_eq!(log.dedup("c", 1), None);
    }

    #[test]
    fn entries_since_filters_and_pages() {
        let mut log = DbLog::new();
        log.apply(entry(1, "a", 1, "n1", 1));
        log.apply(entry(2, "b", 1, "n2", 1));
        log.apply(entry(3, "a", 2, "n3", 1));

        let (page, next, has_more) = log.entries_since(0, 2, None, None);
        assert_eq!(page.len(), 2);
        assert_eq!(next, 2);
        assert!(has_more);

        let (page, next, has_more) = log.entries_since(2, 10, None, None);
        assert_eq!(page.len(), 1);
        assert_eq!(next, 3);
        assert!(!has_more);

        // Excluding a device: filtered results do not set has_more.
        let (page, next, has_more) = log.entries_since(0, 10, None, Some("a"));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].operation.device_id, "b");
        assert_eq!(next, 2);
        assert!(!has_more);

        // Empty page keeps the caller's cursor.
        let (page, next, has_more) = log.entries_since(3, 10, None, None);
        assert!(page.is_empty());
        assert_eq!(next, 3);
        assert!(!has_more);
    }

    #[test]
    fn from_entries_rejects_gaps() {
        let result = DbLog::from_entries(vec![entry(2, "a", 1, "n1", 1)]);
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn file_replays_appended_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.oplog");

        let (mut file, loaded) = OplogFile::open(&path).await.unwrap();
        assert!(loaded.is_empty());
        file.append(&[entry(1, "a", 1, "n1", 1), entry(2, "a", 2, "n2", 1)])
            .await
            .unwrap();
        drop(file);

        let (_file, loaded) = OplogFile::open(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].server_cursor, 2);
    }

    #[tokio::test]
    async fn truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.oplog");

        let (mut file, _) = OplogFile::open(&path).await.unwrap();
        file.append(&[entry(1, "a", 1, "n1", 1)]).await.unwrap();
        drop(file);

        // Simulate a crash mid-frame.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&[0x01, 0x02]);
        std::fs::write(&path, &bytes).unwrap();

        let (mut file, loaded) = OplogFile::open(&path).await.unwrap();
        assert_eq!(loaded.len(), 1);

        // Appends after recovery land on a clean boundary.
        file.append(&[entry(2, "a", 2, "n2", 1)]).await.unwrap();
        drop(file);
        let (_file, loaded) = OplogFile::open(&path).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
