// server/service.rs - Per-database replication service
//
// Handshake, cursor-based pull, conflict-detecting push. Pushes against one
// database are serialized by a per-database async lock and are durable in
// the oplog file before the response returns; pulls read a snapshot and
// never contend with that lock. Accepted entries are handed to the oplog
// sink (the event broadcaster) after the durable write.

use super::oplog::{DbLog, HeadVersion, OplogFile};
use crate::config::ServerConfig;
use crate::metrics::{incr, incr_by, SyncMetrics};
use crate::protocol::{
    Conflict, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, ServerEntityState, ServerOplogEntry, VersionInfo,
};
use crate::resolver::{ConflictResolver, Resolution, ResolveConflict};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Receives every durably appended oplog entry. Implemented by the event
/// broadcaster; the service holds only this seam so neither side owns the
/// other.
pub trait OplogSink: Send + Sync {
    fn operation_appended(&self, entry: &ServerOplogEntry);
}

/// Sink for deployments without live subscribers.
pub struct NullSink;

impl OplogSink for NullSink {
    fn operation_appended(&self, _entry: &ServerOplogEntry) {}
}

struct DbState {
    /// Serializes pushes, including their durable append.
    push_lock: tokio::sync::Mutex<()>,
    log: parking_lot::RwLock<DbLog>,
    file: tokio::sync::Mutex<OplogFile>,
}

/// Point-in-time stats for one database, exposed on /v1/stats.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub cursor: u64,
    pub oplog_size: usize,
}

/// The coordinator's replication core.
pub struct ReplicationService {
    data_dir: PathBuf,
    max_pull_limit: u32,
    max_push_batch_size: u32,
    /// When set, handshakes for databases outside the list are rejected.
    allowed_dbs: parking_lot::RwLock<Option<HashSet<String>>>,
    resolver: ConflictResolver,
    metrics: Arc<SyncMetrics>,
    sink: Arc<dyn OplogSink>,
    version: VersionInfo,
    dbs: parking_lot::RwLock<HashMap<String, Arc<DbState>>>,
}

impl ReplicationService {
    /// Opens the service, replaying every `*.oplog` file under the data
    /// directory.
    pub async fn open(
        config: &ServerConfig,
        resolver: ConflictResolver,
        metrics: Arc<SyncMetrics>,
        sink: Arc<dyn OplogSink>,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.db_path).await?;

        let service = Arc::new(Self {
            data_dir: config.db_path.clone(),
            max_pull_limit: config.max_pull_limit,
            max_push_batch_size: config.max_push_batch_size,
            allowed_dbs: parking_lot::RwLock::new(None),
            resolver,
            metrics,
            sink,
            version: VersionInfo::advertised(),
            dbs: parking_lot::RwLock::new(HashMap::new()),
        });

        let mut dir = tokio::fs::read_dir(&service.data_dir).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("oplog") {
                continue;
            }
            let Some(db_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let state = Self::load_db(&path).await?;
            tracing::info!(
                "Replayed oplog for '{}' ({} entr(ies))",
                db_id,
                state.log.read().len()
            );
            service.dbs.write().insert(db_id, state);
        }

        Ok(service)
    }

    /// Restricts handshakes to an explicit database allow-list. Databases
    /// already replayed from disk stay reachable.
    pub fn set_allowed_dbs(&self, allowed: HashSet<String>) {
        *self.allowed_dbs.write() = Some(allowed);
    }

    pub fn version(&self) -> VersionInfo {
        self.version
    }

    async fn load_db(path: &std::path::Path) -> Result<Arc<DbState>> {
        let (file, entries) = OplogFile::open(path).await?;
        let log = DbLog::from_entries(entries)?;
        Ok(Arc::new(DbState {
            push_lock: tokio::sync::Mutex::new(()),
            log: parking_lot::RwLock::new(log),
            file: tokio::sync::Mutex::new(file),
        }))
    }

    /// Fetches or creates the state for a database.
    async fn db(&self, db_id: &str) -> Result<Arc<DbState>> {
        if let Some(state) = self.dbs.read().get(db_id) {
            return Ok(state.clone());
        }
        if let Some(allowed) = self.allowed_dbs.read().as_ref() {
            if !allowed.contains(db_id) {
                return Err(Error::UnknownDatabase(db_id.to_string()));
            }
        }

        let path = self.data_dir.join(format!("{}.oplog", sanitize(db_id)));
        let state = Self::load_db(&path).await?;
        let mut dbs = self.dbs.write();
        // Another request may have raced the creation.
        Ok(dbs.entry(db_id.to_string()).or_insert(state).clone())
    }

    /// Validates the client version and mints a session.
    ///
    /// An incompatible protocol version fails with `Error::VersionMismatch`
    /// (the HTTP layer turns that into the typed ErrorResponse); an unknown
    /// database is reported in-band with `accepted: false`.
    pub async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        if !self.version.is_compatible(request.client_protocol_version) {
            return Err(Error::VersionMismatch(format!(
                "client speaks v{}, server supports v{}..=v{}",
                request.client_protocol_version, self.version.min_supported, self.version.current
            )));
        }

        let state = match self.db(&request.db_id).await {
            Ok(state) => state,
            Err(Error::UnknownDatabase(db_id)) => {
                return Ok(HandshakeResponse {
                    server_protocol_version: self.version.current,
                    server_cursor: 0,
                    session_id: String::new(),
                    accepted: false,
                    reject_reason: Some(format!("unknown database '{}'", db_id)),
                })
            }
            Err(e) => return Err(e),
        };

        let server_cursor = state.log.read().cursor();
        let session_id = Uuid::new_v4().to_string();
        tracing::debug!(
            "Handshake from device '{}' on '{}' (cursor {}, session {})",
            request.device_id,
            request.db_id,
            server_cursor,
            session_id
        );
        Ok(HandshakeResponse {
            server_protocol_version: self.version.current,
            server_cursor,
            session_id,
            accepted: true,
            reject_reason: None,
        })
    }

    /// Cursor-based read of the oplog. Takes a snapshot under a short read
    /// lock; never waits on pushes.
    pub async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        if request.limit == 0 {
            return Err(Error::InvalidRequest("pull limit must be positive".into()));
        }
        let limit = request.limit.min(self.max_pull_limit) as usize;
        let state = self.db(&request.db_id).await?;

        let (ops, next_cursor, has_more) = state.log.read().entries_since(
            request.since_cursor,
            limit,
            request.collections.as_deref(),
            request.exclude_device_id.as_deref(),
        );

        Ok(PullResponse {
            ops,
            next_cursor,
            has_more,
        })
    }

    /// Conflict-detecting, idempotent push of one batch.
    pub async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        if request.ops.len() > self.max_push_batch_size as usize {
            return Err(Error::InvalidRequest(format!(
                "push batch of {} exceeds limit {}",
                request.ops.len(),
                self.max_push_batch_size
            )));
        }
        for op in &request.ops {
            if op.db_id != request.db_id || op.device_id != request.device_id {
                return Err(Error::InvalidRequest(
                    "operation origin does not match push envelope".into(),
                ));
            }
        }

        let state = self.db(&request.db_id).await?;
        let _push_guard = state.push_lock.lock().await;

        // Ascending op id order regardless of arrival order.
        let mut ops = request.ops.clone();
        ops.sort_by_key(|op| op.op_id);

        let mut staged: Vec<ServerOplogEntry> = Vec::new();
        let mut conflicts: Vec<Conflict> = Vec::new();
        let mut accepted_up_to = 0u64;
        let mut deduped = 0u64;

        {
            let log = state.log.read();
            let mut next_cursor = log.cursor();
            // Later ops in the batch must see heads staged by earlier ones.
            let mut staged_heads: HashMap<(String, String), HeadVersion> = HashMap::new();
            let mut staged_dedup: HashSet<(String, u64)> = HashSet::new();

            for op in ops {
                let dedup_hit = log.dedup(&op.device_id, op.op_id).is_some()
                    || staged_dedup.contains(&(op.device_id.clone(), op.op_id));
                if dedup_hit {
                    // Idempotent retry of an already-accepted operation.
                    accepted_up_to = accepted_up_to.max(op.op_id);
                    deduped += 1;
                    continue;
                }

                let head_key = (op.collection.clone(), op.entity_id.clone());
                let conflict_head = staged_heads
                    .get(&head_key)
                    .cloned()
                    .or_else(|| log.head(&op.collection, &op.entity_id).cloned())
                    .filter(|h| {
                        h.entity_version >= op.entity_version
                            && !(h.device_id == op.device_id && h.op_id == op.op_id)
                    });

                let mut accepted_op = op;
                if let Some(head) = conflict_head {
                    let conflict = Conflict {
                        collection: accepted_op.collection.clone(),
                        entity_id: accepted_op.entity_id.clone(),
                        client_op: accepted_op.clone(),
                        server_state: self.head_state(&log, &staged, &head),
                    };
                    incr(&self.metrics.conflicts_detected);

                    match self.resolver.resolve(&conflict) {
                        Resolution::TakeServer => {
                            conflicts.push(conflict);
                            continue;
                        }
                        Resolution::TakeClient => {
                            accepted_op.entity_version = head.entity_version + 1;
                        }
                        Resolution::Merged(bytes) => {
                            accepted_op.entity_version = head.entity_version + 1;
                            accepted_op.entity_cbor = Some(bytes);
                        }
                    }
                }

                next_cursor += 1;
                accepted_up_to = accepted_up_to.max(accepted_op.op_id);
                staged_heads.insert(
                    head_key,
                    HeadVersion {
                        entity_version: accepted_op.entity_version,
                        cursor: next_cursor,
                        device_id: accepted_op.device_id.clone(),
                        op_id: accepted_op.op_id,
                        timestamp_ms: accepted_op.timestamp_ms,
                    },
                );
                staged_dedup.insert((accepted_op.device_id.clone(), accepted_op.op_id));
                staged.push(ServerOplogEntry {
                    server_cursor: next_cursor,
                    operation: accepted_op,
                });
            }
        }

        // Durable before acknowledged.
        if !staged.is_empty() {
            let mut file = state.file.lock().await;
            file.append(&staged).await?;
        }

        let new_server_cursor = {
            let mut log = state.log.write();
            for entry in &staged {
                log.apply(entry.clone());
            }
            log.cursor()
        };

        incr_by(&self.metrics.ops_pushed, staged.len() as u64);
        if deduped > 0 {
            incr_by(&self.metrics.pushes_deduplicated, deduped);
        }

        // Fan-out happens after the append and outside the log lock; the
        // sink must never block this path.
        for entry in &staged {
            self.sink.operation_appended(entry);
        }

        if !staged.is_empty() || !conflicts.is_empty() {
            tracing::debug!(
                "Push from '{}' on '{}': {} accepted, {} dedup, {} conflict(s), cursor {}",
                request.device_id,
                request.db_id,
                staged.len(),
                deduped,
                conflicts.len(),
                new_server_cursor
            );
        }

        Ok(PushResponse {
            accepted_up_to_op_id: accepted_up_to,
            conflicts,
            new_server_cursor,
        })
    }

    /// Builds the server-state half of a conflict from the head entry,
    /// checking staged entries first since the head may not be committed
    /// yet within this batch.
    fn head_state(
        &self,
        log: &DbLog,
        staged: &[ServerOplogEntry],
        head: &HeadVersion,
    ) -> ServerEntityState {
        let entity_cbor = staged
            .iter()
            .find(|e| e.server_cursor == head.cursor)
            .or_else(|| log.entry_at(head.cursor))
            .and_then(|e| e.operation.entity_cbor.clone());
        ServerEntityState {
            entity_version: head.entity_version,
            entity_cbor,
            last_modified_ms: Some(head.timestamp_ms),
        }
    }

    /// Current cursor for a database, 0 if it does not exist yet.
    pub fn cursor(&self, db_id: &str) -> u64 {
        self.dbs
            .read()
            .get(db_id)
            .map(|state| state.log.read().cursor())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> HashMap<String, DbStats> {
        self.dbs
            .read()
            .iter()
            .map(|(db_id, state)| {
                let log = state.log.read();
                (
                    db_id.clone(),
                    DbStats {
                        cursor: log.cursor(),
                        oplog_size: log.len(),
                    },
                )
            })
            .collect()
    }
}

/// Keeps db ids usable as file names.
fn sanitize(db_id: &str) -> String {
    db_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
