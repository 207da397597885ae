// protocol/operation.rs - Core replication data model

use crate::codec::{MapDecoder, MapEncoder, WireMessage};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

/// Kind of change carried by a sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Upsert,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Upsert => "upsert",
            OpType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "upsert" => Ok(OpType::Upsert),
            "delete" => Ok(OpType::Delete),
            other => Err(Error::Format(format!("unknown opType '{}'", other))),
        }
    }
}

/// The atomic replication unit: one logical change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Monotonic and gap-free per (db_id, device_id).
    pub op_id: u64,
    pub db_id: String,
    pub device_id: String,
    pub collection: String,
    pub entity_id: String,
    pub op_type: OpType,
    /// Monotonic per (collection, entity_id); drives conflict detection.
    pub entity_version: u64,
    /// Full encoded post-image; absent for deletes.
    pub entity_cbor: Option<Vec<u8>>,
    /// Origin wall-clock, informational and tie-breaking only.
    pub timestamp_ms: i64,
}

impl SyncOperation {
    pub fn is_delete(&self) -> bool {
        self.op_type == OpType::Delete
    }
}

impl WireMessage for SyncOperation {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .u64("opId", self.op_id)
            .str("dbId", &self.db_id)
            .str("deviceId", &self.device_id)
            .str("collection", &self.collection)
            .str("entityId", &self.entity_id)
            .str("opType", self.op_type.as_str())
            .u64("entityVersion", self.entity_version)
            .opt_bytes("entityCbor", self.entity_cbor.as_deref())
            .i64("timestampMs", self.timestamp_ms)
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "SyncOperation")?;
        Ok(Self {
            op_id: map.u64("opId")?,
            db_id: map.string("dbId")?,
            device_id: map.string("deviceId")?,
            collection: map.string("collection")?,
            entity_id: map.string("entityId")?,
            op_type: OpType::parse(map.str("opType")?)?,
            entity_version: map.u64("entityVersion")?,
            entity_cbor: map.opt_bytes("entityCbor")?,
            timestamp_ms: map.i64("timestampMs")?,
        })
    }
}

/// A sync operation as accepted into a server oplog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOplogEntry {
    /// Strictly increasing per db, dense from 1.
    pub server_cursor: u64,
    pub operation: SyncOperation,
}

impl WireMessage for ServerOplogEntry {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .u64("serverCursor", self.server_cursor)
            .value("operation", self.operation.to_wire())
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "ServerOplogEntry")?;
        Ok(Self {
            server_cursor: map.u64("serverCursor")?,
            operation: SyncOperation::from_wire(map.value("operation")?)?,
        })
    }
}

/// Client-side position in a server oplog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub db_id: String,
    pub last_seen: u64,
}

impl Cursor {
    /// Position before the first oplog entry.
    pub fn initial(db_id: impl Into<String>) -> Self {
        Self {
            db_id: db_id.into(),
            last_seen: 0,
        }
    }

    pub fn advance_to(&mut self, cursor: u64) {
        if cursor > self.last_seen {
            self.last_seen = cursor;
        }
    }
}

/// The server's view of an entity at conflict time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntityState {
    pub entity_version: u64,
    pub entity_cbor: Option<Vec<u8>>,
    /// Wall-clock of the last accepted write, when known.
    pub last_modified_ms: Option<i64>,
}

impl WireMessage for ServerEntityState {
    fn to_wire(&self) -> Value {
        let mut enc = MapEncoder::new();
        enc.u64("entityVersion", self.entity_version)
            .opt_bytes("entityCbor", self.entity_cbor.as_deref());
        if let Some(ms) = self.last_modified_ms {
            enc.i64("lastModified", ms);
        }
        enc.finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "ServerEntityState")?;
        Ok(Self {
            entity_version: map.u64("entityVersion")?,
            entity_cbor: map.opt_bytes("entityCbor")?,
            last_modified_ms: map.opt_i64("lastModified")?,
        })
    }
}

/// A push whose entity version did not advance the server head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub collection: String,
    pub entity_id: String,
    pub client_op: SyncOperation,
    pub server_state: ServerEntityState,
}

impl WireMessage for Conflict {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .str("collection", &self.collection)
            .str("entityId", &self.entity_id)
            .value("clientOp", self.client_op.to_wire())
            .value("serverState", self.server_state.to_wire())
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "Conflict")?;
        Ok(Self {
            collection: map.string("collection")?,
            entity_id: map.string("entityId")?,
            client_op: SyncOperation::from_wire(map.value("clientOp")?)?,
            server_state: ServerEntityState::from_wire(map.value("serverState")?)?,
        })
    }
}

/// Processing status of an operation in the offline queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Retrying,
    Failed,
}

/// A locally produced operation waiting for server acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation: SyncOperation,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedOperation {
    pub fn new(operation: SyncOperation) -> Self {
        Self {
            operation,
            enqueued_at: Utc::now(),
            retry_count: 0,
            status: QueueStatus::Pending,
            last_error: None,
            last_attempt_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from_slice, encode_to_vec};

    fn sample_op(op_id: u64) -> SyncOperation {
        SyncOperation {
            op_id,
            db_id: "app".to_string(),
            device_id: "device-a".to_string(),
            collection: "notes".to_string(),
            entity_id: "n1".to_string(),
            op_type: OpType::Upsert,
            entity_version: op_id,
            entity_cbor: Some(vec![0xA0]),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn operation_round_trip() {
        let op = sample_op(42);
        let bytes = encode_to_vec(&op).unwrap();
        let decoded: SyncOperation = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn delete_has_no_post_image() {
        let mut op = sample_op(1);
        op.op_type = OpType::Delete;
        op.entity_cbor = None;
        let bytes = encode_to_vec(&op).unwrap();
        let decoded: SyncOperation = decode_from_slice(&bytes).unwrap();
        assert!(decoded.is_delete());
        assert_eq!(decoded.entity_cbor, None);
    }

    #[test]
    fn oplog_entry_round_trip() {
        let entry = ServerOplogEntry {
            server_cursor: 9,
            operation: sample_op(3),
        };
        let bytes = encode_to_vec(&entry).unwrap();
        let decoded: ServerOplogEntry = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn conflict_round_trip() {
        let conflict = Conflict {
            collection: "notes".to_string(),
            entity_id: "n1".to_string(),
            client_op: sample_op(5),
            server_state: ServerEntityState {
                entity_version: 7,
                entity_cbor: Some(vec![0xB0]),
                last_modified_ms: Some(1_700_000_000_123),
            },
        };
        let bytes = encode_to_vec(&conflict).unwrap();
        let decoded: Conflict = decode_from_slice(&bytes).unwrap();
        assert_eq!(decoded, conflict);
    }

    #[test]
    fn cursor_initial_is_zero_and_never_regresses() {
        let mut cursor = Cursor::initial("app");
        assert_eq!(cursor.last_seen, 0);
        cursor.advance_to(5);
        cursor.advance_to(3);
        assert_eq!(cursor.last_seen, 5);
    }
}
