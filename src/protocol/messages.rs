// protocol/messages.rs - Request/response message schemas

use crate::codec::{MapDecoder, MapEncoder, WireMessage};
use crate::error::SyncErrorCode;
use crate::{Error, Result};
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use super::operation::{Conflict, ServerOplogEntry, SyncOperation};

/// Opens a sync session and negotiates the protocol version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_protocol_version: u32,
    pub device_id: String,
    pub db_id: String,
    pub last_cursor: u64,
}

impl WireMessage for HandshakeRequest {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .u32("clientProtocolVersion", self.client_protocol_version)
            .str("deviceId", &self.device_id)
            .str("dbId", &self.db_id)
            .u64("lastCursor", self.last_cursor)
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "HandshakeRequest")?;
        Ok(Self {
            client_protocol_version: map.u32("clientProtocolVersion")?,
            device_id: map.string("deviceId")?,
            db_id: map.string("dbId")?,
            last_cursor: map.u64("lastCursor")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub server_protocol_version: u32,
    pub server_cursor: u64,
    pub session_id: String,
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

impl WireMessage for HandshakeResponse {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .u32("serverProtocolVersion", self.server_protocol_version)
            .u64("serverCursor", self.server_cursor)
            .str("sessionId", &self.session_id)
            .bool("accepted", self.accepted)
            .opt_str("rejectReason", self.reject_reason.as_deref())
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "HandshakeResponse")?;
        Ok(Self {
            server_protocol_version: map.u32("serverProtocolVersion")?,
            server_cursor: map.u64("serverCursor")?,
            session_id: map.string("sessionId")?,
            accepted: map.bool("accepted")?,
            reject_reason: map.opt_string("rejectReason")?,
        })
    }
}

/// Requests oplog entries after a cursor position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub db_id: String,
    pub since_cursor: u64,
    pub limit: u32,
    /// Restrict to these collections when present.
    pub collections: Option<Vec<String>>,
    /// Skip operations originated by this device.
    pub exclude_device_id: Option<String>,
}

impl WireMessage for PullRequest {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .str("dbId", &self.db_id)
            .u64("sinceCursor", self.since_cursor)
            .u32("limit", self.limit)
            .opt_array(
                "collections",
                self.collections
                    .as_ref()
                    .map(|cs| cs.iter().map(|c| Value::Text(c.clone())).collect()),
            )
            .opt_str("excludeDeviceId", self.exclude_device_id.as_deref())
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "PullRequest")?;
        let collections = match map.opt_array("collections")? {
            None => None,
            Some(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Text(s) => out.push(s.clone()),
                        other => {
                            return Err(Error::Format(format!(
                                "PullRequest: collections entries must be strings, found {:?}",
                                other
                            )))
                        }
                    }
                }
                Some(out)
            }
        };
        Ok(Self {
            db_id: map.string("dbId")?,
            since_cursor: map.u64("sinceCursor")?,
            limit: map.u32("limit")?,
            collections,
            exclude_device_id: map.opt_string("excludeDeviceId")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub ops: Vec<ServerOplogEntry>,
    /// Greatest cursor returned, or the request's since_cursor if none.
    pub next_cursor: u64,
    pub has_more: bool,
}

impl WireMessage for PullResponse {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .array("ops", self.ops.iter().map(|e| e.to_wire()).collect())
            .u64("nextCursor", self.next_cursor)
            .bool("hasMore", self.has_more)
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "PullResponse")?;
        let ops = map
            .array("ops")?
            .iter()
            .map(ServerOplogEntry::from_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ops,
            next_cursor: map.u64("nextCursor")?,
            has_more: map.bool("hasMore")?,
        })
    }
}

/// Submits a batch of locally produced operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub db_id: String,
    pub device_id: String,
    pub ops: Vec<SyncOperation>,
}

impl WireMessage for PushRequest {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .str("dbId", &self.db_id)
            .str("deviceId", &self.device_id)
            .array("ops", self.ops.iter().map(|op| op.to_wire()).collect())
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "PushRequest")?;
        let ops = map
            .array("ops")?
            .iter()
            .map(SyncOperation::from_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            db_id: map.string("dbId")?,
            device_id: map.string("deviceId")?,
            ops,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Greatest accepted op id; 0 when nothing was accepted.
    pub accepted_up_to_op_id: u64,
    pub conflicts: Vec<Conflict>,
    pub new_server_cursor: u64,
}

impl WireMessage for PushResponse {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .u64("acceptedUpToOpId", self.accepted_up_to_op_id)
            .array(
                "conflicts",
                self.conflicts.iter().map(|c| c.to_wire()).collect(),
            )
            .u64("newServerCursor", self.new_server_cursor)
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "PushResponse")?;
        let conflicts = map
            .array("conflicts")?
            .iter()
            .map(Conflict::from_wire)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            accepted_up_to_op_id: map.u64("acceptedUpToOpId")?,
            conflicts,
            new_server_cursor: map.u64("newServerCursor")?,
        })
    }
}

/// Typed failure payload returned on non-success statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: SyncErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Maps this wire error back into the typed error for the caller.
    pub fn into_error(self) -> Error {
        match self.code {
            SyncErrorCode::NetworkError => Error::Network(self.message),
            SyncErrorCode::Timeout => Error::Timeout(self.message),
            SyncErrorCode::VersionMismatch => Error::VersionMismatch(self.message),
            SyncErrorCode::AuthenticationFailed => Error::Auth(self.message),
            SyncErrorCode::Conflict | SyncErrorCode::InvalidRequest => {
                Error::InvalidRequest(self.message)
            }
            SyncErrorCode::RateLimited => Error::RateLimited(self.message),
            SyncErrorCode::StorageError | SyncErrorCode::StateLost => {
                Error::Storage(self.message)
            }
            SyncErrorCode::UnknownDatabase => Error::UnknownDatabase(self.message),
            SyncErrorCode::Internal => Error::Internal(self.message),
        }
    }
}

impl WireMessage for ErrorResponse {
    fn to_wire(&self) -> Value {
        MapEncoder::new()
            .str("code", self.code.as_str())
            .str("message", &self.message)
            .opt_str("details", self.details.as_deref())
            .finish()
    }

    fn from_wire(value: &Value) -> Result<Self> {
        let map = MapDecoder::new(value, "ErrorResponse")?;
        let code_str = map.str("code")?;
        let code = SyncErrorCode::parse(code_str)
            .ok_or_else(|| Error::Format(format!("ErrorResponse: unknown code '{}'", code_str)))?;
        Ok(Self {
            code,
            message: map.string("message")?,
            details: map.opt_string("details")?,
        })
    }
}
