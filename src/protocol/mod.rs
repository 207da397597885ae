// protocol/mod.rs - Replication protocol models
//
// Operation and conflict types, the request/response message schemas, and
// protocol version negotiation. Every model here round-trips byte-exactly
// through the wire codec.

pub mod messages;
pub mod operation;
pub mod version;

pub use messages::{
    ErrorResponse, HandshakeRequest, HandshakeResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
pub use operation::{
    Conflict, Cursor, OpType, QueueStatus, QueuedOperation, ServerEntityState, ServerOplogEntry,
    SyncOperation,
};
pub use version::{VersionInfo, PROTOCOL_VERSION, PROTOCOL_VERSION_MIN};
