// resolver.rs - Conflict resolution strategies
//
// A resolver sees nothing but the conflict itself: no I/O, no engine state.
// The same strategies run on the server (during push) and on the client
// (when a push response reports conflicts).

use crate::protocol::Conflict;
use std::sync::Arc;

/// Outcome of resolving a single conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the client's operation.
    TakeClient,
    /// Keep the server's state; the client operation is rejected.
    TakeServer,
    /// Replace the post-image with merged bytes.
    Merged(Vec<u8>),
}

/// Strategy interface for conflict resolution.
pub trait ResolveConflict: Send + Sync {
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Built-in conflict resolution policies.
#[derive(Clone)]
pub enum ConflictResolver {
    /// The server's state always stands. Default.
    ServerWins,
    /// The client's operation always wins.
    ClientWins,
    /// Compare origin timestamps; ties go to the server.
    ///
    /// Timestamps originate on client wall clocks with no skew mitigation,
    /// so this policy is only appropriate where clients share a trusted
    /// clock source.
    LastWriteWins,
    /// User-supplied resolution function.
    Custom(Arc<dyn Fn(&Conflict) -> Resolution + Send + Sync>),
}

impl Default for ConflictResolver {
    fn default() -> Self {
        ConflictResolver::ServerWins
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictResolver::ServerWins => write!(f, "ServerWins"),
            ConflictResolver::ClientWins => write!(f, "ClientWins"),
            ConflictResolver::LastWriteWins => write!(f, "LastWriteWins"),
            ConflictResolver::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl ResolveConflict for ConflictResolver {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        match self {
            ConflictResolver::ServerWins => Resolution::TakeServer,
            ConflictResolver::ClientWins => Resolution::TakeClient,
            ConflictResolver::LastWriteWins => {
                match conflict.server_state.last_modified_ms {
                    Some(server_ms) if conflict.client_op.timestamp_ms > server_ms => {
                        Resolution::TakeClient
                    }
                    // Tie or older client write, or unknown server time.
                    _ => Resolution::TakeServer,
                }
            }
            ConflictResolver::Custom(f) => f(conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpType, ServerEntityState, SyncOperation};

    fn conflict(client_ts: i64, server_ts: Option<i64>) -> Conflict {
        Conflict {
            collection: "notes".into(),
            entity_id: "n1".into(),
            client_op: SyncOperation {
                op_id: 1,
                db_id: "app".into(),
                device_id: "device-a".into(),
                collection: "notes".into(),
                entity_id: "n1".into(),
                op_type: OpType::Upsert,
                entity_version: 2,
                entity_cbor: Some(vec![0xC0]),
                timestamp_ms: client_ts,
            },
            server_state: ServerEntityState {
                entity_version: 2,
                entity_cbor: Some(vec![0xB0]),
                last_modified_ms: server_ts,
            },
        }
    }

    #[test]
    fn server_wins_always_takes_server() {
        let resolver = ConflictResolver::ServerWins;
        assert_eq!(resolver.resolve(&conflict(999, Some(1))), Resolution::TakeServer);
    }

    #[test]
    fn client_wins_always_takes_client() {
        let resolver = ConflictResolver::ClientWins;
        assert_eq!(resolver.resolve(&conflict(1, Some(999))), Resolution::TakeClient);
    }

    #[test]
    fn last_write_wins_compares_timestamps() {
        let resolver = ConflictResolver::LastWriteWins;
        assert_eq!(resolver.resolve(&conflict(200, Some(100))), Resolution::TakeClient);
        assert_eq!(resolver.resolve(&conflict(100, Some(200))), Resolution::TakeServer);
        // Tie goes to the server.
        assert_eq!(resolver.resolve(&conflict(100, Some(100))), Resolution::TakeServer);
        // Unknown server time falls back to server.
        assert_eq!(resolver.resolve(&conflict(100, None)), Resolution::TakeServer);
    }

    #[test]
    fn custom_resolver_can_merge() {
        let resolver = ConflictResolver::Custom(Arc::new(|c: &Conflict| {
            let mut merged = c.server_state.entity_cbor.clone().unwrap_or_default();
            merged.extend(c.client_op.entity_cbor.clone().unwrap_or_default());
            Resolution::Merged(merged)
        }));
        match resolver.resolve(&conflict(1, Some(2))) {
            Resolution::Merged(bytes) => assert_eq!(bytes, vec![0xB0, 0xC0]),
            other => panic!("expected merge, got {:?}", other),
        }
    }
}
