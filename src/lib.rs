// lib.rs - Offline-first bi-directional replication engine
//
// Clients tail their storage engine's change log into a durable offline
// queue and run a pull-then-push sync cycle against a central coordinator.
// The coordinator keeps a per-database oplog, detects version conflicts on
// push, and fans accepted operations out to live subscribers.

pub mod changelog;
pub mod codec;
pub mod config;
pub mod engine;
mod error;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod resolver;
pub mod server;

pub use config::{ServerConfig, SyncConfig};
pub use error::{Error, Result, SyncErrorCode};
