// engine/mod.rs - Client-side sync engine state machine
//
// Drives pull-then-push cycles against the coordinator: handshake, pull
// pages until the server has no more, drain the offline queue in batches,
// then go idle until the next trigger. Recoverable failures retry with
// exponential backoff; fatal ones park the engine in Error.

pub mod backoff;
pub mod transport;

use crate::config::SyncConfig;
use crate::metrics::{incr, incr_by, SyncMetrics};
use crate::protocol::{
    HandshakeRequest, PullRequest, PushRequest, ServerOplogEntry, SyncOperation, PROTOCOL_VERSION,
};
use crate::queue::OfflineQueue;
use crate::resolver::{ConflictResolver, Resolution, ResolveConflict};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Notify};

pub use backoff::Backoff;
pub use transport::{HttpTransport, MockTransport, SyncTransport};

/// Engine states, in cycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Connecting,
    Pulling,
    Pushing,
    Synced,
    Error,
}

impl SyncState {
    /// True while a sync cycle is in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting | SyncState::Pulling | SyncState::Pushing
        )
    }
}

/// One state transition as published on the engine's state stream.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state: SyncState,
    pub error: Option<Error>,
}

/// Collaborator applying pulled operations to local storage and persisting
/// the server cursor.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn apply_operations(&self, entries: &[ServerOplogEntry]) -> Result<()>;
    async fn load_cursor(&self) -> Result<u64>;
    async fn save_cursor(&self, cursor: u64) -> Result<()>;
}

/// In-memory local store for tests and demos.
#[derive(Default)]
pub struct MemoryLocalStore {
    applied: parking_lot::Mutex<Vec<ServerOplogEntry>>,
    cursor: AtomicU64,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<ServerOplogEntry> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn apply_operations(&self, entries: &[ServerOplogEntry]) -> Result<()> {
        self.applied.lock().extend_from_slice(entries);
        Ok(())
    }

    async fn load_cursor(&self) -> Result<u64> {
        Ok(self.cursor.load(Ordering::SeqCst))
    }

    async fn save_cursor(&self, cursor: u64) -> Result<()> {
        self.cursor.store(cursor, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome of one completed sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub pulled: u64,
    pub pushed: u64,
    pub conflicts: u64,
}

/// The client sync engine. Single-flight: at most one cycle runs at a time.
pub struct SyncEngine<T: SyncTransport, S: LocalStore> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    queue: Arc<Mutex<OfflineQueue>>,
    resolver: ConflictResolver,
    metrics: Arc<SyncMetrics>,
    state: parking_lot::RwLock<SyncState>,
    events: broadcast::Sender<StateEvent>,
    trigger: Notify,
    cancelled: AtomicBool,
    session_id: parking_lot::Mutex<Option<String>>,
}

impl<T: SyncTransport, S: LocalStore> SyncEngine<T, S> {
    pub fn new(
        config: SyncConfig,
        transport: T,
        store: S,
        queue: Arc<Mutex<OfflineQueue>>,
        resolver: ConflictResolver,
        metrics: Arc<SyncMetrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            transport: Arc::new(transport),
            store: Arc::new(store),
            queue,
            resolver,
            metrics,
            state: parking_lot::RwLock::new(SyncState::Idle),
            events,
            trigger: Notify::new(),
            cancelled: AtomicBool::new(false),
            session_id: parking_lot::Mutex::new(None),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Subscribe to every state transition.
    pub fn state_stream(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Wakes the engine for an immediate cycle. A no-op while a cycle is
    /// already in flight; from a parked fatal Error this is the only way
    /// back.
    pub fn request_sync(&self) -> bool {
        if self.state().is_active() {
            return false;
        }
        self.trigger.notify_one();
        true
    }

    /// Nudge from a received live `operations` event: same as request_sync
    /// but kept separate so callers can meter the two triggers.
    pub fn remote_change(&self) {
        self.request_sync();
    }

    /// Cooperatively cancels the cycle in flight at its next suspension
    /// point. Progress already acknowledged stays durable.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(Error::State("sync cycle cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState, error: Option<Error>) {
        *self.state.write() = state;
        let _ = self.events.send(StateEvent { state, error });
    }

    /// Runs sync cycles until shutdown: wake on the periodic interval, an
    /// explicit request, or backoff expiry after a recoverable error.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sync_interval) => {}
                _ = self.trigger.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            loop {
                match self.sync_once().await {
                    Ok(_) => {
                        backoff.reset();
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            "Sync failed ({}), retrying in {:.1}s",
                            e,
                            delay.as_secs_f64()
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Sync failed fatally, waiting for operator: {}", e);
                        // No automatic retry. Park until an explicit
                        // request_sync or shutdown.
                        tokio::select! {
                            _ = self.trigger.notified() => continue,
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Performs one full cycle: handshake, pull, push.
    pub async fn sync_once(&self) -> Result<CycleSummary> {
        if self.state().is_active() {
            return Err(Error::State("sync already in progress".to_string()));
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let result = self.cycle().await;
        match &result {
            Ok(summary) => {
                incr(&self.metrics.sync_cycles);
                self.set_state(SyncState::Synced, None);
                self.set_state(SyncState::Idle, None);
                tracing::debug!(
                    "Sync cycle complete: pulled {}, pushed {}, conflicts {}",
                    summary.pulled,
                    summary.pushed,
                    summary.conflicts
                );
            }
            Err(e) => {
                self.set_state(SyncState::Error, Some(e.clone()));
            }
        }
        result
    }

    async fn cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();

        self.set_state(SyncState::Connecting, None);
        self.handshake().await?;
        self.check_cancelled()?;

        self.set_state(SyncState::Pulling, None);
        summary.pulled = self.pull_all().await?;
        self.check_cancelled()?;

        self.set_state(SyncState::Pushing, None);
        let (pushed, conflicts) = self.push_all().await?;
        summary.pushed = pushed;
        summary.conflicts = conflicts;

        Ok(summary)
    }

    async fn handshake(&self) -> Result<()> {
        let last_cursor = self.store.load_cursor().await?;
        let request = HandshakeRequest {
            client_protocol_version: PROTOCOL_VERSION,
            device_id: self.config.device_id.clone(),
            db_id: self.config.db_id.clone(),
            last_cursor,
        };

        let response = self.transport.handshake(&request).await?;
        if !response.accepted {
            let reason = response
                .reject_reason
                .unwrap_or_else(|| "handshake rejected".to_string());
            return Err(Error::UnknownDatabase(reason));
        }

        *self.session_id.lock() = Some(response.session_id);
        tracing::debug!(
            "Handshake ok, server cursor {} (local {})",
            response.server_cursor,
            last_cursor
        );
        Ok(())
    }

    async fn pull_all(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut cursor = self.store.load_cursor().await?;

        for _page in 0..self.config.max_pull_pages {
            self.check_cancelled()?;

            let request = PullRequest {
                db_id: self.config.db_id.clone(),
                since_cursor: cursor,
                limit: self.config.pull_batch_size,
                collections: None,
                exclude_device_id: Some(self.config.device_id.clone()),
            };
            let response = self.transport.pull(&request).await?;

            if !response.ops.is_empty() {
                self.store.apply_operations(&response.ops).await?;
                total += response.ops.len() as u64;
                incr_by(&self.metrics.ops_pulled, response.ops.len() as u64);
            }
            // Persist after every batch so a crash resumes, not restarts.
            self.store.save_cursor(response.next_cursor).await?;
            cursor = response.next_cursor;

            if !response.has_more {
                break;
            }
        }
        Ok(total)
    }

    async fn push_all(&self) -> Result<(u64, u64)> {
        let mut pushed = 0u64;
        let mut conflicts_seen = 0u64;
        let mut rewritten: HashSet<u64> = HashSet::new();

        loop {
            self.check_cancelled()?;

            let batch = {
                let queue = self.queue.lock().await;
                queue.get_pending(0, self.config.push_batch_size as usize, true)?
            };
            if batch.is_empty() {
                break;
            }
            let ops: Vec<SyncOperation> =
                batch.iter().map(|item| item.operation.clone()).collect();

            let request = PushRequest {
                db_id: self.config.db_id.clone(),
                device_id: self.config.device_id.clone(),
                ops: ops.clone(),
            };

            let response = match self.transport.push(&request).await {
                Ok(response) => response,
                Err(e) if e.is_retryable() => {
                    // Transport or server failure: account the attempt on
                    // every operation in the batch, then back off.
                    let mut queue = self.queue.lock().await;
                    for op in &ops {
                        queue.mark_failed(op.op_id, Some(&e.to_string())).await?;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            let mut progress = false;
            if response.accepted_up_to_op_id > 0 {
                let removed = {
                    let mut queue = self.queue.lock().await;
                    queue.acknowledge(response.accepted_up_to_op_id).await?
                };
                if removed > 0 {
                    progress = true;
                    pushed += removed as u64;
                    incr_by(&self.metrics.ops_pushed, removed as u64);
                }
            }

            for conflict in &response.conflicts {
                conflicts_seen += 1;
                incr(&self.metrics.conflicts_detected);
                let op_id = conflict.client_op.op_id;

                match self.resolver.resolve(conflict) {
                    Resolution::TakeServer => {
                        let mut queue = self.queue.lock().await;
                        if queue.remove(op_id).await? {
                            progress = true;
                        }
                        tracing::debug!(
                            "Conflict on {}/{}: server wins, dropping local op {}",
                            conflict.collection,
                            conflict.entity_id,
                            op_id
                        );
                    }
                    resolution => {
                        // TakeClient or Merged: rewrite past the server head
                        // and push again.
                        if !rewritten.insert(op_id) {
                            // Second conflict for the same op this cycle:
                            // another writer keeps racing us. Leave it for
                            // the next cycle.
                            let mut queue = self.queue.lock().await;
                            queue.mark_failed(op_id, Some("repeated conflict")).await?;
                            continue;
                        }
                        let mut op = conflict.client_op.clone();
                        op.entity_version = conflict.server_state.entity_version + 1;
                        if let Resolution::Merged(bytes) = resolution {
                            op.entity_cbor = Some(bytes);
                        }
                        let mut queue = self.queue.lock().await;
                        if queue.replace(op).await? {
                            progress = true;
                        }
                    }
                }
            }

            if !progress {
                break;
            }
        }

        Ok((pushed, conflicts_seen))
    }
}
