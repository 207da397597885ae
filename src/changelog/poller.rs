// changelog/poller.rs - Fixed-cadence polling task feeding the offline queue

use super::{ChangeLog, ChangeLogReader};
use crate::queue::OfflineQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Default poll cadence; the storage engine offers no file notification.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Drives a `ChangeLogReader` on a fixed cadence and enqueues whatever it
/// emits. The poller is the only writer into the offline queue.
pub struct ChangeLogPoller<L: ChangeLog> {
    reader: ChangeLogReader<L>,
    queue: Arc<Mutex<OfflineQueue>>,
    poll_interval: Duration,
}

impl<L: ChangeLog + 'static> ChangeLogPoller<L> {
    pub fn new(reader: ChangeLogReader<L>, queue: Arc<Mutex<OfflineQueue>>) -> Self {
        Self {
            reader,
            queue,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawns the polling loop. Flip the watch sender to true to stop it.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Polls until shutdown. Read errors are logged and retried on the next
    /// tick; queue persistence errors likewise never kill the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        tracing::info!(
            "Change-log poller started (every {:?})",
            self.poll_interval
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Change-log poller stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One poll plus enqueue. Public for deterministic tests.
    pub async fn tick(&mut self) {
        let ops = match self.reader.poll_once().await {
            Ok(ops) => ops,
            Err(e) => {
                tracing::warn!("Change-log poll failed: {}", e);
                return;
            }
        };
        if ops.is_empty() {
            return;
        }

        let mut queue = self.queue.lock().await;
        match queue.enqueue_all(ops).await {
            Ok(added) if added > 0 => {
                tracing::debug!("Enqueued {} new op(s) from change log", added);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to enqueue change-log ops: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::MemoryChangeLog;

    #[tokio::test]
    async fn tick_moves_committed_changes_into_queue() {
        let log = Arc::new(MemoryChangeLog::new());
        log.commit_txn(vec![("notes", "n1", Some(vec![0x01]))]);

        let dir = tempfile::tempdir().unwrap();
        let reader = ChangeLogReader::open(
            log.clone(),
            "app",
            "device-a",
            dir.path().join("lsn.json"),
            1,
        )
        .await
        .unwrap();

        let mut queue = OfflineQueue::new(dir.path().join("queue.json"), 3);
        queue.open().await.unwrap();
        let queue = Arc::new(Mutex::new(queue));

        let mut poller = ChangeLogPoller::new(reader, queue.clone());
        poller.tick().await;

        let queue = queue.lock().await;
        let pending = queue.get_pending(0, 10, false).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.entity_id, "n1");
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_duplicate() {
        let log = Arc::new(MemoryChangeLog::new());
        log.commit_txn(vec![("notes", "n1", Some(vec![0x01]))]);

        let dir = tempfile::tempdir().unwrap();
        let reader = ChangeLogReader::open(
            log.clone(),
            "app",
            "device-a",
            dir.path().join("lsn.json"),
            1,
        )
        .await
        .unwrap();

        let mut queue = OfflineQueue::new(dir.path().join("queue.json"), 3);
        queue.open().await.unwrap();
        let queue = Arc::new(Mutex::new(queue));

        let mut poller = ChangeLogPoller::new(reader, queue.clone());
        poller.tick().await;
        poller.tick().await;
        log.commit_txn(vec![("notes", "n2", Some(vec![0x02]))]);
        poller.tick().await;

        let queue = queue.lock().await;
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn spawned_poller_stops_on_shutdown() {
        let log = Arc::new(MemoryChangeLog::new());
        let dir = tempfile::tempdir().unwrap();
        let reader = ChangeLogReader::open(
            log,
            "app",
            "device-a",
            dir.path().join("lsn.json"),
            1,
        )
        .await
        .unwrap();

        let mut queue = OfflineQueue::new(dir.path().join("queue.json"), 3);
        queue.open().await.unwrap();
        let queue = Arc::new(Mutex::new(queue));

        let (tx, rx) = watch::channel(false);
        let handle = ChangeLogPoller::new(reader, queue)
            .with_poll_interval(Duration::from_millis(10))
            .spawn(rx);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
