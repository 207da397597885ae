// server/broadcaster.rs - Live subscriber management and event fan-out
//
// Subscribers receive operation notifications (payload bytes omitted;
// clients pull for those), periodic liveness pings, and a connected event
// on admission. Outbound buffers are bounded drop-oldest so a slow consumer
// can lose stale operation hints but keeps receiving pings, and a broadcast
// never blocks the oplog append path.

use crate::metrics::{incr, SyncMetrics};
use crate::protocol::ServerOplogEntry;
use crate::server::service::OplogSink;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Admission and delivery tuning.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub max_total_connections: usize,
    pub max_connections_per_device: usize,
    pub keep_alive_interval: Duration,
    /// Frames buffered per subscriber before the oldest is dropped.
    pub buffer_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 1024,
            max_connections_per_device: 4,
            keep_alive_interval: Duration::from_secs(30),
            buffer_capacity: 256,
        }
    }
}

/// One outbound frame of the streaming text channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastFrame {
    pub event: &'static str,
    pub id: Option<String>,
    pub data: String,
}

impl BroadcastFrame {
    /// Renders the frame in the wire format: `event:`/`id:`/`data:` lines
    /// terminated by a blank line.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        out.push_str("event: ");
        out.push_str(self.event);
        out.push('\n');
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push_str("data: ");
        out.push_str(&self.data);
        out.push_str("\n\n");
        out
    }
}

#[derive(Debug)]
struct Subscriber {
    id: String,
    device_id: String,
    collections: Option<Vec<String>>,
    created_at: DateTime<Utc>,
    events_sent: AtomicU64,
    /// Events with a monotonic sequence at or below this were already
    /// delivered on a previous connection.
    resume_after: Option<u64>,
    buf: parking_lot::Mutex<VecDeque<BroadcastFrame>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    /// Enqueues a frame, dropping the oldest buffered frame when full.
    /// Returns true if something was dropped.
    fn push(&self, frame: BroadcastFrame, capacity: usize) -> bool {
        let mut buf = self.buf.lock();
        let mut dropped = false;
        while buf.len() >= capacity {
            buf.pop_front();
            dropped = true;
        }
        buf.push_back(frame);
        drop(buf);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        dropped
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The consumer side of one subscription. Dropping it closes the channel;
/// the broadcaster reaps the carcass on its next keep-alive tick.
#[derive(Debug)]
pub struct SubscriberHandle {
    subscriber: Arc<Subscriber>,
}

impl SubscriberHandle {
    pub fn subscription_id(&self) -> &str {
        &self.subscriber.id
    }

    /// Waits for the next outbound frame; None once the subscription is
    /// closed and drained.
    pub async fn next_frame(&self) -> Option<BroadcastFrame> {
        loop {
            if let Some(frame) = self.subscriber.buf.lock().pop_front() {
                return Some(frame);
            }
            if self.subscriber.is_closed() {
                return None;
            }
            self.subscriber.notify.notified().await;
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.subscriber.close();
    }
}

#[derive(Default)]
struct Registry {
    subs: HashMap<String, Arc<Subscriber>>,
    /// Subscription ids per device in admission order (front = oldest).
    by_device: HashMap<String, VecDeque<String>>,
}

impl Registry {
    fn remove(&mut self, subscription_id: &str) {
        if let Some(sub) = self.subs.remove(subscription_id) {
            if let Some(ids) = self.by_device.get_mut(&sub.device_id) {
                ids.retain(|id| id != subscription_id);
                if ids.is_empty() {
                    self.by_device.remove(&sub.device_id);
                }
            }
        }
    }
}

/// Stats block surfaced on /v1/stats.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    pub active_subscriptions: usize,
    pub devices: usize,
    pub events_sent: u64,
    pub subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub subscription_id: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub events_sent: u64,
}

/// Manages live subscribers and fans out oplog appends.
pub struct EventBroadcaster {
    config: BroadcasterConfig,
    metrics: Arc<SyncMetrics>,
    seq: AtomicU64,
    registry: parking_lot::Mutex<Registry>,
}

impl EventBroadcaster {
    pub fn new(config: BroadcasterConfig, metrics: Arc<SyncMetrics>) -> Arc<Self> {
        Arc::new(Self {
            config,
            metrics,
            seq: AtomicU64::new(0),
            registry: parking_lot::Mutex::new(Registry::default()),
        })
    }

    /// Admits a subscriber and emits its `connected` event.
    ///
    /// Admission policy: reject outright at the total-connection ceiling;
    /// when one device is at its per-device cap, evict that device's
    /// oldest subscription first (error event, then close).
    pub fn subscribe(
        &self,
        device_id: impl Into<String>,
        collections: Option<Vec<String>>,
        current_cursor: u64,
        last_event_id: Option<&str>,
    ) -> Result<SubscriberHandle> {
        let device_id = device_id.into();
        let resume_after = last_event_id.and_then(parse_event_seq);
        let subscription_id = uuid::Uuid::new_v4().to_string();

        let subscriber = Arc::new(Subscriber {
            id: subscription_id.clone(),
            device_id: device_id.clone(),
            collections,
            created_at: Utc::now(),
            events_sent: AtomicU64::new(0),
            resume_after,
            buf: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        {
            let mut registry = self.registry.lock();
            if registry.subs.len() >= self.config.max_total_connections {
                return Err(Error::RateLimited("too many subscribers".to_string()));
            }

            let at_device_cap = registry
                .by_device
                .get(&device_id)
                .is_some_and(|ids| ids.len() >= self.config.max_connections_per_device);
            if at_device_cap {
                let oldest = registry
                    .by_device
                    .get_mut(&device_id)
                    .and_then(|ids| ids.pop_front());
                if let Some(oldest) = oldest {
                    if let Some(old) = registry.subs.get(&oldest).cloned() {
                        old.push(
                            BroadcastFrame {
                                event: "error",
                                id: None,
                                data: r#"{"message":"evicted: connection limit reached"}"#
                                    .to_string(),
                            },
                            self.config.buffer_capacity,
                        );
                        old.close();
                    }
                    registry.remove(&oldest);
                    incr(&self.metrics.subscribers_evicted);
                    tracing::debug!(
                        "Evicted oldest subscription for device '{}'",
                        device_id
                    );
                }
            }
            registry
                .by_device
                .entry(device_id.clone())
                .or_default()
                .push_back(subscription_id.clone());
            registry.subs.insert(subscription_id.clone(), subscriber.clone());
        }

        subscriber.push(
            BroadcastFrame {
                event: "connected",
                id: None,
                data: format!(
                    r#"{{"serverCursor":{},"subscriptionId":"{}"}}"#,
                    current_cursor, subscription_id
                ),
            },
            self.config.buffer_capacity,
        );

        tracing::debug!(
            "Subscriber {} admitted for device '{}' (cursor {})",
            subscription_id,
            device_id,
            current_cursor
        );
        Ok(SubscriberHandle { subscriber })
    }

    /// Periodic liveness tick: ping every active subscriber and reap the
    /// closed ones.
    pub fn keep_alive_tick(&self) {
        let mut registry = self.registry.lock();
        let dead: Vec<String> = registry
            .subs
            .values()
            .filter(|sub| sub.is_closed())
            .map(|sub| sub.id.clone())
            .collect();
        for id in dead {
            registry.remove(&id);
            tracing::debug!("Reaped closed subscription {}", id);
        }

        let ping = BroadcastFrame {
            event: "ping",
            id: None,
            data: format!(r#"{{"ts":{}}}"#, Utc::now().timestamp_millis()),
        };
        for sub in registry.subs.values() {
            sub.push(ping.clone(), self.config.buffer_capacity);
        }
    }

    /// Spawns the keep-alive loop.
    pub fn spawn_keep_alive(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broadcaster.config.keep_alive_interval);
            // The first tick fires immediately; skip it so fresh
            // subscribers are not pinged at admission time.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => broadcaster.keep_alive_tick(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> BroadcasterStats {
        let registry = self.registry.lock();
        let subscriptions: Vec<SubscriptionInfo> = registry
            .subs
            .values()
            .map(|sub| SubscriptionInfo {
                subscription_id: sub.id.clone(),
                device_id: sub.device_id.clone(),
                created_at: sub.created_at,
                events_sent: sub.events_sent.load(Ordering::Relaxed),
            })
            .collect();
        BroadcasterStats {
            active_subscriptions: registry.subs.len(),
            devices: registry.by_device.len(),
            events_sent: subscriptions.iter().map(|s| s.events_sent).sum(),
            subscriptions,
        }
    }
}

impl OplogSink for EventBroadcaster {
    fn operation_appended(&self, entry: &ServerOplogEntry) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", entry.server_cursor, seq);
        let op = &entry.operation;
        // The post-image stays out of the event; subscribers pull for it.
        let data = serde_json::json!({
            "dbId": op.db_id,
            "collection": op.collection,
            "entityId": op.entity_id,
            "opType": op.op_type,
            "entityVersion": op.entity_version,
            "deviceId": op.device_id,
            "opId": op.op_id,
            "serverCursor": entry.server_cursor,
        })
        .to_string();

        let registry = self.registry.lock();
        for sub in registry.subs.values() {
            if sub.is_closed() {
                continue;
            }
            if let Some(cols) = &sub.collections {
                if !cols.iter().any(|c| *c == op.collection) {
                    continue;
                }
            }
            if let Some(resume) = sub.resume_after {
                if seq <= resume {
                    continue;
                }
            }
            let dropped = sub.push(
                BroadcastFrame {
                    event: "operations",
                    id: Some(id.clone()),
                    data: data.clone(),
                },
                self.config.buffer_capacity,
            );
            incr(&self.metrics.events_broadcast);
            if dropped {
                incr(&self.metrics.events_dropped);
            }
        }
    }
}

/// Event ids are `<cursor>-<monotonic>`; resume filtering compares the
/// monotonic half.
fn parse_event_seq(id: &str) -> Option<u64> {
    id.rsplit_once('-')?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpType, SyncOperation};

    fn entry(cursor: u64, device: &str, collection: &str) -> ServerOplogEntry {
        ServerOplogEntry {
            server_cursor: cursor,
            operation: SyncOperation {
                op_id: cursor,
                db_id: "app".into(),
                device_id: device.into(),
                collection: collection.into(),
                entity_id: format!("e{}", cursor),
                op_type: OpType::Upsert,
                entity_version: 1,
                entity_cbor: Some(vec![0xFF]),
                timestamp_ms: 0,
            },
        }
    }

    fn broadcaster() -> Arc<EventBroadcaster> {
        EventBroadcaster::new(BroadcasterConfig::default(), SyncMetrics::new())
    }

    #[tokio::test]
    async fn connected_event_carries_cursor_and_id() {
        let b = broadcaster();
        let handle = b.subscribe("device-a", None, 42, None).unwrap();
        let frame = handle.next_frame().await.unwrap();
        assert_eq!(frame.event, "connected");
        assert!(frame.data.contains("\"serverCursor\":42"));
        assert!(frame.data.contains(handle.subscription_id()));
    }

    #[tokio::test]
    async fn collections_filter_admits_matching_ops_only() {
        let b = broadcaster();
        let handle = b
            .subscribe("device-b", Some(vec!["users".into()]), 10, None)
            .unwrap();
        let _connected = handle.next_frame().await.unwrap();

        b.operation_appended(&entry(11, "device-a", "notes"));
        b.operation_appended(&entry(12, "device-a", "users"));

        let frame = handle.next_frame().await.unwrap();
        assert_eq!(frame.event, "operations");
        let id = frame.id.unwrap();
        assert!(id.starts_with("12-"), "id was {}", id);
        // The post-image never rides along.
        assert!(!frame.data.contains("entityCbor"));
        assert!(handle.subscriber.buf.lock().is_empty());
    }

    #[tokio::test]
    async fn admission_is_by_collections_filter_only() {
        // A subscriber sharing the pusher's device id still receives the
        // event; suppression of self-echo belongs to the pull path's
        // excludeDeviceId, not the broadcaster.
        let b = broadcaster();
        let handle = b.subscribe("device-a", None, 0, None).unwrap();
        let _connected = handle.next_frame().await.unwrap();

        b.operation_appended(&entry(1, "device-a", "notes"));
        b.operation_appended(&entry(2, "device-b", "notes"));

        let first = handle.next_frame().await.unwrap();
        assert!(first.id.unwrap().starts_with("1-"));
        let second = handle.next_frame().await.unwrap();
        assert!(second.id.unwrap().starts_with("2-"));
    }

    #[tokio::test]
    async fn last_event_id_filters_replayed_ids() {
        let b = broadcaster();
        b.operation_appended(&entry(1, "device-a", "notes")); // seq 1, nobody listening

        let handle = b.subscribe("device-b", None, 1, Some("1-1")).unwrap();
        let _connected = handle.next_frame().await.unwrap();

        b.operation_appended(&entry(2, "device-a", "notes")); // seq 2
        let frame = handle.next_frame().await.unwrap();
        assert!(frame.id.unwrap().starts_with("2-"));
    }

    #[tokio::test]
    async fn device_cap_evicts_oldest_with_error() {
        let config = BroadcasterConfig {
            max_connections_per_device: 1,
            ..BroadcasterConfig::default()
        };
        let b = EventBroadcaster::new(config, SyncMetrics::new());

        let first = b.subscribe("device-a", None, 0, None).unwrap();
        let _connected = first.next_frame().await.unwrap();
        let _second = b.subscribe("device-a", None, 0, None).unwrap();

        let frame = first.next_frame().await.unwrap();
        assert_eq!(frame.event, "error");
        assert!(frame.data.contains("evicted"));
        assert!(first.next_frame().await.is_none());
        assert_eq!(b.stats().active_subscriptions, 1);
    }

    #[tokio::test]
    async fn total_cap_rejects() {
        let config = BroadcasterConfig {
            max_total_connections: 1,
            ..BroadcasterConfig::default()
        };
        let b = EventBroadcaster::new(config, SyncMetrics::new());
        let _first = b.subscribe("device-a", None, 0, None).unwrap();
        let err = b.subscribe("device-b", None, 0, None).unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
    }

    #[tokio::test]
    async fn keep_alive_pings_and_reaps() {
        let b = broadcaster();
        let kept = b.subscribe("device-a", None, 0, None).unwrap();
        let _connected = kept.next_frame().await.unwrap();
        {
            let dropped = b.subscribe("device-b", None, 0, None).unwrap();
            drop(dropped);
        }
        assert_eq!(b.stats().active_subscriptions, 2);

        b.keep_alive_tick();
        assert_eq!(b.stats().active_subscriptions, 1);
        let frame = kept.next_frame().await.unwrap();
        assert_eq!(frame.event, "ping");
    }

    #[tokio::test]
    async fn slow_consumer_drops_oldest_but_keeps_latest() {
        let config = BroadcasterConfig {
            buffer_capacity: 2,
            ..BroadcasterConfig::default()
        };
        let b = EventBroadcaster::new(config, SyncMetrics::new());
        let handle = b.subscribe("device-b", None, 0, None).unwrap();
        let _connected = handle.next_frame().await.unwrap();

        for cursor in 1..=5 {
            b.operation_appended(&entry(cursor, "device-a", "notes"));
        }

        // Only the two newest frames survive.
        let first = handle.next_frame().await.unwrap();
        let second = handle.next_frame().await.unwrap();
        assert!(first.id.unwrap().starts_with("4-"));
        assert!(second.id.unwrap().starts_with("5-"));
    }

    #[test]
    fn frame_rendering_matches_wire_format() {
        let frame = BroadcastFrame {
            event: "operations",
            id: Some("3-7".into()),
            data: "{\"x\":1}".into(),
        };
        assert_eq!(
            frame.render(),
            "event: operations\nid: 3-7\ndata: {\"x\":1}\n\n"
        );

        let ping = BroadcastFrame {
            event: "ping",
            id: None,
            data: "{}".into(),
        };
        assert_eq!(ping.render(), "event: ping\ndata: {}\n\n");
    }

    #[test]
    fn event_seq_parsing() {
        assert_eq!(parse_event_seq("12-34"), Some(34));
        assert_eq!(parse_event_seq("nonsense"), None);
    }

    #[tokio::test]
    async fn stats_report_per_subscription_detail() {
        let b = broadcaster();
        let _handle = b.subscribe("device-a", None, 0, None).unwrap();
        let stats = b.stats();
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.subscriptions[0].device_id, "device-a");
        // The connected event counts as sent.
        assert_eq!(stats.events_sent, 1);
    }
}
