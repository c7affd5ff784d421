//! Subscription hub: fan-out of change events to per-client buffers.
//!
//! A single database listener feeds the hub; each subscriber owns a bounded
//! ring buffer with its own overflow policy and drains via polling with
//! acknowledgement. Delivery to one subscriber is FIFO by hub sequence; no
//! order is promised across subscribers. Subscribers that stop draining past
//! the stall timeout are disconnected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meridian_db::{ChangeEvent, DbListener};
use meridian_protocol::{ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// What to do when a subscriber's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
    Disconnect,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    /// Hub-assigned sequence; strictly increasing per subscriber stream.
    pub seq: u64,
    pub channel: String,
    pub payload: Value,
    pub ts: chrono::DateTime<chrono::Utc>,
}

struct Subscriber {
    id: String,
    /// Channels this subscriber receives. Empty means all.
    channels: Vec<String>,
    buffer: VecDeque<HubEvent>,
    capacity: usize,
    policy: OverflowPolicy,
    last_ack: u64,
    last_drain: Instant,
    dropped: u64,
    disconnect_reason: Option<String>,
}

impl Subscriber {
    fn matches(&self, channel: &str) -> bool {
        self.channels.is_empty() || self.channels.iter().any(|c| c == channel)
    }
}

/// Per-dispatch accounting, consumed by metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub delivered: u64,
    pub dropped: u64,
    pub disconnected: u64,
}

/// Drain result for one poll.
#[derive(Debug, Serialize)]
pub struct PollOutput {
    pub events: Vec<HubEvent>,
    pub remaining: usize,
    pub dropped: u64,
    /// Set when this drain is the subscription's last.
    pub disconnected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
}

struct ListenerSlot {
    listener: DbListener,
    channels: Vec<String>,
    pump: tokio::task::JoinHandle<()>,
}

/// The hub. One per server.
pub struct SubscriptionHub {
    seq: AtomicU64,
    default_capacity: usize,
    stall_timeout: Duration,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    listener: tokio::sync::Mutex<Option<ListenerSlot>>,
}

impl SubscriptionHub {
    pub fn new(default_capacity: usize, stall_timeout: Duration) -> Self {
        Self {
            seq: AtomicU64::new(0),
            default_capacity,
            stall_timeout,
            subscribers: Mutex::new(HashMap::new()),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a subscriber and return its id.
    pub fn subscribe(
        &self,
        channels: Vec<String>,
        capacity: Option<usize>,
        policy: OverflowPolicy,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let capacity = capacity.unwrap_or(self.default_capacity).max(1);
        let subscriber = Subscriber {
            id: id.clone(),
            channels,
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            policy,
            last_ack: 0,
            last_drain: Instant::now(),
            dropped: 0,
            disconnect_reason: None,
        };
        self.subscribers
            .lock()
            .expect("hub lock")
            .insert(id.clone(), subscriber);
        info!("subscriber {} registered ({} capacity)", id, capacity);
        id
    }

    /// Remove a subscriber. Idempotent: the second call reports a no-op.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers
            .lock()
            .expect("hub lock")
            .remove(id)
            .is_some()
    }

    /// Dispatch one event to every matching subscriber.
    pub fn dispatch(&self, channel: &str, payload: Value) -> DispatchStats {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = HubEvent {
            seq,
            channel: channel.to_string(),
            payload,
            ts: chrono::Utc::now(),
        };

        let mut stats = DispatchStats::default();
        let mut subscribers = self.subscribers.lock().expect("hub lock");

        for subscriber in subscribers.values_mut() {
            if subscriber.disconnect_reason.is_some() || !subscriber.matches(channel) {
                continue;
            }

            // Stalled consumers are disconnected rather than buffered forever.
            if subscriber.last_drain.elapsed() > self.stall_timeout {
                disconnect(subscriber, "stalled: no drain within timeout");
                stats.disconnected += 1;
                continue;
            }

            if subscriber.buffer.len() >= subscriber.capacity {
                match subscriber.policy {
                    OverflowPolicy::DropOldest => {
                        subscriber.buffer.pop_front();
                        subscriber.dropped += 1;
                        stats.dropped += 1;
                        subscriber.buffer.push_back(event.clone());
                        stats.delivered += 1;
                    }
                    OverflowPolicy::DropNewest => {
                        subscriber.dropped += 1;
                        stats.dropped += 1;
                    }
                    OverflowPolicy::Disconnect => {
                        disconnect(subscriber, "buffer overflow");
                        stats.disconnected += 1;
                    }
                }
            } else {
                subscriber.buffer.push_back(event.clone());
                stats.delivered += 1;
            }
        }

        stats
    }

    /// Drain up to `max` buffered events. `ack` acknowledges previously
    /// delivered sequences, dropping any still-buffered duplicates.
    pub fn poll(&self, id: &str, max: usize, ack: Option<u64>) -> ToolResult<PollOutput> {
        let mut subscribers = self.subscribers.lock().expect("hub lock");
        let subscriber = subscribers
            .get_mut(id)
            .ok_or_else(|| ToolError::not_found(format!("no such subscription: {id}")))?;

        subscriber.last_drain = Instant::now();
        if let Some(ack) = ack {
            subscriber.last_ack = subscriber.last_ack.max(ack);
            let ack = subscriber.last_ack;
            subscriber.buffer.retain(|e| e.seq > ack);
        }

        let mut events = Vec::with_capacity(max.min(subscriber.buffer.len()));
        while events.len() < max {
            match subscriber.buffer.pop_front() {
                Some(event) => events.push(event),
                None => break,
            }
        }

        let disconnected = subscriber.disconnect_reason.is_some() && subscriber.buffer.is_empty();
        let output = PollOutput {
            remaining: subscriber.buffer.len(),
            dropped: subscriber.dropped,
            disconnect_reason: subscriber.disconnect_reason.clone(),
            disconnected,
            events,
        };

        if disconnected {
            let id = subscriber.id.clone();
            subscribers.remove(&id);
        }

        Ok(output)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("hub lock").len()
    }

    /// Attach (or widen) the database listener feeding this hub. The pump
    /// task forwards listener events into `dispatch`.
    pub async fn ensure_listener(
        hub: &Arc<Self>,
        pool: sqlx::postgres::PgPool,
        channels: &[String],
    ) -> ToolResult<()> {
        let this = hub;
        let mut slot = this.listener.lock().await;

        let need_new = match slot.as_ref() {
            None => true,
            Some(existing) => channels.iter().any(|c| !existing.channels.contains(c)),
        };
        if !need_new {
            return Ok(());
        }

        let mut union: Vec<String> = slot
            .as_ref()
            .map(|s| s.channels.clone())
            .unwrap_or_default();
        for channel in channels {
            if !union.contains(channel) {
                union.push(channel.clone());
            }
        }

        if let Some(old) = slot.take() {
            old.pump.abort();
            old.listener.shutdown().await;
        }

        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(256);
        let listener = DbListener::spawn(pool, union.clone(), tx)
            .await
            .map_err(ToolError::from)?;

        let pump_hub = Arc::clone(this);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let payload = json!({
                    "source_seq": event.seq,
                    "payload": event.payload,
                    "received_at": event.received_at,
                });
                pump_hub.dispatch(&event.channel, payload);
            }
        });

        *slot = Some(ListenerSlot {
            listener,
            channels: union,
            pump,
        });
        Ok(())
    }

    /// Close every subscription with a final event and stop the listener.
    pub async fn shutdown(&self) {
        {
            let mut subscribers = self.subscribers.lock().expect("hub lock");
            for subscriber in subscribers.values_mut() {
                if subscriber.disconnect_reason.is_none() {
                    disconnect(subscriber, "server shutting down");
                }
            }
        }
        if let Some(slot) = self.listener.lock().await.take() {
            slot.pump.abort();
            slot.listener.shutdown().await;
        }
    }
}

fn disconnect(subscriber: &mut Subscriber, reason: &str) {
    warn!("subscriber {} disconnected: {}", subscriber.id, reason);
    subscriber.disconnect_reason = Some(reason.to_string());
    // The final event rides the buffer regardless of capacity.
    subscriber.buffer.push_back(HubEvent {
        seq: u64::MAX,
        channel: "_system".to_string(),
        payload: json!({ "type": "disconnected", "reason": reason }),
        ts: chrono::Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> SubscriptionHub {
        SubscriptionHub::new(1024, Duration::from_secs(300))
    }

    #[test]
    fn test_fifo_delivery() {
        let hub = hub();
        let id = hub.subscribe(vec!["orders".into()], None, OverflowPolicy::DropOldest);

        for i in 0..5 {
            hub.dispatch("orders", json!({ "n": i }));
        }

        let out = hub.poll(&id, 10, None).unwrap();
        assert_eq!(out.events.len(), 5);
        for window in out.events.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
        assert_eq!(out.events[0].payload["n"], 0);
        assert_eq!(out.events[4].payload["n"], 4);
    }

    #[test]
    fn test_channel_filter() {
        let hub = hub();
        let orders = hub.subscribe(vec!["orders".into()], None, OverflowPolicy::DropOldest);
        let all = hub.subscribe(vec![], None, OverflowPolicy::DropOldest);

        hub.dispatch("orders", json!(1));
        hub.dispatch("users", json!(2));

        assert_eq!(hub.poll(&orders, 10, None).unwrap().events.len(), 1);
        assert_eq!(hub.poll(&all, 10, None).unwrap().events.len(), 2);
    }

    #[test]
    fn test_overflow_drop_oldest() {
        let hub = hub();
        let id = hub.subscribe(vec![], Some(2), OverflowPolicy::DropOldest);

        for i in 1..=4 {
            hub.dispatch("c", json!({ "n": i }));
        }

        let out = hub.poll(&id, 10, None).unwrap();
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].payload["n"], 3);
        assert_eq!(out.events[1].payload["n"], 4);
        assert_eq!(out.dropped, 2);

        // Stalls afterwards: nothing buffered.
        let out = hub.poll(&id, 10, None).unwrap();
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_overflow_drop_newest() {
        let hub = hub();
        let id = hub.subscribe(vec![], Some(2), OverflowPolicy::DropNewest);

        for i in 1..=4 {
            hub.dispatch("c", json!({ "n": i }));
        }

        let out = hub.poll(&id, 10, None).unwrap();
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].payload["n"], 1);
        assert_eq!(out.events[1].payload["n"], 2);
    }

    #[test]
    fn test_overflow_disconnect() {
        let hub = hub();
        let id = hub.subscribe(vec![], Some(1), OverflowPolicy::Disconnect);

        hub.dispatch("c", json!(1));
        hub.dispatch("c", json!(2));

        let out = hub.poll(&id, 10, None).unwrap();
        // Buffered event plus the final system event.
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[1].payload["type"], "disconnected");
        assert!(out.disconnected);

        // Subscription is gone.
        assert!(hub.poll(&id, 10, None).is_err());
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let hub = hub();
        let id = hub.subscribe(vec![], None, OverflowPolicy::DropOldest);

        assert!(hub.unsubscribe(&id));
        assert!(!hub.unsubscribe(&id));
    }

    #[test]
    fn test_ack_drops_delivered_duplicates() {
        let hub = hub();
        let id = hub.subscribe(vec![], None, OverflowPolicy::DropOldest);

        hub.dispatch("c", json!(1));
        hub.dispatch("c", json!(2));
        let out = hub.poll(&id, 1, None).unwrap();
        let first_seq = out.events[0].seq;

        hub.dispatch("c", json!(3));
        let out = hub.poll(&id, 10, Some(first_seq)).unwrap();
        assert_eq!(out.events.len(), 2);
        assert!(out.events.iter().all(|e| e.seq > first_seq));
    }

    #[test]
    fn test_stall_disconnect() {
        let hub = SubscriptionHub::new(16, Duration::from_millis(5));
        let id = hub.subscribe(vec![], None, OverflowPolicy::DropOldest);

        std::thread::sleep(Duration::from_millis(10));
        let stats = hub.dispatch("c", json!(1));
        assert_eq!(stats.disconnected, 1);

        let out = hub.poll(&id, 10, None).unwrap();
        assert!(out.disconnected);
        assert_eq!(out.events.last().unwrap().payload["type"], "disconnected");
    }
}
