//! Postgres LISTEN wrapper feeding the subscription hub.
//!
//! One listener task per connection. Listener errors reconnect with capped
//! exponential backoff; the sequence counter survives reconnects so
//! downstream buffers stay gap-free from the subscriber's point of view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::error::Result;

/// A change notification with a monotonically increasing sequence number.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub channel: String,
    /// Parsed JSON payload when the notification body is JSON, else a string.
    pub payload: Value,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

/// Handle to a running listener task.
pub struct DbListener {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
    seq: Arc<AtomicU64>,
}

impl DbListener {
    /// Spawn a listener on `channels`, forwarding events into `events`.
    pub async fn spawn(
        pool: PgPool,
        channels: Vec<String>,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self> {
        let (stop, stop_rx) = watch::channel(false);
        let seq = Arc::new(AtomicU64::new(0));
        let seq_task = Arc::clone(&seq);

        // Connect once up front so a bad channel list fails the subscribe
        // call instead of an orphan task.
        let listener = connect(&pool, &channels).await?;

        let handle = tokio::spawn(run_loop(
            pool, channels, listener, events, stop_rx, seq_task,
        ));

        Ok(Self { stop, handle, seq })
    }

    /// Last sequence number handed out.
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Stop the listener task.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

async fn connect(pool: &PgPool, channels: &[String]) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    for channel in channels {
        listener.listen(channel).await?;
    }
    Ok(listener)
}

async fn run_loop(
    pool: PgPool,
    channels: Vec<String>,
    mut listener: PgListener,
    events: mpsc::Sender<ChangeEvent>,
    mut stop: watch::Receiver<bool>,
    seq: Arc<AtomicU64>,
) {
    let mut backoff = Duration::from_millis(250);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                info!("listener stopping");
                return;
            }
            received = listener.recv() => {
                match received {
                    Ok(notification) => {
                        backoff = Duration::from_millis(250);
                        let payload_text = notification.payload();
                        let payload = serde_json::from_str::<Value>(payload_text)
                            .unwrap_or_else(|_| Value::String(payload_text.to_string()));
                        let event = ChangeEvent {
                            seq: seq.fetch_add(1, Ordering::Relaxed) + 1,
                            channel: notification.channel().to_string(),
                            payload,
                            received_at: chrono::Utc::now(),
                        };
                        if events.send(event).await.is_err() {
                            // Hub dropped its receiver; nothing left to feed.
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("listener error: {}; reconnecting in {:?}", err, backoff);
                        tokio::select! {
                            _ = stop.changed() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        match connect(&pool, &channels).await {
                            Ok(reconnected) => {
                                listener = reconnected;
                                info!("listener reconnected on {} channel(s)", channels.len());
                            }
                            Err(err) => {
                                warn!("listener reconnect failed: {}", err);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_serializes() {
        let event = ChangeEvent {
            seq: 7,
            channel: "orders".into(),
            payload: serde_json::json!({"op": "INSERT"}),
            received_at: chrono::Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["channel"], "orders");
        assert_eq!(value["payload"]["op"], "INSERT");
    }
}
