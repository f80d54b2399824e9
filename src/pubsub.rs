//! Named-channel publish/subscribe hub and the deduplicating status publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const ERROR_LOG_CHANNEL: &str = "ERROR_LOG";

const CHANNEL_CAPACITY: usize = 64;

/// In-process pub/sub keyed by channel name
#[derive(Default)]
pub struct Hub {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Returns the number of subscribers that received the payload
    pub fn publish(&self, channel: &str, payload: Value) -> usize {
        self.sender(channel).send(payload).unwrap_or(0)
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.sender(channel).subscribe()
    }
}

/// Publishes a status on its channel only when its serialized form changed
#[derive(Clone)]
pub struct StatusPublisher {
    hub: Arc<Hub>,
    channel: &'static str,
}

impl StatusPublisher {
    pub fn new(hub: Arc<Hub>, channel: &'static str) -> Self {
        Self { hub, channel }
    }

    pub fn channel(&self) -> &'static str {
        self.channel
    }

    /// Compare full-value serializations; publish `next` once if they differ
    pub fn publish_if_changed<T: Serialize>(&self, prev: &T, next: &T) -> bool {
        let (prev_json, next_json) = match (serde_json::to_value(prev), serde_json::to_value(next))
        {
            (Ok(p), Ok(n)) => (p, n),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to serialize status for {}: {}", self.channel, e);
                return false;
            }
        };

        if prev_json == next_json {
            return false;
        }

        let receivers = self.hub.publish(self.channel, next_json);
        tracing::debug!("Published {} to {} subscriber(s)", self.channel, receivers);
        true
    }

    /// Report a failed operation on the shared error-log channel
    pub fn publish_error(&self, source: &str, message: &str) {
        self.hub.publish(
            ERROR_LOG_CHANNEL,
            serde_json::json!({
                "source": source,
                "message": message,
                "timestamp": chrono::Utc::now().timestamp(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AvrStatus;

    #[tokio::test]
    async fn test_publish_only_on_change() {
        let hub = Arc::new(Hub::new());
        let mut rx = hub.subscribe("AVR_STATUS_CHANGED");
        let publisher = StatusPublisher::new(hub.clone(), "AVR_STATUS_CHANGED");

        let off = AvrStatus::powered_off();
        let on = AvrStatus {
            is_powered_on: true,
            volume: 40.0,
            ..AvrStatus::default()
        };

        assert!(!publisher.publish_if_changed(&off, &off));
        assert!(publisher.publish_if_changed(&off, &on));
        assert!(!publisher.publish_if_changed(&on, &on.clone()));

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["is_powered_on"], true);
        assert_eq!(msg["volume"], 40.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = Hub::new();
        assert_eq!(hub.publish("NOBODY", serde_json::json!({"a": 1})), 0);
    }

    #[tokio::test]
    async fn test_error_channel() {
        let hub = Arc::new(Hub::new());
        let mut rx = hub.subscribe(ERROR_LOG_CHANNEL);
        let publisher = StatusPublisher::new(hub, "TV_STATUS_CHANGED");
        publisher.publish_error("tv", "command failed");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["source"], "tv");
    }
}
