//! Operator command queue poller.
//!
//! Commands are inserted externally (dashboard, API) with `status='queued'`.
//! Each tick drains the oldest batch: publish to the device's command topic,
//! then flip the row to `sent`. The commit happens after the publish, so a
//! broker failure leaves the command queued for the next tick. Delivery is
//! at-least-once and devices treat repeats as idempotent.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TopicConfig;
use crate::mqtt::Publisher;
use crate::store::{QueuedCommand, RecordStore};

pub struct CommandPoller {
    store: Arc<dyn RecordStore>,
    publisher: Arc<dyn Publisher>,
    topics: TopicConfig,
    poll_interval: Duration,
    batch_limit: i64,
}

impl CommandPoller {
    pub fn new(
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn Publisher>,
        topics: TopicConfig,
        poll_interval: Duration,
        batch_limit: i64,
    ) -> Self {
        Self {
            store,
            publisher,
            topics,
            poll_interval,
            batch_limit,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval = ?self.poll_interval, "command poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.poll_once().await,
            }
        }
        info!("command poller stopped");
    }

    /// Drain one batch of queued commands.
    pub async fn poll_once(&self) {
        let commands = match self.store.fetch_queued_commands(self.batch_limit).await {
            Ok(commands) => commands,
            Err(e) => {
                warn!(error = %e, "command fetch failed");
                return;
            }
        };

        for command in commands {
            let topic = self.topics.cmd_topic(&command.hw_id);
            let payload = encode_command(&command);

            if let Err(e) = self.publisher.publish_json(&topic, &payload).await {
                // Still queued; retried on the next tick.
                warn!(
                    command = %command.command_id,
                    device = %command.hw_id,
                    error = %e,
                    "command publish failed, left queued"
                );
                return;
            }

            metrics::counter!("worker.commands.sent").increment(1);
            debug!(
                command = %command.command_id,
                device = %command.hw_id,
                kind = %command.command_type,
                "command dispatched"
            );

            if let Err(e) = self.store.mark_command_sent(command.command_id, Utc::now()).await {
                // The publish went out; the flip retries next tick and the
                // device absorbs the duplicate.
                warn!(command = %command.command_id, error = %e, "mark sent failed");
            }
        }
    }
}

/// Render a queued command into the JSON shape the firmware expects.
fn encode_command(command: &QueuedCommand) -> serde_json::Value {
    let mut payload = serde_json::Map::new();
    payload.insert("device_id".into(), command.hw_id.clone().into());
    match command.command_type.as_str() {
        "capture_image" => {
            payload.insert("capture_image".into(), true.into());
        }
        other => {
            // next_wake, send_image and future command types carry their
            // payload under the type key.
            payload.insert(other.into(), command.payload.clone());
        }
    }
    serde_json::Value::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeviceSchedule;
    use crate::testing::{CapturingPublisher, MemoryRecordStore};
    use serde_json::json;

    const HW: &str = "AABBCCDDEEFF";

    fn poller(
        store: Arc<MemoryRecordStore>,
        publisher: Arc<CapturingPublisher>,
    ) -> CommandPoller {
        CommandPoller::new(
            store,
            publisher,
            TopicConfig::default(),
            Duration::from_secs(2),
            16,
        )
    }

    #[tokio::test]
    async fn test_queued_command_is_published_then_marked_sent() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        let command_id = store.seed_command(device_id, "capture_image", json!({}));
        let publisher = Arc::new(CapturingPublisher::new());

        poller(store.clone(), publisher.clone()).poll_once().await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "DEVICE/AABBCCDDEEFF/cmd");
        assert_eq!(
            published[0].1,
            json!({ "device_id": HW, "capture_image": true })
        );
        assert_eq!(store.command_status(command_id).as_deref(), Some("sent"));
    }

    #[tokio::test]
    async fn test_send_image_payload_shape() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        store.seed_command(device_id, "send_image", json!("image_42.jpg"));
        let publisher = Arc::new(CapturingPublisher::new());

        poller(store.clone(), publisher.clone()).poll_once().await;

        let published = publisher.published();
        assert_eq!(
            published[0].1,
            json!({ "device_id": HW, "send_image": "image_42.jpg" })
        );
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_command_queued() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        let command_id = store.seed_command(device_id, "capture_image", json!({}));
        let publisher = Arc::new(CapturingPublisher::new());
        publisher.fail_publishes(true);

        let poller = poller(store.clone(), publisher.clone());
        poller.poll_once().await;
        assert_eq!(store.command_status(command_id).as_deref(), Some("queued"));

        // Broker back: the next tick delivers it exactly once more.
        publisher.fail_publishes(false);
        poller.poll_once().await;
        assert_eq!(store.command_status(command_id).as_deref(), Some("sent"));
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_sent_command_is_not_resent() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        store.seed_command(device_id, "capture_image", json!({}));
        let publisher = Arc::new(CapturingPublisher::new());

        let poller = poller(store.clone(), publisher.clone());
        poller.poll_once().await;
        poller.poll_once().await;

        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_commands_dispatch_oldest_first() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        store.seed_command(device_id, "capture_image", json!({}));
        store.seed_command(device_id, "send_image", json!("image_1.jpg"));
        let publisher = Arc::new(CapturingPublisher::new());

        poller(store.clone(), publisher.clone()).poll_once().await;

        let published = publisher.published();
        assert_eq!(published.len(), 2);
        assert!(published[0].1.get("capture_image").is_some());
        assert!(published[1].1.get("send_image").is_some());
    }
}
