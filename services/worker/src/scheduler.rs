//! Status-message handshake: decide capture-now vs sleep-until-T.
//!
//! Every status heartbeat gets exactly one command in reply. A device is due
//! when it has no scheduled wake or the wake time has passed (allowing the
//! configured early-wake window); otherwise it is told when to come back.
//! The `next_wake_at` write commits before the capture command goes out, so
//! a persistence failure can never produce a double capture.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{SchedulerConfig, TopicConfig};
use crate::errors::ErrorCode;
use crate::messages::{command_capture, command_next_wake, StatusMessage};
use crate::mqtt::Publisher;
use crate::store::{NewDeviceStatus, RecordStore};

pub struct Scheduler {
    store: Arc<dyn RecordStore>,
    publisher: Arc<dyn Publisher>,
    topics: TopicConfig,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn Publisher>,
        topics: TopicConfig,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            topics,
            config,
        }
    }

    /// Handle one status heartbeat, replying with exactly one command.
    pub async fn on_status(&self, hw_id: &str, msg: &StatusMessage, raw: &Value) {
        let device = match self.store.resolve_device(hw_id).await {
            Ok(device) => device,
            Err(e) => {
                warn!(device = %hw_id, error = %e, "device lookup failed, no command sent");
                return;
            }
        };

        let cmd_topic = self.topics.cmd_topic(hw_id);

        let Some(device) = device else {
            // Not provisioned: note it and put the device to sleep for a
            // long default so it stops burning battery on retries.
            warn!(device = %hw_id, "status from unknown device");
            let _ = self
                .store
                .insert_error(
                    None,
                    None,
                    ErrorCode::UnknownDevice,
                    "status from unprovisioned device",
                    serde_json::json!({ "hw_id": hw_id }),
                )
                .await;
            let sleep_until =
                Utc::now() + ChronoDuration::hours(self.config.unknown_device_sleep_hours);
            self.publish(&cmd_topic, &command_next_wake(hw_id, sleep_until)).await;
            return;
        };

        let status_row = NewDeviceStatus {
            status: msg.status.clone().unwrap_or_else(|| "unknown".to_string()),
            pending_images: msg.pending_images,
            battery_mv: msg.battery_mv,
            wifi_rssi: msg.wifi_rssi,
            uptime_ms: msg.uptime_ms,
            boot_count: msg.boot_count,
            raw: raw.clone(),
        };
        if let Err(e) = self.store.insert_device_status(device.device_id, &status_row).await {
            warn!(device = %hw_id, error = %e, "status insert failed");
        }

        let now = Utc::now();
        let interval = if device.schedule.test_mode {
            ChronoDuration::minutes(device.schedule.test_interval_minutes as i64)
        } else {
            ChronoDuration::hours(device.schedule.capture_interval_hours as i64)
        };
        let window = ChronoDuration::seconds(device.schedule.wakeup_window_sec as i64);
        let due = device.next_wake_at.map_or(true, |wake_at| now + window >= wake_at);

        if due {
            let next_wake = now + interval;
            if let Err(e) = self.store.update_next_wake(device.device_id, next_wake).await {
                // Without the committed schedule the device could be told to
                // capture twice; stay silent and let the next heartbeat retry.
                warn!(device = %hw_id, error = %e, "next wake update failed, no command sent");
                return;
            }
            info!(device = %hw_id, next_wake = %next_wake, "device due, requesting capture");
            metrics::counter!("worker.handshake.capture").increment(1);
            self.publish(&cmd_topic, &command_capture(hw_id)).await;
        } else {
            let wake_at = device.next_wake_at.unwrap();
            info!(device = %hw_id, wake_at = %wake_at, "device not due, sending sleep");
            metrics::counter!("worker.handshake.sleep").increment(1);
            self.publish(&cmd_topic, &command_next_wake(hw_id, wake_at)).await;
        }
    }

    async fn publish(&self, topic: &str, payload: &Value) {
        if let Err(e) = self.publisher.publish_json(topic, payload).await {
            warn!(topic = %topic, error = %e, "command publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeviceSchedule;
    use crate::testing::{CapturingPublisher, MemoryRecordStore};
    use serde_json::json;

    const HW: &str = "AABBCCDDEEFF";

    fn status_msg() -> StatusMessage {
        serde_json::from_value(json!({ "device_id": HW, "status": "alive", "pendingImg": 0 }))
            .unwrap()
    }

    fn scheduler(
        store: Arc<MemoryRecordStore>,
        publisher: Arc<CapturingPublisher>,
    ) -> Scheduler {
        Scheduler::new(
            store,
            publisher,
            TopicConfig::default(),
            SchedulerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_due_device_gets_capture_command() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(
            HW,
            DeviceSchedule {
                test_mode: true,
                test_interval_minutes: 5,
                ..Default::default()
            },
            None,
        );
        let publisher = Arc::new(CapturingPublisher::new());
        let scheduler = scheduler(store.clone(), publisher.clone());

        scheduler.on_status(HW, &status_msg(), &json!({})).await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let (topic, payload) = &published[0];
        assert_eq!(topic, "DEVICE/AABBCCDDEEFF/cmd");
        assert_eq!(*payload, json!({ "device_id": HW, "capture_image": true }));

        // next_wake_at persisted ~5 minutes out.
        let wake = store.next_wake(device_id).unwrap();
        let delta = wake - Utc::now();
        assert!(delta > ChronoDuration::minutes(4) && delta <= ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn test_not_due_device_gets_sleep_command() {
        let store = Arc::new(MemoryRecordStore::new());
        let wake_at = Utc::now() + ChronoDuration::minutes(2);
        let device_id = store.seed_device(HW, DeviceSchedule::default(), Some(wake_at));
        let publisher = Arc::new(CapturingPublisher::new());
        let scheduler = scheduler(store.clone(), publisher.clone());

        scheduler.on_status(HW, &status_msg(), &json!({})).await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let (_, payload) = &published[0];
        assert_eq!(
            payload["next_wake"],
            json!(crate::messages::format_next_wake(wake_at))
        );
        // Not mutated.
        assert_eq!(store.next_wake(device_id), Some(wake_at));
    }

    #[tokio::test]
    async fn test_unknown_device_gets_default_sleep() {
        let store = Arc::new(MemoryRecordStore::new());
        let publisher = Arc::new(CapturingPublisher::new());
        let scheduler = scheduler(store.clone(), publisher.clone());

        scheduler.on_status(HW, &status_msg(), &json!({})).await;

        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.get("next_wake").is_some());
        assert!(store.has_error(ErrorCode::UnknownDevice));
    }

    #[tokio::test]
    async fn test_no_command_when_wake_persist_fails() {
        let store = Arc::new(MemoryRecordStore::new());
        store.seed_device(HW, DeviceSchedule::default(), None);
        store.fail_writes(true);
        let publisher = Arc::new(CapturingPublisher::new());
        let scheduler = scheduler(store.clone(), publisher.clone());

        scheduler.on_status(HW, &status_msg(), &json!({})).await;

        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_status_row_recorded() {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        let publisher = Arc::new(CapturingPublisher::new());
        let scheduler = scheduler(store.clone(), publisher.clone());

        let msg: StatusMessage = serde_json::from_value(json!({
            "device_id": HW,
            "status": "alive",
            "pendingImg": 3,
            "battery_mv": 3700,
            "wifi_rssi": -61
        }))
        .unwrap();
        scheduler.on_status(HW, &msg, &json!({ "status": "alive" })).await;

        let statuses = store.statuses(device_id);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, "alive");
        assert_eq!(statuses[0].pending_images, Some(3));
        assert_eq!(statuses[0].battery_mv, Some(3700));
    }
}
