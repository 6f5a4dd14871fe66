//! End-to-end ingestion scenarios driven through the router with in-memory
//! store, blob and publisher fakes. Time is paused, so the retransmit and
//! reaper timers run in simulated time.

use fieldcam_worker::store::DeviceSchedule;
use fieldcam_worker::testing::{CapturingPublisher, MemoryBlobStore, MemoryRecordStore};
use fieldcam_worker::{
    AuditSink, CommandPoller, Config, DeviceRegistry, ErrorCode, Reaper, Router, WorkerCtx,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HW: &str = "AABBCCDDEEFF";

struct Harness {
    store: Arc<MemoryRecordStore>,
    blob: Arc<MemoryBlobStore>,
    publisher: Arc<CapturingPublisher>,
    router: Router,
    cancel: CancellationToken,
}

fn test_config() -> Config {
    serde_json::from_value(json!({
        "mqtt": { "host": "localhost" },
        "database": { "url": "postgres://localhost/test" },
        "storage": { "bucket": "test-captures" }
    }))
    .unwrap()
}

fn harness() -> Harness {
    let config = Arc::new(test_config());
    let store = Arc::new(MemoryRecordStore::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let publisher = Arc::new(CapturingPublisher::new());
    let cancel = CancellationToken::new();

    let ctx = WorkerCtx::new(config.clone(), store.clone(), blob.clone(), publisher.clone());
    let registry = DeviceRegistry::new(ctx, cancel.clone());
    let audit = AuditSink::spawn(store.clone(), config.database.audit_queue_depth);
    let router = Router::new(config.topics.clone(), registry.clone(), audit, store.clone());

    tokio::spawn(Reaper::new(registry, config.reaper_interval()).run(cancel.clone()));

    Harness {
        store,
        blob,
        publisher,
        router,
        cancel,
    }
}

impl Harness {
    fn publish(&self, topic: &str, payload: Value) {
        self.router
            .handle_publish(topic, &serde_json::to_vec(&payload).unwrap());
    }

    fn metadata(&self, overrides: Value) {
        let mut payload = json!({
            "device_id": HW,
            "capture_timeStamp": "2025-10-04T12:34:56Z",
            "image_name": "a.jpg",
            "image_size": 4,
            "max_chunks_size": 1024,
            "total_chunk_count": 2,
            "location": "greenhouse_4",
            "error": 0
        });
        merge(&mut payload, overrides);
        self.publish(&format!("DEVICE/{HW}/data"), payload);
    }

    fn chunk(&self, name: &str, chunk_id: i64, b64: &str) {
        self.publish(
            &format!("DEVICE/{HW}/data"),
            json!({
                "device_id": HW,
                "image_name": name,
                "chunk_id": chunk_id,
                "max_chunk_size": 1024,
                "payload": b64
            }),
        );
    }

    fn nacks(&self) -> Vec<Value> {
        self.publisher
            .to_topic(&format!("DEVICE/{HW}/ack"))
            .into_iter()
            .filter(|m| m.get("missing_chunks").is_some())
            .collect()
    }

    fn acks(&self) -> Vec<Value> {
        self.publisher
            .to_topic(&format!("DEVICE/{HW}/ack"))
            .into_iter()
            .filter(|m| m.get("ACK_OK").is_some())
            .collect()
    }
}

fn merge(base: &mut Value, overrides: Value) {
    if let (Some(base), Some(overrides)) = (base.as_object_mut(), overrides.as_object()) {
        for (k, v) in overrides {
            base.insert(k.clone(), v.clone());
        }
    }
}

/// Poll `condition` while simulated time advances in `step` increments.
async fn wait_until<F: Fn() -> bool>(step: Duration, tries: usize, what: &str, condition: F) {
    for _ in 0..tries {
        if condition() {
            return;
        }
        tokio::time::sleep(step).await;
    }
    panic!("timed out waiting for {what}");
}

// SOI marker 0xFF 0xD8 and EOI marker 0xFF 0xD9.
const CHUNK_SOI: &str = "/9g=";
const CHUNK_EOI: &str = "/9k=";

#[tokio::test(start_paused = true)]
async fn happy_path_stores_blob_and_acks() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({ "temperature": 25.1 }));
    h.chunk("a.jpg", 0, CHUNK_SOI);
    h.chunk("a.jpg", 1, CHUNK_EOI);

    wait_until(Duration::from_millis(10), 500, "capture success", || {
        h.store.capture("a.jpg").map(|c| c.status) == Some("success".into())
    })
    .await;

    let capture = h.store.capture("a.jpg").unwrap();
    let path = capture.storage_path.clone().unwrap();
    assert!(path.starts_with(&format!("captures/{HW}/")));
    assert!(path.ends_with("/a.jpg"));
    assert_eq!(capture.image_url.as_deref(), Some(&*format!("memory://{path}")));
    assert_eq!(capture.image_size, Some(4));
    assert_eq!(capture.sensor_data["temperature_c"], json!(25.1));

    // Blob bytes, journal and hash all agree.
    let blob = h.blob.object(&path).unwrap();
    assert_eq!(blob, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    let journaled: Vec<u8> = capture.chunks.values().flatten().copied().collect();
    assert_eq!(journaled, blob);
    assert_eq!(capture.chunks.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(capture.image_sha256.unwrap(), hex::encode(Sha256::digest(&blob)));

    assert_eq!(h.acks().len(), 1);
    assert_eq!(h.acks()[0]["image_name"], "a.jpg");
    assert!(h.nacks().is_empty());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn duplicate_messages_are_idempotent() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({ "temperature": 25.1 }));
    h.metadata(json!({ "temperature": null, "image_size": null }));
    h.chunk("a.jpg", 0, CHUNK_SOI);
    h.chunk("a.jpg", 0, CHUNK_SOI);
    h.chunk("a.jpg", 1, CHUNK_EOI);

    wait_until(Duration::from_millis(10), 500, "capture success", || {
        h.store.capture("a.jpg").map(|c| c.status) == Some("success".into())
    })
    .await;

    let capture = h.store.capture("a.jpg").unwrap();
    // Sticky first non-null: the nulled retransmission changed nothing.
    assert_eq!(capture.sensor_data["temperature_c"], json!(25.1));
    assert_eq!(capture.image_size, Some(4));
    assert_eq!(capture.chunks.len(), 2);
    let path = capture.storage_path.unwrap();
    assert_eq!(h.blob.object(&path).unwrap(), vec![0xFF, 0xD8, 0xFF, 0xD9]);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn chunks_before_metadata_complete_on_late_count() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.chunk("a.jpg", 1, CHUNK_EOI);
    h.chunk("a.jpg", 0, CHUNK_SOI);

    // Nothing can complete or NACK until the count is known.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.store.capture("a.jpg").unwrap().status, "assembling");
    assert!(h.nacks().is_empty());

    h.metadata(json!({}));
    wait_until(Duration::from_millis(10), 500, "capture success", || {
        h.store.capture("a.jpg").map(|c| c.status) == Some("success".into())
    })
    .await;

    // Pre-metadata chunks were journaled once the count landed.
    let capture = h.store.capture("a.jpg").unwrap();
    assert_eq!(capture.chunks.keys().copied().collect::<Vec<_>>(), vec![0, 1]);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn missing_chunk_triggers_nack_then_completes() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({}));
    h.chunk("a.jpg", 0, CHUNK_SOI);

    wait_until(Duration::from_millis(500), 100, "NACK", || !h.nacks().is_empty()).await;

    let nack = &h.nacks()[0];
    assert_eq!(nack["image_name"], "a.jpg");
    assert_eq!(nack["missing_chunks"], json!([1]));

    // Device answers the NACK; the capture completes as usual.
    h.chunk("a.jpg", 1, CHUNK_EOI);
    wait_until(Duration::from_millis(10), 500, "capture success", || {
        h.store.capture("a.jpg").map(|c| c.status) == Some("success".into())
    })
    .await;

    assert_eq!(h.nacks().len(), 1);
    assert_eq!(h.acks().len(), 1);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn exhausted_retransmit_budget_fails_capture() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({ "total_chunk_count": 3 }));
    h.chunk("a.jpg", 0, CHUNK_SOI);

    wait_until(Duration::from_millis(500), 200, "capture failed", || {
        h.store.capture("a.jpg").map(|c| c.status) == Some("failed".into())
    })
    .await;

    assert_eq!(h.nacks().len(), 3);
    assert!(h.store.has_error(ErrorCode::AssemblyRetransmitExhausted));
    assert!(h.acks().is_empty());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn metadata_only_capture_times_out() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({ "total_chunk_count": 10, "image_size": 10240 }));

    wait_until(Duration::from_secs(15), 60, "capture failed", || {
        h.store.capture("a.jpg").map(|c| c.status) == Some("failed".into())
    })
    .await;

    assert!(h.store.has_error(ErrorCode::AssemblyTimeout));
    // A device that never started sending is not NACKed.
    assert!(h.nacks().is_empty());
    assert_eq!(h.blob.object_count(), 0);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn invalid_jpeg_fails_without_upload() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({ "image_name": "bad.jpg", "total_chunk_count": 1 }));
    // Decodes to 00 01 02 03: no JPEG markers.
    h.chunk("bad.jpg", 0, "AAECAw==");

    wait_until(Duration::from_millis(10), 500, "capture failed", || {
        h.store.capture("bad.jpg").map(|c| c.status) == Some("failed".into())
    })
    .await;

    assert!(h.store.has_error(ErrorCode::JpegInvalid));
    assert_eq!(h.blob.object_count(), 0);
    assert!(h.store.capture("bad.jpg").unwrap().image_url.is_none());
    assert!(h.acks().is_empty());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn handshake_due_and_not_due() {
    let h = harness();
    let device_id = h.store.seed_device(
        HW,
        DeviceSchedule {
            test_mode: true,
            test_interval_minutes: 5,
            ..Default::default()
        },
        None,
    );

    let status = json!({ "device_id": HW, "status": "alive", "pendingImg": 1 });
    h.publish(&format!("DEVICE/{HW}/status"), status.clone());

    let cmd_topic = format!("DEVICE/{HW}/cmd");
    wait_until(Duration::from_millis(10), 500, "capture command", || {
        !h.publisher.to_topic(&cmd_topic).is_empty()
    })
    .await;

    let commands = h.publisher.to_topic(&cmd_topic);
    assert_eq!(commands[0], json!({ "device_id": HW, "capture_image": true }));
    let wake = h.store.next_wake(device_id).expect("next wake persisted");

    // Second heartbeat while the wake is in the future: sleep command with
    // the unchanged timestamp.
    h.publish(&format!("DEVICE/{HW}/status"), status);
    wait_until(Duration::from_millis(10), 500, "sleep command", || {
        h.publisher.to_topic(&cmd_topic).len() == 2
    })
    .await;

    let commands = h.publisher.to_topic(&cmd_topic);
    assert_eq!(
        commands[1],
        json!({
            "device_id": HW,
            "next_wake": fieldcam_worker::messages::format_next_wake(wake)
        })
    );
    assert_eq!(h.store.next_wake(device_id), Some(wake));

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn device_ack_resolves_command() {
    let h = harness();
    let device_id = h.store.seed_device(HW, DeviceSchedule::default(), None);
    let command_id = h.store.seed_command(device_id, "capture_image", json!({}));

    // Dispatch through the poller, then ack from the device side.
    let config = test_config();
    let poller = CommandPoller::new(
        h.store.clone(),
        h.publisher.clone(),
        config.topics.clone(),
        config.command_poll_interval(),
        config.commands.batch_limit,
    );
    poller.poll_once().await;
    assert_eq!(h.store.command_status(command_id).as_deref(), Some("sent"));

    h.publish(
        &format!("DEVICE/{HW}/ack"),
        json!({ "command_id": command_id.to_string(), "result": "ok" }),
    );

    wait_until(Duration::from_millis(10), 500, "command acknowledged", || {
        h.store.command_status(command_id).as_deref() == Some("acknowledged")
    })
    .await;

    // An ack for an unknown command is logged and dropped.
    h.publish(
        &format!("DEVICE/{HW}/ack"),
        json!({ "command_id": Uuid::new_v4().to_string() }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.command_status(command_id).as_deref(), Some("acknowledged"));

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn malformed_topic_and_payload_are_reported() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    // Lowercase hardware id.
    h.publish("DEVICE/aabbccddeeff/data", json!({ "image_name": "a.jpg" }));
    wait_until(Duration::from_millis(10), 500, "BAD_TOPIC error", || {
        h.store.has_error(ErrorCode::BadTopic)
    })
    .await;

    // Valid topic, broken JSON.
    h.router
        .handle_publish(&format!("DEVICE/{HW}/data"), b"{not json");
    wait_until(Duration::from_millis(10), 500, "PARSE_FAIL error", || {
        h.store.has_error(ErrorCode::ParseFail)
    })
    .await;

    // Nothing was assembled.
    assert!(h.store.capture("a.jpg").is_none());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn device_reported_error_keeps_sensors_and_fails_capture() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({
        "image_name": "fail.jpg",
        "error": 2,
        "temperature": 21.0,
        "humidity": 55.5
    }));

    wait_until(Duration::from_millis(10), 500, "capture failed", || {
        h.store.capture("fail.jpg").map(|c| c.status) == Some("failed".into())
    })
    .await;

    let capture = h.store.capture("fail.jpg").unwrap();
    assert_eq!(capture.sensor_data["temperature_c"], json!(21.0));
    assert_eq!(capture.sensor_data["humidity_pct"], json!(55.5));
    assert!(h.store.has_error(ErrorCode::DeviceReported));
    assert_eq!(h.blob.object_count(), 0);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn audit_trail_covers_both_directions() {
    let h = harness();
    h.store.seed_device(HW, DeviceSchedule::default(), None);

    h.metadata(json!({ "total_chunk_count": 1, "image_size": 2 }));
    h.chunk("a.jpg", 0, CHUNK_SOI);

    // The chunk fails framing (no EOI), but both messages must be audited
    // regardless of their fate, and the chunk body must not be stored.
    wait_until(Duration::from_millis(10), 500, "audit rows", || {
        h.store.audits().len() >= 2
    })
    .await;

    let audits = h.store.audits();
    let chunk_row = audits
        .iter()
        .find(|a| a.payload.get("chunk_id").is_some())
        .expect("chunk audited");
    assert!(chunk_row.payload.get("payload").is_none());
    assert_eq!(chunk_row.payload["payload_length"], json!(4));

    h.cancel.cancel();
}
