//! Finalization of a complete assembly: validate, upload, commit, ACK.
//!
//! The steps run strictly in order and each is a precondition for the next.
//! Validation failures (bad framing, hash mismatch) are terminal for the
//! capture. Upload and record-update failures are not: the capture stays
//! `assembling` so the next completion trigger or the reaper decides its
//! fate, and the pure steps are simply re-run.

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assembly::Assembly;
use crate::blob::{storage_path, BlobStore};
use crate::config::TopicConfig;
use crate::errors::ErrorCode;
use crate::messages::{format_wake_hint, AckOk, AckOkBody};
use crate::mqtt::Publisher;
use crate::store::RecordStore;

/// What happened to a completed assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Blob stored and record committed; the assembly can be released.
    Success,
    /// Terminal validation failure; the capture is failed and the assembly
    /// can be released.
    Failed,
    /// Transient storage/persistence failure; keep the assembly for another
    /// attempt.
    Retry,
}

pub struct Finalizer {
    store: Arc<dyn RecordStore>,
    blob: Arc<dyn BlobStore>,
    publisher: Arc<dyn Publisher>,
    topics: TopicConfig,
    size_strict: bool,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn RecordStore>,
        blob: Arc<dyn BlobStore>,
        publisher: Arc<dyn Publisher>,
        topics: TopicConfig,
        size_strict: bool,
    ) -> Self {
        Self {
            store,
            blob,
            publisher,
            topics,
            size_strict,
        }
    }

    /// Run the finalization pipeline for a complete assembly.
    pub async fn finalize(&self, hw_id: &str, asm: &Assembly) -> FinalizeOutcome {
        let name = asm.image_name.as_str();
        let Some(capture_id) = asm.capture_id else {
            // The capture row never landed (store hiccup at first sighting);
            // retry once the next trigger re-runs us.
            warn!(device = %hw_id, image = %name, "finalize without capture row, retrying later");
            return FinalizeOutcome::Retry;
        };
        let device_id = asm.device_id;

        // Steps 1-4 are pure and re-runnable.
        let bytes = asm.assemble();
        let actual_size = bytes.len() as i64;

        if let Some(declared) = asm.declared_size {
            if declared != actual_size {
                warn!(
                    device = %hw_id, image = %name,
                    declared, actual = actual_size, "size mismatch"
                );
                self.report(
                    device_id,
                    capture_id,
                    ErrorCode::SizeMismatch,
                    "declared and assembled sizes differ",
                    json!({ "declared": declared, "actual": actual_size }),
                )
                .await;
                if self.size_strict {
                    return self.fail(hw_id, capture_id, "size mismatch").await;
                }
            }
        }

        let framed = bytes.len() >= 4
            && bytes[0] == 0xFF
            && bytes[1] == 0xD8
            && bytes[bytes.len() - 2] == 0xFF
            && bytes[bytes.len() - 1] == 0xD9;
        if !framed {
            self.report(
                device_id,
                capture_id,
                ErrorCode::JpegInvalid,
                "missing JPEG SOI/EOI markers",
                json!({ "size": actual_size }),
            )
            .await;
            return self.fail(hw_id, capture_id, "invalid JPEG framing").await;
        }

        let sha_hex = hex::encode(Sha256::digest(&bytes));
        if let Some(ref expected) = asm.expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha_hex) {
                self.report(
                    device_id,
                    capture_id,
                    ErrorCode::HashMismatch,
                    "assembled bytes do not match declared SHA-256",
                    json!({ "declared": expected, "actual": sha_hex }),
                )
                .await;
                return self.fail(hw_id, capture_id, "sha256 mismatch").await;
            }
        }

        // Steps 5-7: upload, resolve URL, commit. Failures here leave the
        // capture assembling and the buffered chunks intact.
        let path = storage_path(hw_id, name, Utc::now());
        if let Err(e) = self.blob.put(&path, bytes, "image/jpeg").await {
            self.report(
                device_id,
                capture_id,
                ErrorCode::StorageUploadFail,
                "blob upload failed",
                json!({ "path": path, "error": e.to_string() }),
            )
            .await;
            return FinalizeOutcome::Retry;
        }

        let url = self.blob.public_url(&path);

        if let Err(e) = self
            .store
            .finalize_capture(
                capture_id,
                &path,
                &url,
                &sha_hex,
                actual_size,
                asm.sensor_data.as_ref(),
            )
            .await
        {
            self.report(
                device_id,
                capture_id,
                ErrorCode::CaptureUpdateFail,
                "final capture update failed",
                json!({ "error": e.to_string() }),
            )
            .await;
            return FinalizeOutcome::Retry;
        }

        metrics::counter!("worker.captures.finalized").increment(1);
        metrics::counter!("worker.bytes.uploaded").increment(actual_size as u64);
        info!(
            device = %hw_id, image = %name, path = %path,
            size_bytes = actual_size, "capture finalized"
        );

        // Step 8: tell the device, with the wake hint when one is scheduled.
        let next_wake_time = match self.store.resolve_device(hw_id).await {
            Ok(Some(device)) => device.next_wake_at.map(format_wake_hint),
            _ => None,
        };
        let ack = AckOk {
            image_name: name.to_string(),
            ack_ok: AckOkBody { next_wake_time },
        };
        let ack_topic = self.topics.ack_topic(hw_id);
        if let Err(e) = self
            .publisher
            .publish_json(&ack_topic, &serde_json::to_value(&ack).unwrap_or_default())
            .await
        {
            // The record is committed; the device will re-offer the image
            // and the idempotent upsert absorbs it.
            warn!(device = %hw_id, image = %name, error = %e, "ACK_OK publish failed");
        }

        FinalizeOutcome::Success
    }

    async fn fail(&self, hw_id: &str, capture_id: Uuid, reason: &str) -> FinalizeOutcome {
        if let Err(e) = self.store.fail_capture(capture_id, reason).await {
            warn!(device = %hw_id, error = %e, "fail_capture did not commit");
        }
        metrics::counter!("worker.captures.failed").increment(1);
        FinalizeOutcome::Failed
    }

    async fn report(
        &self,
        device_id: Option<Uuid>,
        capture_id: Uuid,
        code: ErrorCode,
        message: &str,
        details: serde_json::Value,
    ) {
        if let Err(e) = self
            .store
            .insert_error(device_id, Some(capture_id), code, message, details)
            .await
        {
            warn!(code = %code, error = %e, "error insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CaptureMetadataPatch, DeviceSchedule};
    use crate::testing::{CapturingPublisher, MemoryBlobStore, MemoryRecordStore};

    const HW: &str = "AABBCCDDEEFF";

    struct Fixture {
        store: Arc<MemoryRecordStore>,
        blob: Arc<MemoryBlobStore>,
        publisher: Arc<CapturingPublisher>,
        finalizer: Finalizer,
        device_id: Uuid,
    }

    fn fixture(size_strict: bool) -> Fixture {
        let store = Arc::new(MemoryRecordStore::new());
        let device_id = store.seed_device(HW, DeviceSchedule::default(), None);
        let blob = Arc::new(MemoryBlobStore::new());
        let publisher = Arc::new(CapturingPublisher::new());
        let finalizer = Finalizer::new(
            store.clone(),
            blob.clone(),
            publisher.clone(),
            crate::config::TopicConfig::default(),
            size_strict,
        );
        Fixture {
            store,
            blob,
            publisher,
            finalizer,
            device_id,
        }
    }

    async fn complete_assembly(
        fx: &Fixture,
        name: &str,
        declared_size: Option<i64>,
        chunks: &[&[u8]],
    ) -> Assembly {
        let mut asm = Assembly::new(name);
        asm.apply_metadata(declared_size, Some(chunks.len() as i32), None, None);
        for (i, bytes) in chunks.iter().enumerate() {
            asm.add_chunk(i as i32, bytes.to_vec(), u64::MAX);
        }
        let capture_id = fx
            .store
            .upsert_capture_from_metadata(
                fx.device_id,
                name,
                &CaptureMetadataPatch {
                    image_size: declared_size,
                    total_chunks: Some(chunks.len() as i32),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        asm.capture_id = Some(capture_id);
        asm.device_id = Some(fx.device_id);
        asm
    }

    #[tokio::test]
    async fn test_happy_path() {
        let fx = fixture(false);
        let asm = complete_assembly(&fx, "a.jpg", Some(4), &[&[0xFF, 0xD8], &[0xFF, 0xD9]]).await;

        let outcome = fx.finalizer.finalize(HW, &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Success);

        let capture = fx.store.capture("a.jpg").unwrap();
        assert_eq!(capture.status, "success");
        assert_eq!(capture.image_size, Some(4));
        let path = capture.storage_path.unwrap();
        assert!(path.starts_with("captures/AABBCCDDEEFF/"));
        assert!(path.ends_with("/a.jpg"));
        assert_eq!(capture.image_url.as_deref(), Some(format!("memory://{path}").as_str()));

        // Blob bytes and stored hash agree.
        let blob = fx.blob.object(&path).unwrap();
        assert_eq!(blob, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            capture.image_sha256.unwrap(),
            hex::encode(Sha256::digest(&blob))
        );

        // ACK_OK went to the device ack topic.
        let acks = fx.publisher.to_topic("DEVICE/AABBCCDDEEFF/ack");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["image_name"], "a.jpg");
        assert!(acks[0].get("ACK_OK").is_some());
    }

    #[tokio::test]
    async fn test_invalid_jpeg_fails_without_upload() {
        let fx = fixture(false);
        let asm = complete_assembly(&fx, "bad.jpg", Some(4), &[&[0x00, 0x01, 0x02, 0x03]]).await;

        let outcome = fx.finalizer.finalize(HW, &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Failed);

        assert_eq!(fx.blob.object_count(), 0);
        let capture = fx.store.capture("bad.jpg").unwrap();
        assert_eq!(capture.status, "failed");
        assert!(capture.image_url.is_none());
        assert!(fx.store.has_error(ErrorCode::JpegInvalid));
        assert!(fx.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails() {
        let fx = fixture(false);
        let mut asm =
            complete_assembly(&fx, "a.jpg", Some(4), &[&[0xFF, 0xD8], &[0xFF, 0xD9]]).await;
        asm.expected_sha256 = Some("deadbeef".repeat(8));

        let outcome = fx.finalizer.finalize(HW, &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Failed);
        assert!(fx.store.has_error(ErrorCode::HashMismatch));
        assert_eq!(fx.blob.object_count(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch_warns_and_proceeds() {
        let fx = fixture(false);
        let asm = complete_assembly(&fx, "a.jpg", Some(99), &[&[0xFF, 0xD8], &[0xFF, 0xD9]]).await;

        let outcome = fx.finalizer.finalize(HW, &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Success);
        assert!(fx.store.has_error(ErrorCode::SizeMismatch));
        let capture = fx.store.capture("a.jpg").unwrap();
        assert_eq!(capture.status, "success");
        // The committed size is the actual byte count, not the declared one.
        assert_eq!(capture.image_size, Some(4));
    }

    #[tokio::test]
    async fn test_size_mismatch_strict_mode_fails() {
        let fx = fixture(true);
        let asm = complete_assembly(&fx, "a.jpg", Some(99), &[&[0xFF, 0xD8], &[0xFF, 0xD9]]).await;

        let outcome = fx.finalizer.finalize(HW, &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Failed);
        assert_eq!(fx.blob.object_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_is_retryable() {
        let fx = fixture(false);
        let asm = complete_assembly(&fx, "a.jpg", Some(4), &[&[0xFF, 0xD8], &[0xFF, 0xD9]]).await;
        fx.blob.fail_puts(true);

        let outcome = fx.finalizer.finalize(HW, &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Retry);
        assert!(fx.store.has_error(ErrorCode::StorageUploadFail));

        // Capture still assembling; a later attempt succeeds.
        let capture = fx.store.capture("a.jpg").unwrap();
        assert_eq!(capture.status, "assembling");
        assert!(capture.image_url.is_none());

        fx.blob.fail_puts(false);
        assert_eq!(fx.finalizer.finalize(HW, &asm).await, FinalizeOutcome::Success);
    }

    #[tokio::test]
    async fn test_ack_ok_carries_wake_hint() {
        let fx = fixture(false);
        let wake = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 10, 4, 17, 30, 0).unwrap();
        fx.store.seed_device("BBBBCCDDEEFF", DeviceSchedule::default(), Some(wake));
        let mut asm =
            complete_assembly(&fx, "b.jpg", Some(4), &[&[0xFF, 0xD8], &[0xFF, 0xD9]]).await;
        asm.device_id = Some(fx.device_id);

        // Re-point the assembly's capture at the hinted device.
        let outcome = fx.finalizer.finalize("BBBBCCDDEEFF", &asm).await;
        assert_eq!(outcome, FinalizeOutcome::Success);

        let acks = fx.publisher.to_topic("DEVICE/BBBBCCDDEEFF/ack");
        assert_eq!(acks[0]["ACK_OK"]["next_wake_time"], "5:30PM");
    }
}
