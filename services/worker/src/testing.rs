//! In-memory store, blob and publisher implementations backing the unit and
//! scenario tests. They mirror the semantics the Postgres/S3/MQTT adapters
//! promise (sticky-first-non-null merges, idempotent journaling, monotonic
//! status transitions) so pipeline logic can be exercised without
//! infrastructure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::blob::{BlobError, BlobStore};
use crate::errors::ErrorCode;
use crate::messages::sticky_merge;
use crate::mqtt::{PublishError, Publisher};
use crate::store::{
    AuditEntry, CaptureMetadataPatch, Device, DeviceSchedule, NewDeviceStatus, QueuedCommand,
    RecordStore, StoreError,
};

/// One capture row plus its journaled chunks.
#[derive(Debug, Clone)]
pub struct MemCapture {
    pub capture_id: Uuid,
    pub device_id: Uuid,
    pub name: String,
    pub status: String,
    pub ingest_error: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub image_size: Option<i64>,
    pub chunk_size: Option<i32>,
    pub total_chunks: Option<i32>,
    pub location: Option<String>,
    pub image_sha256: Option<String>,
    pub sensor_data: Value,
    pub storage_path: Option<String>,
    pub image_url: Option<String>,
    pub chunks: BTreeMap<i32, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct MemError {
    pub device_id: Option<Uuid>,
    pub capture_id: Option<Uuid>,
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone)]
struct MemCommand {
    command_id: Uuid,
    device_id: Uuid,
    command_type: String,
    payload: Value,
    status: String,
    requested_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemState {
    devices: Vec<Device>,
    captures: Vec<MemCapture>,
    statuses: Vec<(Uuid, NewDeviceStatus)>,
    errors: Vec<MemError>,
    commands: Vec<MemCommand>,
    audits: Vec<AuditEntry>,
}

/// In-memory [`RecordStore`] with assertion helpers.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemState>,
    fail_writes: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a device the way the external provisioning flow would.
    pub fn seed_device(
        &self,
        hw_id: &str,
        schedule: DeviceSchedule,
        next_wake_at: Option<DateTime<Utc>>,
    ) -> Uuid {
        let device_id = Uuid::new_v4();
        self.state.lock().unwrap().devices.push(Device {
            device_id,
            hw_id: hw_id.to_string(),
            next_wake_at,
            schedule,
        });
        device_id
    }

    /// Queue an operator command.
    pub fn seed_command(&self, device_id: Uuid, command_type: &str, payload: Value) -> Uuid {
        let command_id = Uuid::new_v4();
        self.state.lock().unwrap().commands.push(MemCommand {
            command_id,
            device_id,
            command_type: command_type.to_string(),
            payload,
            status: "queued".to_string(),
            requested_at: Utc::now(),
        });
        command_id
    }

    /// Make every mutating operation fail until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write_guard(&self, op: &'static str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Timeout(op))
        } else {
            Ok(())
        }
    }

    pub fn next_wake(&self, device_id: Uuid) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .and_then(|d| d.next_wake_at)
    }

    pub fn capture(&self, name: &str) -> Option<MemCapture> {
        self.state
            .lock()
            .unwrap()
            .captures
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn statuses(&self, device_id: Uuid) -> Vec<NewDeviceStatus> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .iter()
            .filter(|(id, _)| *id == device_id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<MemError> {
        self.state.lock().unwrap().errors.clone()
    }

    pub fn has_error(&self, code: ErrorCode) -> bool {
        self.state.lock().unwrap().errors.iter().any(|e| e.code == code)
    }

    pub fn error_count(&self, code: ErrorCode) -> usize {
        self.state
            .lock()
            .unwrap()
            .errors
            .iter()
            .filter(|e| e.code == code)
            .count()
    }

    pub fn command_status(&self, command_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .find(|c| c.command_id == command_id)
            .map(|c| c.status.clone())
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        self.state.lock().unwrap().audits.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn resolve_device(&self, hw_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .iter()
            .find(|d| d.hw_id == hw_id)
            .cloned())
    }

    async fn upsert_capture_from_metadata(
        &self,
        device_id: Uuid,
        name: &str,
        patch: &CaptureMetadataPatch,
    ) -> Result<Uuid, StoreError> {
        self.write_guard("upsert_capture_from_metadata")?;
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state
            .captures
            .iter_mut()
            .find(|c| c.device_id == device_id && c.name == name && c.status == "assembling")
        {
            // Sticky first non-null on scalars and key-by-key on sensors.
            existing.captured_at = existing.captured_at.or(patch.captured_at);
            existing.image_size = existing.image_size.or(patch.image_size);
            existing.chunk_size = existing.chunk_size.or(patch.chunk_size);
            existing.total_chunks = existing.total_chunks.or(patch.total_chunks);
            existing.location = existing.location.clone().or_else(|| patch.location.clone());
            existing.image_sha256 = existing
                .image_sha256
                .clone()
                .or_else(|| patch.image_sha256.clone());
            if let Some(ref sensors) = patch.sensor_data {
                let mut base = existing.sensor_data.clone();
                sticky_merge(&mut base, sensors);
                existing.sensor_data = base;
            }
            return Ok(existing.capture_id);
        }

        let capture_id = Uuid::new_v4();
        state.captures.push(MemCapture {
            capture_id,
            device_id,
            name: name.to_string(),
            status: "assembling".to_string(),
            ingest_error: None,
            captured_at: patch.captured_at,
            image_size: patch.image_size,
            chunk_size: patch.chunk_size,
            total_chunks: patch.total_chunks,
            location: patch.location.clone(),
            image_sha256: patch.image_sha256.clone(),
            sensor_data: patch
                .sensor_data
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default())),
            storage_path: None,
            image_url: None,
            chunks: BTreeMap::new(),
        });
        Ok(capture_id)
    }

    async fn append_chunk(
        &self,
        capture_id: Uuid,
        chunk_id: i32,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.write_guard("append_chunk")?;
        let mut state = self.state.lock().unwrap();
        if let Some(capture) = state.captures.iter_mut().find(|c| c.capture_id == capture_id) {
            capture.chunks.entry(chunk_id).or_insert_with(|| bytes.to_vec());
        }
        Ok(())
    }

    async fn finalize_capture(
        &self,
        capture_id: Uuid,
        storage_path: &str,
        image_url: &str,
        sha256_hex: &str,
        actual_size: i64,
        sensor_merge: Option<&Value>,
    ) -> Result<(), StoreError> {
        self.write_guard("finalize_capture")?;
        let mut state = self.state.lock().unwrap();
        if let Some(capture) = state
            .captures
            .iter_mut()
            .find(|c| c.capture_id == capture_id && c.status == "assembling")
        {
            capture.status = "success".to_string();
            capture.storage_path = Some(storage_path.to_string());
            capture.image_url = Some(image_url.to_string());
            capture.image_sha256 = Some(sha256_hex.to_string());
            capture.image_size = Some(actual_size);
            if let Some(sensors) = sensor_merge {
                let mut base = capture.sensor_data.clone();
                sticky_merge(&mut base, sensors);
                capture.sensor_data = base;
            }
        }
        Ok(())
    }

    async fn fail_capture(&self, capture_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.write_guard("fail_capture")?;
        let mut state = self.state.lock().unwrap();
        if let Some(capture) = state
            .captures
            .iter_mut()
            .find(|c| c.capture_id == capture_id && c.status == "assembling")
        {
            capture.status = "failed".to_string();
            capture.ingest_error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn update_next_wake(
        &self,
        device_id: Uuid,
        next_wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write_guard("update_next_wake")?;
        let mut state = self.state.lock().unwrap();
        if let Some(device) = state.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.next_wake_at = Some(next_wake_at);
        }
        Ok(())
    }

    async fn fetch_queued_commands(&self, limit: i64) -> Result<Vec<QueuedCommand>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut queued: Vec<&MemCommand> = state
            .commands
            .iter()
            .filter(|c| c.status == "queued")
            .collect();
        queued.sort_by_key(|c| c.requested_at);
        Ok(queued
            .into_iter()
            .take(limit as usize)
            .map(|c| QueuedCommand {
                command_id: c.command_id,
                device_id: c.device_id,
                hw_id: state
                    .devices
                    .iter()
                    .find(|d| d.device_id == c.device_id)
                    .map(|d| d.hw_id.clone())
                    .unwrap_or_default(),
                command_type: c.command_type.clone(),
                payload: c.payload.clone(),
                requested_at: c.requested_at,
            })
            .collect())
    }

    async fn mark_command_sent(
        &self,
        command_id: Uuid,
        _sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write_guard("mark_command_sent")?;
        let mut state = self.state.lock().unwrap();
        if let Some(cmd) = state
            .commands
            .iter_mut()
            .find(|c| c.command_id == command_id && c.status == "queued")
        {
            cmd.status = "sent".to_string();
        }
        Ok(())
    }

    async fn mark_command_acknowledged(&self, command_id: Uuid) -> Result<bool, StoreError> {
        self.write_guard("mark_command_acknowledged")?;
        let mut state = self.state.lock().unwrap();
        match state
            .commands
            .iter_mut()
            .find(|c| c.command_id == command_id && c.status == "sent")
        {
            Some(cmd) => {
                cmd.status = "acknowledged".to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_device_status(
        &self,
        device_id: Uuid,
        status: &NewDeviceStatus,
    ) -> Result<(), StoreError> {
        self.write_guard("insert_device_status")?;
        self.state
            .lock()
            .unwrap()
            .statuses
            .push((device_id, status.clone()));
        Ok(())
    }

    async fn insert_error(
        &self,
        device_id: Option<Uuid>,
        capture_id: Option<Uuid>,
        code: ErrorCode,
        message: &str,
        details: Value,
    ) -> Result<(), StoreError> {
        self.state.lock().unwrap().errors.push(MemError {
            device_id,
            capture_id,
            code,
            message: message.to_string(),
            details,
        });
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.state.lock().unwrap().audits.push(entry.clone());
        Ok(())
    }
}

/// In-memory [`BlobStore`].
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), BlobError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Upload {
                path: path.to_string(),
                reason: "simulated upload failure".to_string(),
            });
        }
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{path}")
    }
}

/// Publisher fake that records every outbound message.
#[derive(Default)]
pub struct CapturingPublisher {
    published: Mutex<Vec<(String, Value)>>,
    fail: AtomicBool,
}

impl CapturingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    /// Messages published to a specific topic.
    pub fn to_topic(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for CapturingPublisher {
    async fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Send {
                topic: topic.to_string(),
                reason: "simulated publish failure".to_string(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }
}
