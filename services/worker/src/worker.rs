//! Per-device serial workers.
//!
//! Each hardware id seen on the bus gets one worker task with a bounded
//! inbox. The worker owns every assembly for its device, so all intra-device
//! mutations are serialized without locks; devices run fully in parallel.
//! Workers are allowed to block on persistence and storage; only the
//! transport callback is not.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assembly::{Assembly, ChunkOutcome};
use crate::blob::BlobStore;
use crate::config::Config;
use crate::errors::{device_error_details, device_error_message, ErrorCode};
use crate::finalizer::{FinalizeOutcome, Finalizer};
use crate::messages::{ChunkMessage, ImageMetadata, Nack, StatusMessage};
use crate::mqtt::Publisher;
use crate::scheduler::Scheduler;
use crate::store::RecordStore;

/// Minimum spacing between repeated per-device warnings (backpressure,
/// overload, unknown device).
const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a device worker needs, shared across all workers.
pub struct WorkerCtx {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub blob: Arc<dyn BlobStore>,
    pub publisher: Arc<dyn Publisher>,
    pub scheduler: Scheduler,
    pub finalizer: Finalizer,
    global_assemblies: AtomicUsize,
}

impl WorkerCtx {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn RecordStore>,
        blob: Arc<dyn BlobStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Arc<Self> {
        let scheduler = Scheduler::new(
            store.clone(),
            publisher.clone(),
            config.topics.clone(),
            config.scheduler.clone(),
        );
        let finalizer = Finalizer::new(
            store.clone(),
            blob.clone(),
            publisher.clone(),
            config.topics.clone(),
            config.assembly.size_strict,
        );
        Arc::new(Self {
            config,
            store,
            blob,
            publisher,
            scheduler,
            finalizer,
            global_assemblies: AtomicUsize::new(0),
        })
    }

    pub fn active_assemblies(&self) -> usize {
        self.global_assemblies.load(Ordering::SeqCst)
    }
}

/// One unit of work for a device worker.
#[derive(Debug)]
pub enum DeviceEvent {
    Status { msg: StatusMessage, raw: Value },
    Metadata(ImageMetadata),
    Chunk(ChunkMessage),
    Ack(Value),
    /// Reaper sweep: age out idle assemblies.
    Sweep,
}

struct DeviceWorker {
    hw_id: String,
    ctx: Arc<WorkerCtx>,
    device_id: Option<Uuid>,
    assemblies: HashMap<String, Assembly>,
    overload_warned: Option<Instant>,
    unknown_warned: Option<Instant>,
}

impl DeviceWorker {
    fn new(hw_id: String, ctx: Arc<WorkerCtx>) -> Self {
        Self {
            hw_id,
            ctx,
            device_id: None,
            assemblies: HashMap::new(),
            overload_warned: None,
            unknown_warned: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DeviceEvent>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.ctx.config.retransmit_delay());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain what is already queued; the registry bounds this
                    // with the shutdown grace period.
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        self.handle(event).await;
                    }
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        // Release whatever is still buffered so the global cap stays honest.
        let leftover = self.assemblies.len();
        if leftover > 0 {
            self.ctx.global_assemblies.fetch_sub(leftover, Ordering::SeqCst);
        }
        debug!(device = %self.hw_id, "device worker stopped");
    }

    async fn handle(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Status { msg, raw } => {
                self.ctx.scheduler.on_status(&self.hw_id, &msg, &raw).await;
            }
            DeviceEvent::Metadata(meta) => self.handle_metadata(meta).await,
            DeviceEvent::Chunk(chunk) => self.handle_chunk(chunk).await,
            DeviceEvent::Ack(raw) => self.handle_ack(raw).await,
            DeviceEvent::Sweep => self.reap_expired().await,
        }
    }

    /// Resolve and cache the provisioned device id. Unknown devices are
    /// reported (rate-limited) and their data dropped.
    async fn resolve_device_id(&mut self) -> Option<Uuid> {
        if let Some(id) = self.device_id {
            return Some(id);
        }
        match self.ctx.store.resolve_device(&self.hw_id).await {
            Ok(Some(device)) => {
                self.device_id = Some(device.device_id);
                Some(device.device_id)
            }
            Ok(None) => {
                let now = Instant::now();
                let warn_due = self
                    .unknown_warned
                    .map_or(true, |at| now.duration_since(at) >= WARN_INTERVAL);
                if warn_due {
                    self.unknown_warned = Some(now);
                    warn!(device = %self.hw_id, "data from unknown device dropped");
                    let _ = self
                        .ctx
                        .store
                        .insert_error(
                            None,
                            None,
                            ErrorCode::UnknownDevice,
                            "data from unprovisioned device",
                            json!({ "hw_id": self.hw_id }),
                        )
                        .await;
                }
                None
            }
            Err(e) => {
                warn!(device = %self.hw_id, error = %e, "device lookup failed");
                None
            }
        }
    }

    fn metadata_patch(&self, meta: &ImageMetadata) -> crate::store::CaptureMetadataPatch {
        crate::store::CaptureMetadataPatch {
            captured_at: Some(meta.captured_at.unwrap_or_else(chrono::Utc::now)),
            image_size: meta.image_size,
            chunk_size: meta.max_chunks_size.and_then(|v| i32::try_from(v).ok()),
            total_chunks: meta.total_chunk_count.and_then(|v| i32::try_from(v).ok()),
            location: meta.location.clone(),
            image_sha256: meta.image_sha256.clone(),
            sensor_data: meta.sensor_data(),
        }
    }

    /// Enforce the per-device and global assembly caps before admitting a
    /// new capture. Emits OVERLOAD at most once per device per minute.
    fn admit_assembly(&mut self) -> bool {
        let caps = &self.ctx.config.assembly;
        let per_device_full = self.assemblies.len() >= caps.max_assemblies_per_device;
        let global_full = self.ctx.active_assemblies() >= caps.max_assemblies;
        if !per_device_full && !global_full {
            return true;
        }

        metrics::counter!("worker.captures.rejected").increment(1);
        let now = Instant::now();
        let warn_due = self
            .overload_warned
            .map_or(true, |at| now.duration_since(at) >= WARN_INTERVAL);
        if warn_due {
            self.overload_warned = Some(now);
            warn!(
                device = %self.hw_id,
                per_device = self.assemblies.len(),
                global = self.ctx.active_assemblies(),
                "assembly cap reached, rejecting new capture"
            );
            let store = self.ctx.store.clone();
            let device_id = self.device_id;
            let hw = self.hw_id.clone();
            tokio::spawn(async move {
                let _ = store
                    .insert_error(
                        device_id,
                        None,
                        ErrorCode::Overload,
                        "assembly cap reached",
                        json!({ "hw_id": hw }),
                    )
                    .await;
            });
        }
        false
    }

    fn release_assembly(&mut self, name: &str) {
        if self.assemblies.remove(name).is_some() {
            self.ctx.global_assemblies.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn handle_metadata(&mut self, meta: ImageMetadata) {
        let Some(name) = meta.image_name.clone() else {
            debug!(device = %self.hw_id, "metadata without image_name dropped");
            return;
        };
        let Some(device_id) = self.resolve_device_id().await else {
            return;
        };
        let patch = self.metadata_patch(&meta);

        // Device-side capture failure: keep the sensor readings, fail the
        // capture, and do not start assembling.
        if let Some(code) = meta.error.filter(|&c| c != 0) {
            let message = device_error_message(code);
            match self
                .ctx
                .store
                .upsert_capture_from_metadata(device_id, &name, &patch)
                .await
            {
                Ok(capture_id) => {
                    let _ = self
                        .ctx
                        .store
                        .insert_error(
                            Some(device_id),
                            Some(capture_id),
                            ErrorCode::DeviceReported,
                            message,
                            device_error_details(code, Some(&name)),
                        )
                        .await;
                    let _ = self.ctx.store.fail_capture(capture_id, message).await;
                }
                Err(e) => warn!(device = %self.hw_id, error = %e, "capture upsert failed"),
            }
            self.release_assembly(&name);
            return;
        }

        // An image that cannot fit the buffer cap will never assemble.
        let max_bytes = self.ctx.config.assembly.max_image_bytes;
        if meta.image_size.is_some_and(|size| size as u64 > max_bytes) {
            if let Ok(capture_id) = self
                .ctx
                .store
                .upsert_capture_from_metadata(device_id, &name, &patch)
                .await
            {
                let _ = self
                    .ctx
                    .store
                    .insert_error(
                        Some(device_id),
                        Some(capture_id),
                        ErrorCode::Oversized,
                        "declared image size exceeds the per-image cap",
                        json!({ "declared": meta.image_size, "cap": max_bytes }),
                    )
                    .await;
                let _ = self
                    .ctx
                    .store
                    .fail_capture(capture_id, "declared size over cap")
                    .await;
            }
            self.release_assembly(&name);
            return;
        }

        if !self.assemblies.contains_key(&name) {
            if !self.admit_assembly() {
                return;
            }
            self.assemblies.insert(name.clone(), Assembly::new(&name));
            self.ctx.global_assemblies.fetch_add(1, Ordering::SeqCst);
            info!(
                device = %self.hw_id, image = %name,
                chunks = ?meta.total_chunk_count, size = ?meta.image_size,
                "assembly started"
            );
        }

        match self
            .ctx
            .store
            .upsert_capture_from_metadata(device_id, &name, &patch)
            .await
        {
            Ok(capture_id) => {
                let asm = self.assemblies.get_mut(&name).unwrap();
                asm.capture_id = Some(capture_id);
                asm.device_id = Some(device_id);
            }
            Err(e) => {
                // The assembly keeps buffering; the next metadata or the
                // finalizer retry path re-attempts the row.
                warn!(device = %self.hw_id, image = %name, error = %e, "capture upsert failed");
            }
        }

        let outcome = {
            let asm = self.assemblies.get_mut(&name).unwrap();
            asm.apply_metadata(
                patch.image_size,
                patch.total_chunks,
                patch.image_sha256.clone(),
                patch.sensor_data.as_ref(),
            )
        };

        if !outcome.evicted.is_empty() {
            let _ = self
                .ctx
                .store
                .insert_error(
                    Some(device_id),
                    self.assemblies.get(&name).and_then(|a| a.capture_id),
                    ErrorCode::ChunkOutOfRange,
                    "buffered chunks outside the declared range dropped",
                    json!({ "chunk_ids": outcome.evicted }),
                )
                .await;
        }

        // Chunks buffered before the count was known are journal-eligible now.
        if let Some(capture_id) = self.assemblies.get(&name).and_then(|a| a.capture_id) {
            for chunk_id in outcome.to_journal {
                let bytes = self
                    .assemblies
                    .get(&name)
                    .and_then(|a| a.chunk_bytes(chunk_id).map(|b| b.to_vec()));
                if let Some(bytes) = bytes {
                    if let Err(e) = self.ctx.store.append_chunk(capture_id, chunk_id, &bytes).await {
                        warn!(device = %self.hw_id, chunk = chunk_id, error = %e, "chunk journal failed");
                    }
                }
            }
        }

        self.try_finalize(&name).await;
    }

    async fn handle_chunk(&mut self, chunk: ChunkMessage) {
        let Some(name) = chunk.image_name.clone() else {
            debug!(device = %self.hw_id, "chunk without image_name dropped");
            return;
        };
        let Some(chunk_id) = chunk.chunk_id.and_then(|v| i32::try_from(v).ok()) else {
            self.report_chunk_error(
                &name,
                ErrorCode::ChunkOutOfRange,
                "chunk id out of representable range",
                json!({ "chunk_id": chunk.chunk_id }),
            )
            .await;
            return;
        };

        let bytes = match chunk.decode_payload() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report_chunk_error(
                    &name,
                    ErrorCode::ChunkDecodeFail,
                    "chunk payload is not valid base64",
                    json!({ "chunk_id": chunk_id, "error": e.to_string() }),
                )
                .await;
                return;
            }
        };

        let Some(device_id) = self.resolve_device_id().await else {
            return;
        };

        if !self.assemblies.contains_key(&name) {
            // Chunk before metadata: admit a minimal capture now, reconcile
            // the declared shape when the metadata lands.
            if !self.admit_assembly() {
                return;
            }
            debug!(device = %self.hw_id, image = %name, chunk = chunk_id, "chunk before metadata");
            let mut asm = Assembly::new(&name);
            match self
                .ctx
                .store
                .upsert_capture_from_metadata(
                    device_id,
                    &name,
                    &crate::store::CaptureMetadataPatch {
                        captured_at: Some(chrono::Utc::now()),
                        chunk_size: chunk.max_chunk_size.and_then(|v| i32::try_from(v).ok()),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(capture_id) => {
                    asm.capture_id = Some(capture_id);
                    asm.device_id = Some(device_id);
                }
                Err(e) => {
                    warn!(device = %self.hw_id, image = %name, error = %e, "capture upsert failed");
                }
            }
            self.assemblies.insert(name.clone(), asm);
            self.ctx.global_assemblies.fetch_add(1, Ordering::SeqCst);
        }

        let max_bytes = self.ctx.config.assembly.max_image_bytes;
        let outcome = {
            let asm = self.assemblies.get_mut(&name).unwrap();
            asm.add_chunk(chunk_id, bytes.clone(), max_bytes)
        };
        let (capture_id, journal_ready) = {
            let asm = self.assemblies.get(&name).unwrap();
            (asm.capture_id, asm.journal_ready())
        };

        match outcome {
            ChunkOutcome::Accepted => {
                metrics::counter!("worker.chunks.received").increment(1);
                if journal_ready {
                    if let Some(capture_id) = capture_id {
                        if let Err(e) =
                            self.ctx.store.append_chunk(capture_id, chunk_id, &bytes).await
                        {
                            warn!(device = %self.hw_id, chunk = chunk_id, error = %e, "chunk journal failed");
                        }
                    }
                }
            }
            ChunkOutcome::Duplicate => {
                debug!(device = %self.hw_id, image = %name, chunk = chunk_id, "duplicate chunk");
            }
            ChunkOutcome::Conflict => {
                self.report_chunk_error(
                    &name,
                    ErrorCode::DupChunkConflict,
                    "chunk re-sent with different bytes, first write kept",
                    json!({ "chunk_id": chunk_id }),
                )
                .await;
            }
            ChunkOutcome::OutOfRange => {
                self.report_chunk_error(
                    &name,
                    ErrorCode::ChunkOutOfRange,
                    "chunk id at or above the declared count",
                    json!({ "chunk_id": chunk_id }),
                )
                .await;
            }
            ChunkOutcome::Oversized => {
                self.report_chunk_error(
                    &name,
                    ErrorCode::Oversized,
                    "chunk buffer exceeds the per-image cap",
                    json!({ "chunk_id": chunk_id }),
                )
                .await;
                if let Some(capture_id) = capture_id {
                    let _ = self
                        .ctx
                        .store
                        .fail_capture(capture_id, "chunk buffer over cap")
                        .await;
                }
                self.release_assembly(&name);
                return;
            }
        }

        self.try_finalize(&name).await;
    }

    async fn report_chunk_error(
        &self,
        name: &str,
        code: ErrorCode,
        message: &str,
        details: Value,
    ) {
        let capture_id = self.assemblies.get(name).and_then(|a| a.capture_id);
        let mut details = details;
        if let Some(obj) = details.as_object_mut() {
            obj.insert("image_name".into(), name.into());
        }
        if let Err(e) = self
            .ctx
            .store
            .insert_error(self.device_id, capture_id, code, message, details)
            .await
        {
            warn!(device = %self.hw_id, code = %code, error = %e, "error insert failed");
        }
    }

    async fn handle_ack(&mut self, raw: Value) {
        let Some(command_id) = raw
            .get("command_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            debug!(device = %self.hw_id, "device ack without command_id");
            return;
        };

        match self.ctx.store.mark_command_acknowledged(command_id).await {
            Ok(true) => {
                info!(device = %self.hw_id, command = %command_id, "command acknowledged");
            }
            Ok(false) => {
                debug!(device = %self.hw_id, command = %command_id, "unmatched ack dropped");
            }
            Err(e) => {
                warn!(device = %self.hw_id, command = %command_id, error = %e, "ack update failed");
            }
        }
    }

    async fn try_finalize(&mut self, name: &str) {
        let complete = self.assemblies.get(name).is_some_and(Assembly::is_complete);
        if !complete {
            return;
        }
        let asm = self.assemblies.get(name).unwrap();
        match self.ctx.finalizer.finalize(&self.hw_id, asm).await {
            FinalizeOutcome::Success | FinalizeOutcome::Failed => self.release_assembly(name),
            FinalizeOutcome::Retry => {}
        }
    }

    /// Retransmit pass: NACK incomplete assemblies that have stalled, fail
    /// the ones whose NACK budget is spent, and retry completed assemblies
    /// stuck behind a transient finalize failure.
    async fn on_tick(&mut self) {
        let now = Instant::now();
        let delay = self.ctx.config.retransmit_delay();
        let max_rounds = self.ctx.config.assembly.retransmit_max;
        let names: Vec<String> = self.assemblies.keys().cloned().collect();

        for name in names {
            let Some(asm) = self.assemblies.get(&name) else { continue };
            let complete = asm.is_complete();
            let exhausted = asm.retransmit_exhausted(max_rounds);
            let nack_due = asm.nack_due(now, delay);
            let capture_id = asm.capture_id;
            let missing = asm.missing_chunks();

            if complete {
                self.try_finalize(&name).await;
                continue;
            }

            if exhausted {
                warn!(
                    device = %self.hw_id, image = %name,
                    missing = missing.len(), "retransmit budget exhausted"
                );
                let _ = self
                    .ctx
                    .store
                    .insert_error(
                        self.device_id,
                        capture_id,
                        ErrorCode::AssemblyRetransmitExhausted,
                        "device stopped responding to retransmit requests",
                        json!({ "image_name": name, "missing_chunks": truncate_ids(&missing) }),
                    )
                    .await;
                if let Some(capture_id) = capture_id {
                    let _ = self
                        .ctx
                        .store
                        .fail_capture(capture_id, "retransmit budget exhausted")
                        .await;
                }
                metrics::counter!("worker.captures.failed").increment(1);
                self.release_assembly(&name);
                continue;
            }

            if nack_due {
                let nack = Nack {
                    image_name: name.clone(),
                    missing_chunks: missing,
                };
                let topic = self.ctx.config.topics.ack_topic(&self.hw_id);
                let payload = serde_json::to_value(&nack).unwrap_or_default();
                match self.ctx.publisher.publish_json(&topic, &payload).await {
                    Ok(()) => {
                        metrics::counter!("worker.nacks.sent").increment(1);
                        debug!(
                            device = %self.hw_id, image = %name,
                            missing = nack.missing_chunks.len(), "NACK sent"
                        );
                        if let Some(asm) = self.assemblies.get_mut(&name) {
                            asm.record_nack(now);
                        }
                    }
                    Err(e) => {
                        warn!(device = %self.hw_id, image = %name, error = %e, "NACK publish failed");
                    }
                }
            }
        }
    }

    /// Reaper pass: age out assemblies with no recent activity.
    async fn reap_expired(&mut self) {
        let now = Instant::now();
        let timeout = self.ctx.config.capture_timeout();
        let expired: Vec<String> = self
            .assemblies
            .iter()
            .filter(|(_, asm)| asm.expired(now, timeout))
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            let Some(asm) = self.assemblies.get(&name) else { continue };
            let capture_id = asm.capture_id;
            let missing = asm.missing_chunks();
            warn!(
                device = %self.hw_id, image = %name,
                received = asm.received_count(), missing = missing.len(),
                age_secs = asm.age(now).as_secs(),
                "assembly timed out"
            );
            let _ = self
                .ctx
                .store
                .insert_error(
                    self.device_id,
                    capture_id,
                    ErrorCode::AssemblyTimeout,
                    "assembly aged out before completing",
                    json!({
                        "image_name": name,
                        "missing_chunks": truncate_ids(&missing),
                        "total_missing": missing.len(),
                    }),
                )
                .await;
            if let Some(capture_id) = capture_id {
                let _ = self
                    .ctx
                    .store
                    .fail_capture(capture_id, "assembly timeout")
                    .await;
            }
            metrics::counter!("worker.captures.failed").increment(1);
            self.release_assembly(&name);
        }
    }
}

/// Cap the id list embedded in error details.
fn truncate_ids(ids: &[i32]) -> Vec<i32> {
    ids.iter().copied().take(50).collect()
}

struct DeviceHandle {
    tx: mpsc::Sender<DeviceEvent>,
    backpressure_warned: Mutex<Option<Instant>>,
}

/// Registry of live device workers, keyed by hardware id.
///
/// The map is the only cross-device shared state; each entry's worker is the
/// sole owner of that device's assemblies.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    ctx: Arc<WorkerCtx>,
    cancel: CancellationToken,
    devices: RwLock<HashMap<String, Arc<DeviceHandle>>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(ctx: Arc<WorkerCtx>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx,
                cancel,
                devices: RwLock::new(HashMap::new()),
                joins: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hand an event to the device's worker without blocking. A full inbox
    /// drops the event and emits BACKPRESSURE_DROP at most once per device
    /// per minute.
    pub fn dispatch(&self, hw_id: &str, event: DeviceEvent) {
        let handle = self.handle_for(hw_id);
        if handle.tx.try_send(event).is_err() {
            metrics::counter!("worker.messages.dropped").increment(1);
            let now = Instant::now();
            let mut warned = handle.backpressure_warned.lock().unwrap();
            let warn_due = warned.map_or(true, |at| now.duration_since(at) >= WARN_INTERVAL);
            if warn_due {
                *warned = Some(now);
                warn!(device = %hw_id, "device inbox full, dropping messages");
                let store = self.inner.ctx.store.clone();
                let hw = hw_id.to_string();
                tokio::spawn(async move {
                    let _ = store
                        .insert_error(
                            None,
                            None,
                            ErrorCode::BackpressureDrop,
                            "device inbox full, inbound messages dropped",
                            json!({ "hw_id": hw }),
                        )
                        .await;
                });
            }
        }
    }

    /// Send a reaper sweep to every live worker.
    pub fn sweep_all(&self) {
        let devices = self.inner.devices.read().unwrap();
        for handle in devices.values() {
            let _ = handle.tx.try_send(DeviceEvent::Sweep);
        }
    }

    pub fn device_count(&self) -> usize {
        self.inner.devices.read().unwrap().len()
    }

    fn handle_for(&self, hw_id: &str) -> Arc<DeviceHandle> {
        if let Some(handle) = self.inner.devices.read().unwrap().get(hw_id) {
            return handle.clone();
        }

        let mut devices = self.inner.devices.write().unwrap();
        if let Some(handle) = devices.get(hw_id) {
            return handle.clone();
        }

        let (tx, rx) = mpsc::channel(self.inner.ctx.config.assembly.inbox_capacity);
        let worker = DeviceWorker::new(hw_id.to_string(), self.inner.ctx.clone());
        let join = tokio::spawn(worker.run(rx, self.inner.cancel.clone()));
        self.inner.joins.lock().unwrap().push(join);

        debug!(device = %hw_id, "device worker started");
        let handle = Arc::new(DeviceHandle {
            tx,
            backpressure_warned: Mutex::new(None),
        });
        devices.insert(hw_id.to_string(), handle.clone());
        handle
    }

    /// Wait for every worker to drain, up to the grace period.
    pub async fn join_all(&self, grace: Duration) {
        let joins: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.joins.lock().unwrap());
        if joins.is_empty() {
            return;
        }
        if tokio::time::timeout(grace, futures::future::join_all(joins))
            .await
            .is_err()
        {
            warn!("device workers did not drain within the grace period");
        }
    }
}
