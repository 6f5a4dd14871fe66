//! Fieldcam Worker
//!
//! Ingestion middleware between a fleet of battery-powered camera/sensor
//! devices and the cloud backend. Devices publish telemetry and chunked
//! base64 JPEGs over MQTT; this service reassembles the chunks into
//! integrity-checked images, stores the blob in S3 and the metadata (with
//! sensor readings) in PostgreSQL, answers each device heartbeat with a
//! capture-now or sleep-until command, and negotiates retransmission of
//! lost chunks so images survive flaky radios.
//!
//! ## Architecture
//!
//! ```text
//! MQTT Topics                  Per-Device Workers            Sinks
//! ┌────────────────┐          ┌─────────────────────┐      ┌────────────┐
//! │ DEVICE/+/status│          │ assemblies           │      │ S3 bucket  │
//! │ DEVICE/+/data  │──router─▶│  chunk bitmap        │────▶ │ captures/  │
//! │ DEVICE/+/ack   │          │  retransmit timer    │      └────────────┘
//! └────────────────┘          │ handshake            │      ┌────────────┐
//!        ▲                    └─────────────────────┘      │ PostgreSQL │
//!        │                          │        ▲             │ captures   │
//!        │ NACK / ACK_OK / cmd      │        │             │ chunks     │
//!        └──────────────────────────┘     reaper (30s)     │ commands   │
//!                                         cmd poller (2s)  └────────────┘
//! ```
//!
//! The router runs inside the transport callback and never blocks; each
//! hardware id gets a dedicated serial worker that owns that device's
//! assemblies, so intra-device updates need no locks and devices proceed in
//! parallel.

pub mod assembly;
pub mod audit;
pub mod blob;
pub mod commands;
pub mod config;
pub mod errors;
pub mod finalizer;
pub mod messages;
pub mod mqtt;
pub mod reaper;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod worker;

pub use assembly::{Assembly, ChunkOutcome};
pub use audit::AuditSink;
pub use blob::{BlobStore, S3BlobStore};
pub use commands::CommandPoller;
pub use config::Config;
pub use errors::{ErrorCode, Severity};
pub use finalizer::{FinalizeOutcome, Finalizer};
pub use mqtt::{MqttPublisher, Publisher};
pub use reaper::Reaper;
pub use router::Router;
pub use scheduler::Scheduler;
pub use store::{PgRecordStore, RecordStore, StoreError};
pub use worker::{DeviceEvent, DeviceRegistry, WorkerCtx};
