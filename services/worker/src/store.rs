//! Persistence façade over the relational record store.
//!
//! Every other component talks to the database exclusively through
//! [`RecordStore`], so the SQL surface stays in one place and tests can swap
//! in the in-memory implementation. All Postgres operations run under a hard
//! deadline and map to a typed [`StoreError`].
//!
//! Tables this façade relies on (the schema itself is provisioned
//! externally):
//!
//! - `devices (device_id uuid PK, device_hw_id text UNIQUE, next_wake_at timestamptz)`
//! - `device_configs (device_id uuid PK, test_mode bool, test_interval_minutes int,
//!    capture_interval_hours int, wakeup_window_sec int)`
//! - `captures (capture_id uuid PK, device_id uuid, device_capture_id text,
//!    captured_at timestamptz, image_bytes bigint, chunk_size_bytes int,
//!    total_chunks int, location text, image_sha256 text, sensor_data jsonb,
//!    ingest_status text, ingest_error text, storage_path text, image_url text)`
//!    with a partial unique index on `(device_id, device_capture_id)` where
//!    `ingest_status = 'assembling'`
//! - `capture_chunks (capture_id uuid, chunk_id int, payload bytea,
//!    PRIMARY KEY (capture_id, chunk_id))`
//! - `device_status`, `device_errors`, `device_publish_log`,
//!   `device_commands` (append/queue tables, see the operations below)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::errors::ErrorCode;

/// Errors surfaced by record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error during {op}: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("store operation {0} exceeded its deadline")]
    Timeout(&'static str),
}

/// A provisioned device with its scheduling configuration.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: Uuid,
    pub hw_id: String,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub schedule: DeviceSchedule,
}

/// Per-device scheduling configuration; read-only to the worker.
#[derive(Debug, Clone)]
pub struct DeviceSchedule {
    pub test_mode: bool,
    pub test_interval_minutes: i32,
    pub capture_interval_hours: i32,
    pub wakeup_window_sec: i32,
}

impl Default for DeviceSchedule {
    fn default() -> Self {
        Self {
            test_mode: false,
            test_interval_minutes: 5,
            capture_interval_hours: 12,
            wakeup_window_sec: 0,
        }
    }
}

/// Field patch applied to a capture row under the sticky-first-non-null rule.
#[derive(Debug, Clone, Default)]
pub struct CaptureMetadataPatch {
    pub captured_at: Option<DateTime<Utc>>,
    pub image_size: Option<i64>,
    pub chunk_size: Option<i32>,
    pub total_chunks: Option<i32>,
    pub location: Option<String>,
    pub image_sha256: Option<String>,
    pub sensor_data: Option<Value>,
}

/// Status heartbeat row, appended verbatim per message.
#[derive(Debug, Clone)]
pub struct NewDeviceStatus {
    pub status: String,
    pub pending_images: Option<i64>,
    pub battery_mv: Option<i64>,
    pub wifi_rssi: Option<i64>,
    pub uptime_ms: Option<i64>,
    pub boot_count: Option<i64>,
    pub raw: Value,
}

/// An operator command waiting for dispatch.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command_id: Uuid,
    pub device_id: Uuid,
    pub hw_id: String,
    pub command_type: String,
    pub payload: Value,
    pub requested_at: DateTime<Utc>,
}

/// Direction of an audited publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditDirection {
    In,
    Out,
}

impl AuditDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDirection::In => "in",
            AuditDirection::Out => "out",
        }
    }
}

/// One audited message.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub topic: String,
    pub direction: AuditDirection,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Narrow persistence contract used by every other component.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Look up a provisioned device by hardware id. Strict: unknown ids
    /// resolve to `None`, they are never auto-provisioned.
    async fn resolve_device(&self, hw_id: &str) -> Result<Option<Device>, StoreError>;

    /// Create or update the active capture row for `(device, name)`.
    /// Idempotent; existing non-null fields win over the incoming patch and
    /// sensor readings merge key-by-key under the same rule.
    async fn upsert_capture_from_metadata(
        &self,
        device_id: Uuid,
        name: &str,
        patch: &CaptureMetadataPatch,
    ) -> Result<Uuid, StoreError>;

    /// Journal one chunk. No-op if the `(capture, chunk)` pair is already
    /// present.
    async fn append_chunk(
        &self,
        capture_id: Uuid,
        chunk_id: i32,
        bytes: &[u8],
    ) -> Result<(), StoreError>;

    /// Atomically move a capture to `success` with its storage coordinates.
    async fn finalize_capture(
        &self,
        capture_id: Uuid,
        storage_path: &str,
        image_url: &str,
        sha256_hex: &str,
        actual_size: i64,
        sensor_merge: Option<&Value>,
    ) -> Result<(), StoreError>;

    /// Move a capture to `failed`. Idempotent; never un-finalizes.
    async fn fail_capture(&self, capture_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Persist the next scheduled wake for a device.
    async fn update_next_wake(
        &self,
        device_id: Uuid,
        next_wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Queued operator commands, oldest first.
    async fn fetch_queued_commands(&self, limit: i64) -> Result<Vec<QueuedCommand>, StoreError>;

    /// Flip a command to `sent`. Idempotent.
    async fn mark_command_sent(
        &self,
        command_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flip a sent command to `acknowledged`. Returns whether a matching
    /// command existed.
    async fn mark_command_acknowledged(&self, command_id: Uuid) -> Result<bool, StoreError>;

    /// Append a status heartbeat row.
    async fn insert_device_status(
        &self,
        device_id: Uuid,
        status: &NewDeviceStatus,
    ) -> Result<(), StoreError>;

    /// Append an error record.
    async fn insert_error(
        &self,
        device_id: Option<Uuid>,
        capture_id: Option<Uuid>,
        code: ErrorCode,
        message: &str,
        details: Value,
    ) -> Result<(), StoreError>;

    /// Append an audit-log row.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

/// PostgreSQL implementation of the persistence façade.
pub struct PgRecordStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgRecordStore {
    /// Connect a pool per the database configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|source| StoreError::Query { op: "connect", source })?;

        info!("connected to record store");

        Ok(Self {
            pool,
            op_timeout: Duration::from_secs(config.op_timeout_secs),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a store operation under the configured hard deadline.
    async fn deadline<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|source| StoreError::Query { op, source }),
            Err(_) => Err(StoreError::Timeout(op)),
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn resolve_device(&self, hw_id: &str) -> Result<Option<Device>, StoreError> {
        let row = self
            .deadline(
                "resolve_device",
                sqlx::query(
                    r#"
                    SELECT d.device_id, d.device_hw_id, d.next_wake_at,
                           c.test_mode, c.test_interval_minutes,
                           c.capture_interval_hours, c.wakeup_window_sec
                    FROM devices d
                    LEFT JOIN device_configs c USING (device_id)
                    WHERE d.device_hw_id = $1
                    "#,
                )
                .bind(hw_id)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(|row| {
            let defaults = DeviceSchedule::default();
            Device {
                device_id: row.get("device_id"),
                hw_id: row.get("device_hw_id"),
                next_wake_at: row.get("next_wake_at"),
                schedule: DeviceSchedule {
                    test_mode: row
                        .get::<Option<bool>, _>("test_mode")
                        .unwrap_or(defaults.test_mode),
                    test_interval_minutes: row
                        .get::<Option<i32>, _>("test_interval_minutes")
                        .unwrap_or(defaults.test_interval_minutes),
                    capture_interval_hours: row
                        .get::<Option<i32>, _>("capture_interval_hours")
                        .unwrap_or(defaults.capture_interval_hours),
                    wakeup_window_sec: row
                        .get::<Option<i32>, _>("wakeup_window_sec")
                        .unwrap_or(defaults.wakeup_window_sec),
                },
            }
        }))
    }

    async fn upsert_capture_from_metadata(
        &self,
        device_id: Uuid,
        name: &str,
        patch: &CaptureMetadataPatch,
    ) -> Result<Uuid, StoreError> {
        // Sticky first non-null: COALESCE keeps existing scalar values, and
        // the jsonb concatenation puts the existing readings on the right so
        // they win key-by-key.
        let row = self
            .deadline(
                "upsert_capture_from_metadata",
                sqlx::query(
                    r#"
                    INSERT INTO captures (
                        capture_id, device_id, device_capture_id, captured_at,
                        image_bytes, chunk_size_bytes, total_chunks, location,
                        image_sha256, sensor_data, ingest_status
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9,
                        COALESCE($10, '{}'::jsonb), 'assembling'
                    )
                    ON CONFLICT (device_id, device_capture_id)
                        WHERE ingest_status = 'assembling'
                    DO UPDATE SET
                        captured_at = COALESCE(captures.captured_at, EXCLUDED.captured_at),
                        image_bytes = COALESCE(captures.image_bytes, EXCLUDED.image_bytes),
                        chunk_size_bytes = COALESCE(captures.chunk_size_bytes, EXCLUDED.chunk_size_bytes),
                        total_chunks = COALESCE(captures.total_chunks, EXCLUDED.total_chunks),
                        location = COALESCE(captures.location, EXCLUDED.location),
                        image_sha256 = COALESCE(captures.image_sha256, EXCLUDED.image_sha256),
                        sensor_data = jsonb_strip_nulls(EXCLUDED.sensor_data) || captures.sensor_data
                    RETURNING capture_id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(device_id)
                .bind(name)
                .bind(patch.captured_at)
                .bind(patch.image_size)
                .bind(patch.chunk_size)
                .bind(patch.total_chunks)
                .bind(patch.location.as_deref())
                .bind(patch.image_sha256.as_deref())
                .bind(patch.sensor_data.as_ref())
                .fetch_one(&self.pool),
            )
            .await?;

        Ok(row.get("capture_id"))
    }

    async fn append_chunk(
        &self,
        capture_id: Uuid,
        chunk_id: i32,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        self.deadline(
            "append_chunk",
            sqlx::query(
                r#"
                INSERT INTO capture_chunks (capture_id, chunk_id, payload)
                VALUES ($1, $2, $3)
                ON CONFLICT (capture_id, chunk_id) DO NOTHING
                "#,
            )
            .bind(capture_id)
            .bind(chunk_id)
            .bind(bytes)
            .execute(&self.pool),
        )
        .await?;

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
        let result = self
            .deadline(
                "finalize_capture",
                sqlx::query(
                    r#"
                    UPDATE captures SET
                        ingest_status = 'success',
                        storage_path = $2,
                        image_url = $3,
                        image_sha256 = $4,
                        image_bytes = $5,
                        sensor_data = jsonb_strip_nulls(COALESCE($6, '{}'::jsonb)) || sensor_data
                    WHERE capture_id = $1 AND ingest_status = 'assembling'
                    "#,
                )
                .bind(capture_id)
                .bind(storage_path)
                .bind(image_url)
                .bind(sha256_hex)
                .bind(actual_size)
                .bind(sensor_merge)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            // Already terminal; finalize is idempotent by key.
            debug!(%capture_id, "finalize skipped, capture not assembling");
        }

        Ok(())
    }

    async fn fail_capture(&self, capture_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.deadline(
            "fail_capture",
            sqlx::query(
                r#"
                UPDATE captures SET ingest_status = 'failed', ingest_error = $2
                WHERE capture_id = $1 AND ingest_status = 'assembling'
                "#,
            )
            .bind(capture_id)
            .bind(reason)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn update_next_wake(
        &self,
        device_id: Uuid,
        next_wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.deadline(
            "update_next_wake",
            sqlx::query("UPDATE devices SET next_wake_at = $2 WHERE device_id = $1")
                .bind(device_id)
                .bind(next_wake_at)
                .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn fetch_queued_commands(&self, limit: i64) -> Result<Vec<QueuedCommand>, StoreError> {
        let rows = self
            .deadline(
                "fetch_queued_commands",
                sqlx::query(
                    r#"
                    SELECT c.command_id, c.device_id, d.device_hw_id,
                           c.command_type, c.command_payload, c.requested_at
                    FROM device_commands c
                    JOIN devices d USING (device_id)
                    WHERE c.status = 'queued'
                    ORDER BY c.requested_at ASC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| QueuedCommand {
                command_id: row.get("command_id"),
                device_id: row.get("device_id"),
                hw_id: row.get("device_hw_id"),
                command_type: row.get("command_type"),
                payload: row.get("command_payload"),
                requested_at: row.get("requested_at"),
            })
            .collect())
    }

    async fn mark_command_sent(
        &self,
        command_id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.deadline(
            "mark_command_sent",
            sqlx::query(
                r#"
                UPDATE device_commands SET status = 'sent', sent_at = $2
                WHERE command_id = $1 AND status = 'queued'
                "#,
            )
            .bind(command_id)
            .bind(sent_at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn mark_command_acknowledged(&self, command_id: Uuid) -> Result<bool, StoreError> {
        let result = self
            .deadline(
                "mark_command_acknowledged",
                sqlx::query(
                    r#"
                    UPDATE device_commands SET status = 'acknowledged'
                    WHERE command_id = $1 AND status = 'sent'
                    "#,
                )
                .bind(command_id)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_device_status(
        &self,
        device_id: Uuid,
        status: &NewDeviceStatus,
    ) -> Result<(), StoreError> {
        self.deadline(
            "insert_device_status",
            sqlx::query(
                r#"
                INSERT INTO device_status (
                    device_id, status, pending_count, battery_mv,
                    wifi_rssi, uptime_ms, boot_count, raw
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(device_id)
            .bind(&status.status)
            .bind(status.pending_images)
            .bind(status.battery_mv)
            .bind(status.wifi_rssi)
            .bind(status.uptime_ms)
            .bind(status.boot_count)
            .bind(&status.raw)
            .execute(&self.pool),
        )
        .await?;

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
        self.deadline(
            "insert_error",
            sqlx::query(
                r#"
                INSERT INTO device_errors (
                    device_id, capture_id, error_code, severity, message, details
                ) VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(device_id)
            .bind(capture_id)
            .bind(code.code())
            .bind(code.severity().as_str())
            .bind(message)
            .bind(details)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.deadline(
            "append_audit",
            sqlx::query(
                r#"
                INSERT INTO device_publish_log (topic, direction, payload, received_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&entry.topic)
            .bind(entry.direction.as_str())
            .bind(&entry.payload)
            .bind(entry.at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults_for_unconfigured_devices() {
        let schedule = DeviceSchedule::default();
        assert!(!schedule.test_mode);
        assert_eq!(schedule.capture_interval_hours, 12);
        assert_eq!(schedule.wakeup_window_sec, 0);
    }

    #[test]
    fn test_audit_direction_labels() {
        assert_eq!(AuditDirection::In.as_str(), "in");
        assert_eq!(AuditDirection::Out.as_str(), "out");
    }
}
