//! Wire message types and payload classification.
//!
//! Devices multiplex image metadata and chunks on the same `data` topic, so
//! classification is content-based. Every device-supplied field is optional:
//! firmware retransmissions routinely null out fields that were present the
//! first time, and the parser must never reject a message for unknown keys.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Validate a hardware id: a MAC address without separators, upper-case hex.
pub fn is_valid_hw_id(s: &str) -> bool {
    s.len() == 12 && s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    // Lenient: a malformed timestamp degrades to None instead of rejecting
    // the whole message.
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

/// Device status heartbeat, published on `DEVICE/{hw}/status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    pub device_id: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "pendingImg")]
    pub pending_images: Option<i64>,
    pub battery_mv: Option<i64>,
    pub wifi_rssi: Option<i64>,
    pub uptime_ms: Option<i64>,
    pub boot_count: Option<i64>,
}

/// Image metadata, published on `DEVICE/{hw}/data` ahead of the chunk burst.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageMetadata {
    pub device_id: Option<String>,
    #[serde(
        rename = "capture_timeStamp",
        alias = "capture_timestamp",
        default,
        deserialize_with = "de_opt_timestamp"
    )]
    pub captured_at: Option<DateTime<Utc>>,
    pub image_name: Option<String>,
    pub image_size: Option<i64>,
    #[serde(alias = "max_chunk_size")]
    pub max_chunks_size: Option<i64>,
    #[serde(alias = "total_chunks_count")]
    pub total_chunk_count: Option<i64>,
    pub location: Option<String>,
    pub error: Option<i64>,
    pub image_sha256: Option<String>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub gas_resistance: Option<f64>,
}

impl ImageMetadata {
    /// Collect the well-known sensor readings into the stored key set.
    ///
    /// Returns None when the message carried no sensor fields at all, so a
    /// bare retransmission cannot clobber previously merged readings.
    pub fn sensor_data(&self) -> Option<Value> {
        let mut map = serde_json::Map::new();
        if let Some(v) = self.temperature {
            map.insert("temperature_c".into(), v.into());
        }
        if let Some(v) = self.humidity {
            map.insert("humidity_pct".into(), v.into());
        }
        if let Some(v) = self.pressure {
            map.insert("pressure_hpa".into(), v.into());
        }
        if let Some(v) = self.gas_resistance {
            map.insert("gas_kohm".into(), v.into());
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }
}

/// A single base64 image fragment, published on `DEVICE/{hw}/data`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkMessage {
    pub device_id: Option<String>,
    pub image_name: Option<String>,
    pub chunk_id: Option<i64>,
    pub max_chunk_size: Option<i64>,
    pub payload: Option<String>,
}

impl ChunkMessage {
    /// Decode the base64 payload into raw bytes.
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.payload.as_deref().unwrap_or(""))
    }
}

/// Content-based classification of a `data` topic payload.
#[derive(Debug)]
pub enum DataPayload {
    Chunk(ChunkMessage),
    Metadata(ImageMetadata),
    /// Neither shape matched; common during retransmission bursts and not an
    /// error.
    Unclassified,
}

/// Classify a raw `data` payload.
///
/// A message with an integer `chunk_id` and a string `payload` is a chunk; a
/// message with `total_chunk_count` or `image_size` is metadata; anything
/// else is dropped upstream with a debug note.
pub fn classify_data(raw: &Value) -> DataPayload {
    let obj = match raw.as_object() {
        Some(obj) => obj,
        None => return DataPayload::Unclassified,
    };

    let has_chunk_id = obj.get("chunk_id").map(Value::is_i64).unwrap_or(false);
    let has_payload = obj.get("payload").map(Value::is_string).unwrap_or(false);
    if has_chunk_id && has_payload {
        if let Ok(chunk) = serde_json::from_value::<ChunkMessage>(raw.clone()) {
            return DataPayload::Chunk(chunk);
        }
        return DataPayload::Unclassified;
    }

    let looks_like_metadata = obj
        .get("total_chunk_count")
        .map(|v| !v.is_null())
        .unwrap_or(false)
        || obj.get("image_size").map(|v| !v.is_null()).unwrap_or(false);
    if looks_like_metadata {
        if let Ok(meta) = serde_json::from_value::<ImageMetadata>(raw.clone()) {
            return DataPayload::Metadata(meta);
        }
    }

    DataPayload::Unclassified
}

/// Server NACK requesting retransmission of specific chunk ids.
#[derive(Debug, Clone, Serialize)]
pub struct Nack {
    pub image_name: String,
    pub missing_chunks: Vec<i32>,
}

/// Server ACK_OK confirming a fully ingested image.
#[derive(Debug, Clone, Serialize)]
pub struct AckOk {
    pub image_name: String,
    #[serde(rename = "ACK_OK")]
    pub ack_ok: AckOkBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckOkBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_time: Option<String>,
}

/// Build the `capture_image` command payload.
pub fn command_capture(hw_id: &str) -> Value {
    serde_json::json!({ "device_id": hw_id, "capture_image": true })
}

/// Build the `next_wake` command payload carrying an ISO-8601 UTC timestamp.
pub fn command_next_wake(hw_id: &str, next_wake: DateTime<Utc>) -> Value {
    serde_json::json!({ "device_id": hw_id, "next_wake": format_next_wake(next_wake) })
}

/// ISO-8601 UTC with second precision, the format the firmware RTC parser
/// expects.
pub fn format_next_wake(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Short human-readable clock time used as the ACK_OK wake hint.
pub fn format_wake_hint(t: DateTime<Utc>) -> String {
    t.format("%-I:%M%p").to_string()
}

/// Is this ack-topic payload one of our own outbound server messages?
///
/// The worker subscribes to the same wildcard it publishes NACK/ACK_OK on,
/// so its own publishes echo back and must not be treated as device acks.
pub fn is_server_ack(raw: &Value) -> bool {
    raw.get("ACK_OK").is_some() || raw.get("missing_chunks").is_some()
}

/// Sticky-first-non-null merge: keys already present in `existing` win,
/// new keys from `incoming` are added.
pub fn sticky_merge(existing: &mut Value, incoming: &Value) {
    let (Some(dst), Some(src)) = (existing.as_object_mut(), incoming.as_object()) else {
        return;
    };
    for (k, v) in src {
        if v.is_null() {
            continue;
        }
        dst.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
