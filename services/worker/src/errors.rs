//! Stable error taxonomy for ingestion failures.
//!
//! Every code here is persisted verbatim to the error record store, so the
//! string forms are part of the external contract and must not change.

use serde_json::json;

/// Severity attached to a persisted error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

/// Stable identifiers for everything that can go wrong on the ingest path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Inbound JSON unparseable.
    ParseFail,
    /// Topic shape invalid or hardware id malformed.
    BadTopic,
    /// Base64 chunk payload undecodable.
    ChunkDecodeFail,
    /// `chunk_id` outside the declared chunk range.
    ChunkOutOfRange,
    /// Same chunk id re-sent with different bytes.
    DupChunkConflict,
    /// Reaper aged out an incomplete assembly.
    AssemblyTimeout,
    /// NACK budget spent without completing the image.
    AssemblyRetransmitExhausted,
    /// Declared vs actual byte count differ.
    SizeMismatch,
    /// Missing JPEG SOI/EOI markers.
    JpegInvalid,
    /// SHA-256 of the assembled bytes differs from the declared hash.
    HashMismatch,
    /// Blob put failed.
    StorageUploadFail,
    /// Final capture record update failed.
    CaptureUpdateFail,
    /// Message from an unprovisioned hardware id.
    UnknownDevice,
    /// Assembly resource cap reached.
    Overload,
    /// Per-device inbox full, inbound message dropped.
    BackpressureDrop,
    /// Image larger than the configured per-image byte cap.
    Oversized,
    /// Device reported a capture-side failure in its metadata.
    DeviceReported,
}

impl ErrorCode {
    /// The stable wire/storage identifier.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::ParseFail => "PARSE_FAIL",
            ErrorCode::BadTopic => "BAD_TOPIC",
            ErrorCode::ChunkDecodeFail => "CHUNK_DECODE_FAIL",
            ErrorCode::ChunkOutOfRange => "CHUNK_OUT_OF_RANGE",
            ErrorCode::DupChunkConflict => "DUP_CHUNK_CONFLICT",
            ErrorCode::AssemblyTimeout => "ASSEMBLY_TIMEOUT",
            ErrorCode::AssemblyRetransmitExhausted => "ASSEMBLY_RETRANSMIT_EXHAUSTED",
            ErrorCode::SizeMismatch => "SIZE_MISMATCH",
            ErrorCode::JpegInvalid => "JPEG_INVALID",
            ErrorCode::HashMismatch => "HASH_MISMATCH",
            ErrorCode::StorageUploadFail => "STORAGE_UPLOAD_FAIL",
            ErrorCode::CaptureUpdateFail => "CAPTURE_UPDATE_FAIL",
            ErrorCode::UnknownDevice => "UNKNOWN_DEVICE",
            ErrorCode::Overload => "OVERLOAD",
            ErrorCode::BackpressureDrop => "BACKPRESSURE_DROP",
            ErrorCode::Oversized => "OVERSIZED",
            ErrorCode::DeviceReported => "DEVICE_REPORTED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::ChunkOutOfRange
            | ErrorCode::DupChunkConflict
            | ErrorCode::SizeMismatch
            | ErrorCode::UnknownDevice
            | ErrorCode::Overload
            | ErrorCode::BackpressureDrop => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Map a firmware-reported numeric error code to a stable message.
///
/// The numeric codes come from the device capture loop; anything we do not
/// recognize is reported as unknown with the raw code preserved in details.
pub fn device_error_message(code: i64) -> &'static str {
    match code {
        1 => "camera init failed",
        2 => "image capture failed",
        3 => "sensor read failed",
        4 => "memory allocation failed",
        _ => "unknown device error",
    }
}

/// Details payload for a device-reported error record.
pub fn device_error_details(code: i64, image_name: Option<&str>) -> serde_json::Value {
    json!({
        "device_error_code": code,
        "image_name": image_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::ParseFail.code(), "PARSE_FAIL");
        assert_eq!(
            ErrorCode::AssemblyRetransmitExhausted.code(),
            "ASSEMBLY_RETRANSMIT_EXHAUSTED"
        );
        assert_eq!(ErrorCode::BackpressureDrop.code(), "BACKPRESSURE_DROP");
    }

    #[test]
    fn test_severity_split() {
        assert_eq!(ErrorCode::SizeMismatch.severity(), Severity::Warn);
        assert_eq!(ErrorCode::JpegInvalid.severity(), Severity::Error);
        assert_eq!(ErrorCode::AssemblyTimeout.severity(), Severity::Error);
        assert_eq!(ErrorCode::Overload.severity(), Severity::Warn);
    }

    #[test]
    fn test_device_error_mapping() {
        assert_eq!(device_error_message(2), "image capture failed");
        assert_eq!(device_error_message(99), "unknown device error");
    }
}
