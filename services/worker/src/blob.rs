//! Blob storage for assembled capture images.
//!
//! Keys are deterministic (`captures/{hw}/{YYYY}/{MM}/{DD}/{name}`), so a
//! retried upload overwrites its own previous attempt and the put is
//! idempotent in effect.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StorageConfig;

/// Errors surfaced by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob upload failed for {path}: {reason}")]
    Upload { path: String, reason: String },
}

/// Minimal object-store contract the finalizer needs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path`, overwriting any previous object.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError>;

    /// Resolve the public URL for an object at `path`.
    fn public_url(&self, path: &str) -> String;
}

/// S3-backed blob store.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    public_base_url: Option<String>,
}

impl S3BlobStore {
    /// Create a new blob store client from the storage configuration.
    pub async fn new(config: &StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(bucket = %config.bucket, region = %config.region, "blob store initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            public_base_url: config.public_base_url.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), BlobError> {
        let size = bytes.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobError::Upload {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        debug!(path = %path, size_bytes = size, "blob uploaded");

        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        if let Some(ref base) = self.public_base_url {
            return format!("{}/{}/{}", base.trim_end_matches('/'), self.bucket, path);
        }
        if let Some(ref endpoint) = self.endpoint_url {
            return format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, path);
        }
        format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, path)
    }
}

/// Build the dated storage key for an assembled capture.
///
/// Format: `captures/{hw}/{YYYY}/{MM}/{DD}/{image_name}`.
pub fn storage_path(hw_id: &str, image_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "captures/{}/{}/{}",
        hw_id,
        at.format("%Y/%m/%d"),
        sanitize_object_name(image_name)
    )
}

/// Sanitize a device-supplied object name to prevent path traversal.
fn sanitize_object_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    cleaned.replace("..", "__")
}
