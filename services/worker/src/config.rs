use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingestion worker.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service-level configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// MQTT broker configuration
    pub mqtt: MqttConfig,
    /// Topic patterns
    #[serde(default)]
    pub topics: TopicConfig,
    /// Assembly / retransmit configuration
    #[serde(default)]
    pub assembly: AssemblyConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Blob storage configuration
    pub storage: StorageConfig,
    /// Handshake/scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Command queue poller configuration
    #[serde(default)]
    pub commands: CommandConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// MQTT broker endpoint and credentials
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname
    pub host: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Enable TLS
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Broker username
    pub username: Option<String>,
    /// Broker password
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// Topic patterns. Inbound patterns use the single-level `+` wildcard for
/// the hardware id; outbound topics are derived by substituting it.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_topic_data")]
    pub data: String,
    #[serde(default = "default_topic_status")]
    pub status: String,
    #[serde(default = "default_topic_ack")]
    pub ack: String,
    #[serde(default = "default_topic_cmd")]
    pub cmd: String,
}

impl TopicConfig {
    /// Render a wildcard pattern into a concrete per-device topic.
    pub fn for_device(pattern: &str, hw_id: &str) -> String {
        pattern.replacen('+', hw_id, 1)
    }

    pub fn ack_topic(&self, hw_id: &str) -> String {
        Self::for_device(&self.ack, hw_id)
    }

    pub fn cmd_topic(&self, hw_id: &str) -> String {
        Self::for_device(&self.cmd, hw_id)
    }
}

/// Assembly, retransmit and resource-cap configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyConfig {
    /// Assembly age-out in milliseconds
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
    /// NACK tick in milliseconds
    #[serde(default = "default_retransmit_delay_ms")]
    pub retransmit_delay_ms: u64,
    /// Max NACK rounds before the assembly fails
    #[serde(default = "default_retransmit_max")]
    pub retransmit_max: u32,
    /// Per-image byte cap
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
    /// Global cap on concurrent assemblies
    #[serde(default = "default_max_assemblies")]
    pub max_assemblies: usize,
    /// Per-device cap on concurrent assemblies
    #[serde(default = "default_max_assemblies_per_device")]
    pub max_assemblies_per_device: usize,
    /// Fail (instead of warn) on declared/actual size mismatch
    #[serde(default)]
    pub size_strict: bool,
    /// Per-device inbox depth before backpressure drops kick in
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Reaper sweep interval in seconds
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Hard deadline for every store operation, in seconds
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    /// Depth of the audit-log write queue
    #[serde(default = "default_audit_queue_depth")]
    pub audit_queue_depth: usize,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket name for capture blobs
    pub bucket: String,
    /// Region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO and friends)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL used to derive public object URLs; defaults to the
    /// virtual-hosted S3 form when unset
    pub public_base_url: Option<String>,
}

/// Handshake/scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep handed to unprovisioned devices, in hours
    #[serde(default = "default_unknown_device_sleep_hours")]
    pub unknown_device_sleep_hours: i64,
}

/// Command queue poller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_command_poll_ms")]
    pub poll_interval_ms: u64,
    /// Max queued commands fetched per tick
    #[serde(default = "default_command_batch")]
    pub batch_limit: i64,
}

// Default value functions
fn default_service_name() -> String {
    "fieldcam-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_topic_data() -> String {
    "DEVICE/+/data".to_string()
}

fn default_topic_status() -> String {
    "DEVICE/+/status".to_string()
}

fn default_topic_ack() -> String {
    "DEVICE/+/ack".to_string()
}

fn default_topic_cmd() -> String {
    "DEVICE/+/cmd".to_string()
}

fn default_capture_timeout_ms() -> u64 {
    600_000
}

fn default_retransmit_delay_ms() -> u64 {
    3_000
}

fn default_retransmit_max() -> u32 {
    3
}

fn default_max_image_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_max_assemblies() -> usize {
    256
}

fn default_max_assemblies_per_device() -> usize {
    4
}

fn default_inbox_capacity() -> usize {
    64
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_op_timeout_secs() -> u64 {
    10
}

fn default_audit_queue_depth() -> usize {
    1024
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_unknown_device_sleep_hours() -> i64 {
    12
}

fn default_command_poll_ms() -> u64 {
    2_000
}

fn default_command_batch() -> i64 {
    16
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            data: default_topic_data(),
            status: default_topic_status(),
            ack: default_topic_ack(),
            cmd: default_topic_cmd(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            capture_timeout_ms: default_capture_timeout_ms(),
            retransmit_delay_ms: default_retransmit_delay_ms(),
            retransmit_max: default_retransmit_max(),
            max_image_bytes: default_max_image_bytes(),
            max_assemblies: default_max_assemblies(),
            max_assemblies_per_device: default_max_assemblies_per_device(),
            size_strict: false,
            inbox_capacity: default_inbox_capacity(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unknown_device_sleep_hours: default_unknown_device_sleep_hours(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_command_poll_ms(),
            batch_limit: default_command_batch(),
        }
    }
}

/// Flat environment names recognized for operator convenience, mapped onto
/// the nested configuration paths. Nested `WORKER__...` overrides also work.
const FLAT_ENV_ALIASES: &[(&str, &str)] = &[
    ("MQTT_HOST", "mqtt.host"),
    ("MQTT_PORT", "mqtt.port"),
    ("MQTT_TLS", "mqtt.tls"),
    ("MQTT_USERNAME", "mqtt.username"),
    ("MQTT_PASSWORD", "mqtt.password"),
    ("TOPIC_PATTERN_DATA", "topics.data"),
    ("TOPIC_PATTERN_STATUS", "topics.status"),
    ("TOPIC_PATTERN_ACK", "topics.ack"),
    ("TOPIC_PATTERN_CMD", "topics.cmd"),
    ("DATABASE_URL", "database.url"),
    ("STORAGE_BUCKET", "storage.bucket"),
    ("STORAGE_REGION", "storage.region"),
    ("STORAGE_ENDPOINT_URL", "storage.endpoint_url"),
    ("STORAGE_PUBLIC_BASE_URL", "storage.public_base_url"),
    ("CAPTURE_TIMEOUT_MS", "assembly.capture_timeout_ms"),
    ("RETRANSMIT_DELAY_MS", "assembly.retransmit_delay_ms"),
    ("RETRANSMIT_MAX", "assembly.retransmit_max"),
    ("MAX_IMAGE_BYTES", "assembly.max_image_bytes"),
    ("SIZE_STRICT", "assembly.size_strict"),
    ("LOG_LEVEL", "service.log_level"),
    ("METRICS_PORT", "service.metrics_port"),
];

impl Config {
    /// Load configuration from optional config files and the environment.
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/worker").required(false))
            .add_source(config::File::with_name("/etc/fieldcam/worker").required(false))
            .add_source(
                config::Environment::with_prefix("WORKER")
                    .separator("__")
                    .try_parsing(true),
            );

        for (name, path) in FLAT_ENV_ALIASES {
            if let Ok(value) = std::env::var(name) {
                builder = builder.set_override(*path, value)?;
            }
        }

        builder.build()?.try_deserialize().map_err(Into::into)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.assembly.capture_timeout_ms)
    }

    pub fn retransmit_delay(&self) -> Duration {
        Duration::from_millis(self.assembly.retransmit_delay_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.assembly.reaper_interval_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.database.op_timeout_secs)
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.commands.poll_interval_ms)
    }
}
