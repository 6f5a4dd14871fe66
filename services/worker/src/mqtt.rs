//! MQTT transport: connection setup, the inbound event loop, and the
//! publish side used by every outbound path.
//!
//! The event loop owns reconnection: on a connection error it backs off
//! exponentially (base 1s, cap 60s) and re-subscribes once the broker
//! accepts the session again. Inbound publishes are handed to the router,
//! which never blocks the loop.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditSink;
use crate::config::{MqttConfig, TopicConfig};
use crate::router::Router;

/// Errors surfaced by the publish side.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish to {topic} failed: {reason}")]
    Send { topic: String, reason: String },
}

/// Outbound message contract. The MQTT client implements it for production;
/// tests swap in a capturing fake.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), PublishError>;
}

/// Publish side of the MQTT connection. Every outbound message is
/// audit-logged before it is handed to the client.
pub struct MqttPublisher {
    client: AsyncClient,
    audit: AuditSink,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, audit: AuditSink) -> Self {
        Self { client, audit }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish_json(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        self.audit.record_out(topic, payload.clone());

        let body = serde_json::to_vec(payload).map_err(|e| PublishError::Send {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| PublishError::Send {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        metrics::counter!("worker.messages.out").increment(1);
        Ok(())
    }
}

/// Create the MQTT client and its event loop from configuration.
pub fn connect(config: &MqttConfig, service_name: &str) -> (AsyncClient, rumqttc::EventLoop) {
    let client_id = format!("{}-{}", service_name, std::process::id());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    // Device images arrive in ~1 KiB chunks but give headroom well past the
    // default incoming packet cap.
    options.set_max_packet_size(1024 * 1024, 1024 * 1024);

    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }

    AsyncClient::new(options, 128)
}

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Drive the MQTT event loop until cancellation.
pub async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    topics: TopicConfig,
    router: Router,
    cancel: CancellationToken,
) {
    let mut backoff = RECONNECT_BASE;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("transport shutting down");
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff = RECONNECT_BASE;
                    info!("broker connected");
                    for pattern in [&topics.status, &topics.data, &topics.ack] {
                        if let Err(e) = client.subscribe(pattern, QoS::AtLeastOnce).await {
                            error!(pattern = %pattern, error = %e, "subscribe failed");
                        } else {
                            info!(pattern = %pattern, "subscribed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    backoff = RECONNECT_BASE;
                    router.handle_publish(&publish.topic, &publish.payload);
                }
                Ok(other) => {
                    debug!(event = ?other, "transport event");
                }
                Err(e) => {
                    metrics::counter!("worker.transport.errors").increment(1);
                    warn!(error = %e, retry_in = ?backoff, "transport error, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    }
}
