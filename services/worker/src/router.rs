//! Inbound message router.
//!
//! Classifies each transport publish into status / metadata / chunk /
//! device-ack, audit-logs it, and hands it to the owning device worker's
//! inbox. Runs inside the transport callback path, so nothing here may
//! block: audit rows go through the bounded sink, error rows are written
//! from a detached task, and a full worker inbox drops the message.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audit::{audit_view, AuditSink};
use crate::config::TopicConfig;
use crate::errors::ErrorCode;
use crate::messages::{classify_data, is_server_ack, is_valid_hw_id, DataPayload};
use crate::store::RecordStore;
use crate::worker::{DeviceEvent, DeviceRegistry};

/// The topic leaf (last segment) names the message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Status,
    Data,
    Ack,
}

#[derive(Clone)]
pub struct Router {
    topics: TopicConfig,
    registry: DeviceRegistry,
    audit: AuditSink,
    store: Arc<dyn RecordStore>,
}

impl Router {
    pub fn new(
        topics: TopicConfig,
        registry: DeviceRegistry,
        audit: AuditSink,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            topics,
            registry,
            audit,
            store,
        }
    }

    /// Handle one inbound publish. Never blocks.
    pub fn handle_publish(&self, topic: &str, payload: &[u8]) {
        metrics::counter!("worker.messages.in").increment(1);

        let Some((hw_id, kind)) = self.parse_topic(topic) else {
            self.audit.record_in(topic, lossy_payload(payload));
            warn!(topic = %topic, "unroutable topic");
            self.spawn_error(
                None,
                ErrorCode::BadTopic,
                "topic shape invalid or hardware id malformed",
                json!({ "topic": topic }),
            );
            return;
        };

        let raw: Value = match serde_json::from_slice(payload) {
            Ok(raw) => raw,
            Err(e) => {
                self.audit.record_in(topic, lossy_payload(payload));
                warn!(topic = %topic, error = %e, "unparseable payload");
                self.spawn_error(
                    Some(hw_id.clone()),
                    ErrorCode::ParseFail,
                    "inbound payload is not valid JSON",
                    json!({ "topic": topic, "error": e.to_string() }),
                );
                return;
            }
        };

        // Chunk payloads are audited with the body replaced by its length.
        self.audit.record_in(topic, audit_view(&raw));

        let event = match kind {
            TopicKind::Status => match serde_json::from_value(raw.clone()) {
                Ok(msg) => DeviceEvent::Status { msg, raw },
                Err(e) => {
                    warn!(device = %hw_id, error = %e, "status message rejected");
                    self.spawn_error(
                        Some(hw_id),
                        ErrorCode::ParseFail,
                        "status message has an unexpected shape",
                        json!({ "topic": topic, "error": e.to_string() }),
                    );
                    return;
                }
            },
            TopicKind::Data => match classify_data(&raw) {
                DataPayload::Chunk(chunk) => DeviceEvent::Chunk(chunk),
                DataPayload::Metadata(meta) => DeviceEvent::Metadata(meta),
                DataPayload::Unclassified => {
                    // Common mid-retransmission; not an error.
                    debug!(device = %hw_id, "unclassified data payload dropped");
                    return;
                }
            },
            TopicKind::Ack => {
                if is_server_ack(&raw) {
                    // Our own NACK/ACK_OK echoing back on the shared wildcard.
                    return;
                }
                DeviceEvent::Ack(raw)
            }
        };

        self.registry.dispatch(&hw_id, event);
    }

    /// Extract `(hw_id, kind)` from a `PREFIX/{hw}/{leaf}` topic.
    fn parse_topic(&self, topic: &str) -> Option<(String, TopicKind)> {
        let mut parts = topic.split('/');
        let _prefix = parts.next()?;
        let hw_id = parts.next()?;
        let leaf = parts.next()?;
        if parts.next().is_some() || !is_valid_hw_id(hw_id) {
            return None;
        }

        let kind = if matches_leaf(&self.topics.status, leaf) {
            TopicKind::Status
        } else if matches_leaf(&self.topics.data, leaf) {
            TopicKind::Data
        } else if matches_leaf(&self.topics.ack, leaf) {
            TopicKind::Ack
        } else {
            return None;
        };

        Some((hw_id.to_string(), kind))
    }

    fn spawn_error(
        &self,
        hw_id: Option<String>,
        code: ErrorCode,
        message: &'static str,
        details: Value,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let device_id = match hw_id {
                Some(hw) => store.resolve_device(&hw).await.ok().flatten().map(|d| d.device_id),
                None => None,
            };
            let _ = store.insert_error(device_id, None, code, message, details).await;
        });
    }
}

/// Compare a topic's leaf segment against a configured pattern's leaf.
fn matches_leaf(pattern: &str, leaf: &str) -> bool {
    pattern.rsplit('/').next() == Some(leaf)
}

fn lossy_payload(payload: &[u8]) -> Value {
    json!({ "raw": String::from_utf8_lossy(payload) })
}
