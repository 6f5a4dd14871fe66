//! Non-blocking audit trail for every inbound and outbound message.
//!
//! The transport callback must never wait on the database, so audit rows go
//! through a bounded queue drained by a single writer task. The trail is a
//! debugging aid: when the queue is full the row is dropped with a counter
//! bump rather than applying backpressure to the hot path.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{AuditDirection, AuditEntry, RecordStore};

/// Cheap cloneable handle for enqueueing audit rows.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEntry>,
}

impl AuditSink {
    /// Create the sink and spawn its writer task.
    pub fn spawn(store: Arc<dyn RecordStore>, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth);
        tokio::spawn(run_writer(store, rx));
        Self { tx }
    }

    pub fn record_in(&self, topic: &str, payload: Value) {
        self.record(topic, AuditDirection::In, payload);
    }

    pub fn record_out(&self, topic: &str, payload: Value) {
        self.record(topic, AuditDirection::Out, payload);
    }

    fn record(&self, topic: &str, direction: AuditDirection, payload: Value) {
        let entry = AuditEntry {
            topic: topic.to_string(),
            direction,
            payload,
            at: Utc::now(),
        };
        if self.tx.try_send(entry).is_err() {
            metrics::counter!("worker.audit.dropped").increment(1);
            debug!(topic = %topic, "audit queue full, row dropped");
        }
    }
}

async fn run_writer(store: Arc<dyn RecordStore>, mut rx: mpsc::Receiver<AuditEntry>) {
    while let Some(entry) = rx.recv().await {
        if let Err(e) = store.append_audit(&entry).await {
            warn!(error = %e, topic = %entry.topic, "audit insert failed");
        }
    }
}

/// Strip the base64 body out of a chunk payload before auditing, keeping its
/// length. The publish log must never store image bytes.
pub fn audit_view(payload: &Value) -> Value {
    match payload.get("payload").and_then(Value::as_str) {
        Some(body) => {
            let mut view = payload.clone();
            if let Some(obj) = view.as_object_mut() {
                obj.remove("payload");
                obj.insert("payload_length".into(), body.len().into());
            }
            view
        }
        None => payload.clone(),
    }
}
