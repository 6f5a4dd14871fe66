//! In-memory state for one chunked image transfer.
//!
//! An [`Assembly`] is the runtime twin of a capture row in the `assembling`
//! state. It is owned exclusively by the device worker that created it, so
//! none of this needs locking. Chunks may arrive before metadata; until the
//! declared chunk count is known the assembly buffers fragments without
//! journaling them, then reconciles once the count lands.

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::messages::sticky_merge;

/// Outcome of offering a chunk to an assembly.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New chunk accepted and buffered.
    Accepted,
    /// Same chunk id, byte-identical payload; idempotent drop.
    Duplicate,
    /// Same chunk id, different bytes; the first write wins.
    Conflict,
    /// Chunk id negative or at/above the declared count.
    OutOfRange,
    /// Accepting the chunk would blow the per-image byte cap.
    Oversized,
}

/// Result of applying (possibly re-sent) metadata to an assembly.
#[derive(Debug, Default)]
pub struct MetadataOutcome {
    /// Buffered chunk ids that became journal-eligible because the declared
    /// count is now known.
    pub to_journal: Vec<i32>,
    /// Buffered chunk ids evicted because they fall outside the declared
    /// range.
    pub evicted: Vec<i32>,
}

/// Assembly state for a single `(device, image name)` transfer.
#[derive(Debug)]
pub struct Assembly {
    pub image_name: String,
    pub capture_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub declared_size: Option<i64>,
    pub total_chunks: Option<i32>,
    pub expected_sha256: Option<String>,
    /// Sensor readings accumulated under the sticky-first-non-null rule,
    /// handed to the finalizer for the final record merge.
    pub sensor_data: Option<Value>,
    chunks: BTreeMap<i32, Vec<u8>>,
    bytes_buffered: u64,
    created_at: Instant,
    last_activity: Instant,
    last_nack: Option<Instant>,
    nack_rounds: u32,
    progressed_since_nack: bool,
}

impl Assembly {
    pub fn new(image_name: &str) -> Self {
        let now = Instant::now();
        Self {
            image_name: image_name.to_string(),
            capture_id: None,
            device_id: None,
            declared_size: None,
            total_chunks: None,
            expected_sha256: None,
            sensor_data: None,
            chunks: BTreeMap::new(),
            bytes_buffered: 0,
            created_at: now,
            last_activity: now,
            last_nack: None,
            nack_rounds: 0,
            progressed_since_nack: false,
        }
    }

    /// Apply metadata fields under the sticky-first-non-null rule: the first
    /// non-null value observed for a field wins against later null updates.
    pub fn apply_metadata(
        &mut self,
        declared_size: Option<i64>,
        total_chunks: Option<i32>,
        sha256: Option<String>,
        sensors: Option<&Value>,
    ) -> MetadataOutcome {
        self.last_activity = Instant::now();

        if self.declared_size.is_none() {
            self.declared_size = declared_size;
        }
        if self.expected_sha256.is_none() {
            self.expected_sha256 = sha256;
        }
        if let Some(incoming) = sensors {
            match self.sensor_data.as_mut() {
                Some(existing) => sticky_merge(existing, incoming),
                None => self.sensor_data = Some(incoming.clone()),
            }
        }

        let mut outcome = MetadataOutcome::default();
        if self.total_chunks.is_none() {
            if let Some(total) = total_chunks {
                self.total_chunks = Some(total);
                // Reconcile fragments buffered before the count was known.
                let out_of_range: Vec<i32> =
                    self.chunks.range(total..).map(|(id, _)| *id).collect();
                for id in &out_of_range {
                    if let Some(bytes) = self.chunks.remove(id) {
                        self.bytes_buffered -= bytes.len() as u64;
                    }
                }
                outcome.evicted = out_of_range;
                outcome.to_journal = self.chunks.keys().copied().collect();
            }
        }
        outcome
    }

    /// Offer a decoded chunk to the assembly.
    pub fn add_chunk(&mut self, chunk_id: i32, bytes: Vec<u8>, max_image_bytes: u64) -> ChunkOutcome {
        if chunk_id < 0 {
            return ChunkOutcome::OutOfRange;
        }
        if let Some(total) = self.total_chunks {
            if chunk_id >= total {
                return ChunkOutcome::OutOfRange;
            }
        }
        if let Some(existing) = self.chunks.get(&chunk_id) {
            return if *existing == bytes {
                ChunkOutcome::Duplicate
            } else {
                ChunkOutcome::Conflict
            };
        }
        if self.bytes_buffered + bytes.len() as u64 > max_image_bytes {
            return ChunkOutcome::Oversized;
        }

        self.bytes_buffered += bytes.len() as u64;
        self.chunks.insert(chunk_id, bytes);
        self.last_activity = Instant::now();
        self.progressed_since_nack = true;
        ChunkOutcome::Accepted
    }

    /// Whether chunks may be journaled yet (the declared count is known, so
    /// every buffered id is inside `[0, total)`).
    pub fn journal_ready(&self) -> bool {
        self.total_chunks.is_some()
    }

    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_bytes(&self, chunk_id: i32) -> Option<&[u8]> {
        self.chunks.get(&chunk_id).map(Vec::as_slice)
    }

    /// Completion requires the declared count, a full receipt set, and both
    /// the first and last fragment in hand so JPEG framing can be checked.
    pub fn is_complete(&self) -> bool {
        match self.total_chunks {
            Some(total) if total > 0 => {
                self.chunks.len() == total as usize
                    && self.chunks.contains_key(&0)
                    && self.chunks.contains_key(&(total - 1))
            }
            _ => false,
        }
    }

    /// Chunk ids still missing, in ascending order. Empty when the declared
    /// count is unknown.
    pub fn missing_chunks(&self) -> Vec<i32> {
        match self.total_chunks {
            Some(total) => (0..total).filter(|id| !self.chunks.contains_key(id)).collect(),
            None => Vec::new(),
        }
    }

    /// Concatenate buffered chunks in ascending id order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes_buffered as usize);
        for bytes in self.chunks.values() {
            out.extend_from_slice(bytes);
        }
        out
    }

    /// True once the assembly has been idle longer than the capture timeout.
    pub fn expired(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }

    /// Whether a NACK round is due. Retransmission only makes sense once the
    /// device has started sending: a metadata-only assembly is left to the
    /// reaper instead of being NACKed at a sleeping device.
    pub fn nack_due(&self, now: Instant, delay: Duration) -> bool {
        if self.is_complete() || self.total_chunks.is_none() || self.chunks.is_empty() {
            return false;
        }
        let anchor = match self.last_nack {
            Some(nack) => nack.max(self.last_activity),
            None => self.last_activity,
        };
        now.duration_since(anchor) >= delay
    }

    /// Record a sent NACK round. The round counter resets only when at least
    /// one previously-missing chunk arrived since the previous round.
    pub fn record_nack(&mut self, now: Instant) {
        if self.progressed_since_nack {
            self.nack_rounds = 0;
        }
        self.nack_rounds += 1;
        self.progressed_since_nack = false;
        self.last_nack = Some(now);
    }

    /// True once the NACK budget is spent without progress.
    pub fn retransmit_exhausted(&self, max_rounds: u32) -> bool {
        !self.progressed_since_nack && self.nack_rounds >= max_rounds
    }

    /// Time since the assembly was created.
    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }
}
