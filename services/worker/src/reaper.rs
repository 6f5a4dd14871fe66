//! Periodic sweep that ages out stale assemblies.
//!
//! The reaper itself never touches assembly state: it only enqueues a sweep
//! event into each device worker's inbox, and the owning worker does the
//! aging. That keeps every assembly mutation on its single owner.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::worker::DeviceRegistry;

pub struct Reaper {
    registry: DeviceRegistry,
    interval: Duration,
}

impl Reaper {
    pub fn new(registry: DeviceRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    debug!(devices = self.registry.device_count(), "reaper sweep");
                    self.registry.sweep_all();
                }
            }
        }
        info!("reaper stopped");
    }
}
