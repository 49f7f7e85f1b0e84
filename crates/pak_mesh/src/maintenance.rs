//! Periodic maintenance loop.
//!
//! Drives the node's time-based work: queue retries, ack deadlines,
//! duplicate-cache eviction, reassembly expiry and session pruning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use crate::node::MeshNode;

/// Control handle for a running maintenance loop.
pub struct MaintenanceHandle {
    /// Wake the loop for an immediate pass.
    pub wake: Arc<Notify>,
    /// Send `true` to shut down.
    pub shutdown_tx: watch::Sender<bool>,
}

impl MaintenanceHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub fn spawn_maintenance_loop(node: Arc<MeshNode>) -> (tokio::task::JoinHandle<()>, MaintenanceHandle) {
    let interval = Duration::from_millis(node.config().node.maintenance_interval_ms);
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_clone = wake.clone();

    let handle = tokio::spawn(async move {
        info!(node = %node.local_id(), interval_ms = interval.as_millis() as u64, "maintenance loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_clone.notified() => {
                    debug!("maintenance loop woken early");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("maintenance loop shutting down");
                        return;
                    }
                }
            }
            if *shutdown_rx.borrow() {
                return;
            }
            node.run_maintenance(Utc::now()).await;
        }
    });

    (handle, MaintenanceHandle { wake, shutdown_tx })
}
