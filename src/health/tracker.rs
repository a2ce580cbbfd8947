//! Periodic liveness sweeps

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{AgentProbe, ProbeReport};
use crate::db::{AgentNode, DbPool, DeviceRepo, DeviceState, GrantRepo, NodeRepo};
use crate::lease::LeaseCoordinator;
use crate::notify::{Event, NotificationHub};
use crate::{Error, Result};

/// Timing knobs for the tracker
#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    /// Period of the liveness sweep
    pub sweep_interval: Duration,
    /// Period of the hygiene sweep
    pub hygiene_interval: Duration,
    /// Bound on a single node probe
    pub probe_timeout: Duration,
    /// Leases inactive for longer than this are evicted by hygiene
    pub idle_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            hygiene_interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of one liveness sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub nodes_probed: usize,
    pub nodes_unhealthy: usize,
    pub devices_evicted: usize,
}

/// Outcome of one hygiene sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HygieneReport {
    pub grants_purged: usize,
    pub leases_evicted: usize,
}

/// Periodic liveness and hygiene worker
pub struct HealthTracker {
    nodes: NodeRepo,
    devices: DeviceRepo,
    grants: GrantRepo,
    coordinator: Arc<LeaseCoordinator>,
    hub: Arc<NotificationHub>,
    probe: Arc<dyn AgentProbe>,
    settings: HealthSettings,
}

impl HealthTracker {
    /// Create a tracker
    #[must_use]
    pub fn new(
        pool: &DbPool,
        coordinator: Arc<LeaseCoordinator>,
        hub: Arc<NotificationHub>,
        probe: Arc<dyn AgentProbe>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            nodes: NodeRepo::new(pool.clone()),
            devices: DeviceRepo::new(pool.clone()),
            grants: GrantRepo::new(pool.clone()),
            coordinator,
            hub,
            probe,
            settings,
        }
    }

    /// Probe every active node, then evict devices with stale heartbeats
    ///
    /// A failing node or device is logged and skipped; it never aborts
    /// the rest of the sweep.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the node or device list cannot be read
    pub async fn sweep(&self) -> Result<SweepReport> {
        let nodes = self.nodes.list_active().map_err(Error::normalize)?;
        let probes = nodes.iter().map(|node| self.probe_node(node));
        let results = futures::future::join_all(probes).await;

        let mut report = SweepReport {
            nodes_probed: nodes.len(),
            ..SweepReport::default()
        };

        for (node, probe) in nodes.iter().zip(results) {
            if !probe.healthy {
                report.nodes_unhealthy += 1;
            }
            self.record_probe(node, &probe).await;
        }

        let cutoff = self.coordinator.liveness().cutoff(Utc::now());
        let stale = self.devices.list_stale(cutoff).map_err(Error::normalize)?;
        for device in stale {
            match self.coordinator.evict_stale(&device.id).await {
                Ok(true) => report.devices_evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(device_id = %device.id, error = %e, "stale eviction failed");
                }
            }
        }

        tracing::debug!(
            nodes = report.nodes_probed,
            unhealthy = report.nodes_unhealthy,
            evicted = report.devices_evicted,
            "health sweep finished"
        );
        Ok(report)
    }

    async fn probe_node(&self, node: &AgentNode) -> ProbeReport {
        match tokio::time::timeout(self.settings.probe_timeout, self.probe.probe(node)).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => ProbeReport::unhealthy(e.to_string()),
            Err(_) => ProbeReport::unhealthy(
                Error::Timeout(format!(
                    "no answer within {}ms",
                    self.settings.probe_timeout.as_millis()
                ))
                .to_string(),
            ),
        }
    }

    async fn record_probe(&self, node: &AgentNode, probe: &ProbeReport) {
        if let Err(e) =
            self.nodes
                .record_probe(&node.id, probe.healthy, probe.detail.as_deref(), Utc::now())
        {
            tracing::error!(node_id = %node.id, error = %e, "failed to record probe");
        }

        match (node.healthy, probe.healthy) {
            (true, false) => {
                let detail = probe.detail.as_deref().unwrap_or("unknown error");
                tracing::warn!(node_id = %node.id, name = %node.name, detail, "agent node unhealthy");
                self.hub
                    .broadcast(&Event::alert(
                        node.id.clone(),
                        None,
                        format!("agent node '{}' is unhealthy: {detail}", node.name),
                    ))
                    .await;
            }
            (false, true) => {
                tracing::info!(node_id = %node.id, name = %node.name, "agent node recovered");
            }
            _ => {}
        }
    }

    /// Purge expired grants and evict leases idle beyond the threshold
    ///
    /// # Errors
    ///
    /// Returns `Internal` if expired grants cannot be purged
    pub async fn hygiene_sweep(&self) -> Result<HygieneReport> {
        let now = Utc::now();
        let grants_purged = self.grants.purge_expired(now).map_err(Error::normalize)?;
        if grants_purged > 0 {
            tracing::info!(count = grants_purged, "purged expired grants");
        }

        let idle = chrono::Duration::from_std(self.settings.idle_timeout)
            .map_err(|e| Error::Internal(format!("idle timeout out of range: {e}")))?;
        let cutoff = now - idle;

        let mut leases_evicted = 0;
        for device_id in self.coordinator.table().idle_since(cutoff) {
            match self.coordinator.evict_idle(&device_id, cutoff).await {
                Ok(true) => leases_evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(device_id = %device_id, error = %e, "idle eviction failed");
                }
            }
        }

        Ok(HygieneReport {
            grants_purged,
            leases_evicted,
        })
    }

    /// Record a heartbeat from a node
    ///
    /// Refreshes the node and all its devices, bringing offline devices
    /// back. Returns how many devices were restored.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown nodes
    pub async fn record_heartbeat(&self, node_id: &str) -> Result<usize> {
        self.heartbeat_inner(node_id)
            .await
            .map_err(Error::normalize)
    }

    async fn heartbeat_inner(&self, node_id: &str) -> Result<usize> {
        let now = Utc::now();
        self.nodes.touch_heartbeat(node_id, now)?;
        self.devices.touch_node_heartbeats(node_id, now)?;

        let mut restored = 0;
        for device in self.devices.list_by_node(node_id)? {
            if device.state == DeviceState::Offline && self.coordinator.restore(&device.id).await? {
                restored += 1;
            }
        }

        tracing::debug!(node_id, restored, "node heartbeat");
        Ok(restored)
    }

    /// Run both sweeps on their intervals until stopped
    #[must_use]
    pub fn start(self: Arc<Self>) -> HealthHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(self.settings.sweep_interval);
            let mut hygiene = tokio::time::interval(self.settings.hygiene_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            hygiene.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate first hygiene tick
            hygiene.tick().await;

            tracing::info!(
                sweep_secs = self.settings.sweep_interval.as_secs(),
                hygiene_secs = self.settings.hygiene_interval.as_secs(),
                "health tracker started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sweep.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "health sweep failed");
                        }
                    }
                    _ = hygiene.tick() => {
                        if let Err(e) = self.hygiene_sweep().await {
                            tracing::error!(error = %e, "hygiene sweep failed");
                        }
                    }
                }
            }

            tracing::info!("health tracker stopped");
        });

        HealthHandle { shutdown_tx, task }
    }
}

/// Running tracker; stop it to end the background task
pub struct HealthHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl HealthHandle {
    /// Signal the tracker to stop and wait for its current sweep to finish
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "health tracker task failed");
        }
    }
}
