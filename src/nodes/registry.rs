//! Agent node registry backed by the store

use std::sync::Arc;

use chrono::Utc;

use super::types::{NodeRegistration, RegisteredNode};
use crate::access::Principal;
use crate::db::{AgentNode, DbPool, DeviceRepo, DeviceState, NodeRepo, grant::ANY_DEVICE};
use crate::lease::LeaseCoordinator;
use crate::notify::{Event, NotificationHub};
use crate::{Error, Result};

/// Registry of agent nodes and the devices they expose
pub struct NodeRegistry {
    nodes: NodeRepo,
    devices: DeviceRepo,
    coordinator: Arc<LeaseCoordinator>,
    hub: Arc<NotificationHub>,
}

impl NodeRegistry {
    /// Create a registry
    #[must_use]
    pub fn new(pool: &DbPool, coordinator: Arc<LeaseCoordinator>, hub: Arc<NotificationHub>) -> Self {
        Self {
            nodes: NodeRepo::new(pool.clone()),
            devices: DeviceRepo::new(pool.clone()),
            coordinator,
            hub,
        }
    }

    /// Register a node and announce its devices
    ///
    /// New devices start available. Known devices keep their owning group
    /// and state; an offline device whose heartbeat is now fresh comes back
    /// online.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed registrations
    pub async fn register(&self, registration: &NodeRegistration) -> Result<RegisteredNode> {
        self.register_inner(registration)
            .await
            .map_err(Error::normalize)
    }

    async fn register_inner(&self, registration: &NodeRegistration) -> Result<RegisteredNode> {
        validate(registration)?;

        let node = self
            .nodes
            .register(&registration.name, &registration.host, registration.port)?;
        let now = Utc::now();

        let mut devices = Vec::with_capacity(registration.devices.len());
        for announced in &registration.devices {
            let existing = self.devices.get(&announced.id)?;
            let device = self.devices.upsert_announced(
                &announced.id,
                Some(&node.id),
                &announced.display_name,
                &announced.owning_group,
                now,
            )?;

            if device.state == DeviceState::Offline {
                self.coordinator.restore(&device.id).await?;
            } else if existing.is_none() {
                tracing::info!(device_id = %device.id, node_id = %node.id, "device announced");
                self.hub.publish(&Event::device_status(&device)).await;
            }
            devices.push(self.devices.require(&device.id)?);
        }

        Ok(RegisteredNode { node, devices })
    }

    /// Get a node by ID
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown nodes
    pub fn get(&self, node_id: &str) -> Result<AgentNode> {
        self.nodes
            .get(node_id)
            .map_err(Error::normalize)?
            .ok_or_else(|| Error::NotFound(format!("node '{node_id}'")))
    }

    /// List all nodes
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the store cannot be read
    pub fn list(&self) -> Result<Vec<AgentNode>> {
        self.nodes.list().map_err(Error::normalize)
    }

    /// Stop or resume probing a node (superusers only)
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` for non-superusers, `NotFound` for
    /// unknown nodes
    pub fn set_active(&self, caller: &Principal, node_id: &str, active: bool) -> Result<AgentNode> {
        if !caller.is_admin {
            return Err(Error::PermissionDenied(
                "only superusers may manage agent nodes".to_string(),
            ));
        }
        self.nodes
            .set_active(node_id, active)
            .map_err(Error::normalize)?;
        tracing::info!(node_id, active, by = %caller.id, "node probing toggled");
        self.get(node_id)
    }
}

fn validate(registration: &NodeRegistration) -> Result<()> {
    if registration.name.trim().is_empty() || registration.host.trim().is_empty() {
        return Err(Error::Validation("node name and host are required".to_string()));
    }
    if registration.port == 0 {
        return Err(Error::Validation("node port must be non-zero".to_string()));
    }
    for device in &registration.devices {
        if device.id.trim().is_empty() || device.id == ANY_DEVICE {
            return Err(Error::Validation(format!("invalid device id '{}'", device.id)));
        }
        if device.owning_group.trim().is_empty() {
            return Err(Error::Validation(format!(
                "device '{}' has no owning group",
                device.id
            )));
        }
    }
    Ok(())
}
