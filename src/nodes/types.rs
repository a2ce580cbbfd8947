//! Agent node registration types

use serde::{Deserialize, Serialize};

use crate::db::{AgentNode, Device};

/// A device an agent exposes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAnnouncement {
    pub id: String,
    pub display_name: String,
    /// Group that owns the device when it is first seen
    pub owning_group: String,
}

/// Registration message from a connecting agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub devices: Vec<DeviceAnnouncement>,
}

/// Result of a registration
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredNode {
    pub node: AgentNode,
    pub devices: Vec<Device>,
}
