//! Agent node registry
//!
//! Agents register with the coordinator, announce the devices they expose,
//! and send periodic heartbeats.

pub mod registry;
pub mod types;

pub use registry::NodeRegistry;
pub use types::{DeviceAnnouncement, NodeRegistration, RegisteredNode};
