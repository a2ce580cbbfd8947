//! Exclusive device leasing
//!
//! The [`LeaseCoordinator`] arbitrates who holds each device. All of its
//! read-then-write paths run under the per-device guard handed out by the
//! owned [`LeaseTable`].

mod coordinator;
mod table;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Device, Reservation};

pub use coordinator::LeaseCoordinator;
pub use table::{ActiveLease, DEFAULT_LOCK_TIMEOUT, DeviceGuard, LeaseTable};

/// Options for [`LeaseCoordinator::acquire`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AcquireOptions {
    /// Free-form client description (address, hostname)
    #[serde(default)]
    pub client_meta: Option<String>,
    /// Take the device from its current holder (device admins only)
    #[serde(default)]
    pub force: bool,
}

/// A held device
#[derive(Debug, Clone, Serialize)]
pub struct Lease {
    pub device_id: String,
    pub session_id: String,
    pub holder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_meta: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// The caller already held the device and got its existing session back
    pub reconnected: bool,
}

impl Lease {
    fn from_active(device_id: &str, active: ActiveLease, reconnected: bool) -> Self {
        Self {
            device_id: device_id.to_string(),
            session_id: active.session_id,
            holder: active.holder,
            client_meta: active.client_meta,
            connected_at: active.connected_at,
            last_active: active.last_active,
            reconnected,
        }
    }
}

/// Result of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The holder gave the device back
    Released { session_id: String, duration_ms: i64 },
    /// An administrator took the device from `holder`
    Forced {
        session_id: String,
        duration_ms: i64,
        holder: String,
    },
    /// Nobody held the device
    NotHeld,
}

/// Point-in-time view of a device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device: Device,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<ActiveLease>,
    /// Heartbeat older than the liveness timeout
    pub stale: bool,
    /// Approved reservation covering now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
}
