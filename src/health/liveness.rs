//! Heartbeat staleness policy

use chrono::{DateTime, Duration, Utc};

use crate::db::Device;

/// Decides when a device heartbeat is too old to trust
#[derive(Debug, Clone, Copy)]
pub struct Liveness {
    timeout: Duration,
}

impl Liveness {
    /// Policy with the given heartbeat timeout
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Policy from a timeout in seconds
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000)))
    }

    /// Heartbeat timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Heartbeats older than this are stale
    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.timeout
    }

    /// Whether a device's last heartbeat is older than the timeout
    #[must_use]
    pub fn is_stale(&self, device: &Device, now: DateTime<Utc>) -> bool {
        device.last_heartbeat < self.cutoff(now)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::from_secs(90)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeviceState;

    fn device(heartbeat: DateTime<Utc>) -> Device {
        Device {
            id: "d1".to_string(),
            node_id: None,
            display_name: "Dongle".to_string(),
            owning_group: "lab".to_string(),
            current_holder: None,
            state: DeviceState::Available,
            last_heartbeat: heartbeat,
            created_at: heartbeat,
            updated_at: heartbeat,
        }
    }

    #[test]
    fn stale_after_timeout() {
        let liveness = Liveness::from_secs(60);
        let now = Utc::now();

        assert!(!liveness.is_stale(&device(now - Duration::seconds(30)), now));
        assert!(liveness.is_stale(&device(now - Duration::seconds(61)), now));
    }
}
