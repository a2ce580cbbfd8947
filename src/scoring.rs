//! Device ranking for discovery
//!
//! [`LeaseCoordinator::available_devices`](crate::lease::LeaseCoordinator::available_devices)
//! orders candidates by descending score, breaking ties by device id.

use std::str::FromStr;
use std::sync::Arc;

use crate::access::Principal;
use crate::db::Device;
use crate::{Error, Result};

/// Ranks devices offered to a principal
pub trait ScoringStrategy: Send + Sync {
    /// Higher scores are listed first
    fn score(&self, device: &Device, principal: &Principal) -> f64;
}

/// Every device scores the same, so listings fall back to id order
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformScore;

impl ScoringStrategy for UniformScore {
    fn score(&self, _device: &Device, _principal: &Principal) -> f64 {
        1.0
    }
}

/// Prefers devices owned by the principal's own group over shared ones
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferOwnGroup;

impl ScoringStrategy for PreferOwnGroup {
    fn score(&self, device: &Device, principal: &Principal) -> f64 {
        if device.owning_group == principal.group_id {
            2.0
        } else {
            1.0
        }
    }
}

/// Named strategy selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScoringKind {
    #[default]
    Uniform,
    PreferOwnGroup,
}

impl ScoringKind {
    /// Strategy instance for this kind
    #[must_use]
    pub fn strategy(self) -> Arc<dyn ScoringStrategy> {
        match self {
            Self::Uniform => Arc::new(UniformScore),
            Self::PreferOwnGroup => Arc::new(PreferOwnGroup),
        }
    }
}

impl FromStr for ScoringKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "uniform" => Ok(Self::Uniform),
            "prefer_own_group" => Ok(Self::PreferOwnGroup),
            other => Err(Error::Config(format!("unknown scoring strategy '{other}'"))),
        }
    }
}

/// Sort devices by descending score, then by id
pub fn rank(devices: &mut [Device], strategy: &dyn ScoringStrategy, principal: &Principal) {
    devices.sort_by(|a, b| {
        strategy
            .score(b, principal)
            .total_cmp(&strategy.score(a, principal))
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::DeviceState;

    fn device(id: &str, group: &str) -> Device {
        let now = Utc::now();
        Device {
            id: id.to_string(),
            node_id: None,
            display_name: id.to_string(),
            owning_group: group.to_string(),
            current_holder: None,
            state: DeviceState::Available,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn uniform_orders_by_id() {
        let mut devices = vec![device("c", "g"), device("a", "g"), device("b", "g")];
        rank(&mut devices, &UniformScore, &Principal::new("u", "g"));
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn kind_parses_config_names() {
        assert_eq!("uniform".parse::<ScoringKind>().unwrap(), ScoringKind::Uniform);
        assert_eq!(
            "prefer-own-group".parse::<ScoringKind>().unwrap(),
            ScoringKind::PreferOwnGroup
        );
        assert!(matches!("random".parse::<ScoringKind>(), Err(Error::Config(_))));
    }

    #[test]
    fn own_group_first() {
        let mut devices = vec![device("a", "shared"), device("b", "mine")];
        let strategy = ScoringKind::PreferOwnGroup.strategy();
        rank(&mut devices, strategy.as_ref(), &Principal::new("u", "mine"));
        assert_eq!(devices[0].id, "b");
    }
}
