//! Permission decisions

use chrono::Utc;
use serde::Serialize;

use super::{Action, Principal};
use crate::db::{Device, GrantRepo, PermissionType, SharingRepo};
use crate::{Error, Result};

/// Why access was allowed or denied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Decision {
    /// Principal is a superuser
    Superuser,
    /// An unexpired grant covers the action
    Grant {
        grant_id: String,
        level: PermissionType,
    },
    /// Principal belongs to the device's owning group
    OwningGroup,
    /// The owning group shares its devices with the principal's group
    Sharing { source_group: String },
    /// Nothing allows the action
    Denied,
}

impl Decision {
    /// Whether the decision allows the action
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        !matches!(self, Self::Denied)
    }
}

/// Decides whether a principal may act on a device
///
/// Evaluation order: superuser bypass, then direct grants, then owning
/// group membership, then group sharing agreements. Group membership and
/// sharing imply `use` (and therefore `read`) but never `admin`.
#[derive(Clone)]
pub struct PermissionEvaluator {
    grants: GrantRepo,
    sharing: SharingRepo,
}

impl PermissionEvaluator {
    /// Create an evaluator over the grant and sharing stores
    #[must_use]
    pub const fn new(grants: GrantRepo, sharing: SharingRepo) -> Self {
        Self { grants, sharing }
    }

    /// Whether the principal may perform `action` on `device`
    ///
    /// Lookup failures deny access.
    #[must_use]
    pub fn check(&self, principal: &Principal, device: &Device, action: Action) -> bool {
        match self.evaluate(principal, device, action) {
            Ok(decision) => decision.is_allowed(),
            Err(e) => {
                tracing::error!(
                    principal = %principal.id,
                    device_id = %device.id,
                    %action,
                    error = %e,
                    "permission lookup failed, denying"
                );
                false
            }
        }
    }

    /// Like [`check`](Self::check), failing with `PermissionDenied`
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the action is not allowed
    pub fn require(&self, principal: &Principal, device: &Device, action: Action) -> Result<()> {
        if self.check(principal, device, action) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "'{}' may not {action} device '{}'",
                principal.id, device.id
            )))
        }
    }

    /// Evaluate and explain a permission decision
    ///
    /// # Errors
    ///
    /// Returns error if grants or sharing agreements cannot be read
    pub fn evaluate(
        &self,
        principal: &Principal,
        device: &Device,
        action: Action,
    ) -> Result<Decision> {
        if principal.is_admin {
            return Ok(Decision::Superuser);
        }

        let required = action.required();
        let best = self
            .grants
            .active_for(&principal.id, &device.id, Utc::now())?
            .into_iter()
            .filter(|g| g.permission.satisfies(required))
            .max_by_key(|g| g.permission);
        if let Some(grant) = best {
            return Ok(Decision::Grant {
                grant_id: grant.id,
                level: grant.permission,
            });
        }

        // Implicit access stops at `use`
        if action == Action::Admin {
            return Ok(Decision::Denied);
        }

        if principal.group_id == device.owning_group {
            return Ok(Decision::OwningGroup);
        }

        let shared = self
            .sharing
            .get(&device.owning_group, &principal.group_id)?
            .is_some_and(|a| a.allow_sharing);
        if shared {
            return Ok(Decision::Sharing {
                source_group: device.owning_group.clone(),
            });
        }

        Ok(Decision::Denied)
    }
}
