//! Grant and sharing administration

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::{Action, PermissionEvaluator, Principal};
use crate::db::{
    DeviceRepo, Grant, GrantRepo, NewGrant, PermissionType, SharingAgreement, SharingRepo,
    grant::ANY_DEVICE,
};
use crate::notify::{Event, NotificationHub};
use crate::{Error, Result};

/// Request to grant a permission
#[derive(Debug, Clone, Deserialize)]
pub struct GrantRequest {
    /// Device id, or `*` for every device (superusers only)
    pub device_id: String,
    pub principal_id: String,
    pub permission: PermissionType,
    /// Absolute expiry
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    /// Relative expiry in days, as an alternative to `valid_until`
    #[serde(default)]
    pub valid_days: Option<u32>,
}

impl GrantRequest {
    fn expiry(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match (self.valid_until, self.valid_days) {
            (Some(_), Some(_)) => Err(Error::Validation(
                "set either valid_until or valid_days, not both".to_string(),
            )),
            (Some(until), None) if until <= now => Err(Error::Validation(
                "valid_until must be in the future".to_string(),
            )),
            (Some(until), None) => Ok(Some(until)),
            (None, Some(0)) => Err(Error::Validation("valid_days must be positive".to_string())),
            (None, Some(days)) => Ok(Some(now + Duration::days(i64::from(days)))),
            (None, None) => Ok(None),
        }
    }
}

/// Administers grants and sharing agreements
pub struct AccessAdmin {
    evaluator: PermissionEvaluator,
    grants: GrantRepo,
    sharing: SharingRepo,
    devices: DeviceRepo,
    hub: Arc<NotificationHub>,
}

impl AccessAdmin {
    /// Create an administrator over the policy stores
    #[must_use]
    pub const fn new(
        evaluator: PermissionEvaluator,
        grants: GrantRepo,
        sharing: SharingRepo,
        devices: DeviceRepo,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            evaluator,
            grants,
            sharing,
            devices,
            hub,
        }
    }

    /// Grant a permission
    ///
    /// The caller must be a superuser or hold admin on the target device.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices, `PermissionDenied` when the
    /// caller may not grant, `Validation` for a bad expiry
    pub async fn grant(&self, caller: &Principal, request: &GrantRequest) -> Result<Grant> {
        self.grant_inner(caller, request)
            .await
            .map_err(Error::normalize)
    }

    async fn grant_inner(&self, caller: &Principal, request: &GrantRequest) -> Result<Grant> {
        let valid_until = request.expiry(Utc::now())?;

        let group = if request.device_id == ANY_DEVICE {
            if !caller.is_admin {
                return Err(Error::PermissionDenied(
                    "only superusers may grant on every device".to_string(),
                ));
            }
            None
        } else {
            let device = self.devices.require(&request.device_id)?;
            self.evaluator.require(caller, &device, Action::Admin)?;
            Some(device.owning_group)
        };

        let grant = self.grants.insert(&NewGrant {
            device_id: &request.device_id,
            principal_id: &request.principal_id,
            permission: request.permission,
            valid_until,
            granted_by: &caller.id,
        })?;

        self.hub
            .publish(&Event::config_change(
                grant.device_id.clone(),
                group,
                serde_json::json!({ "action": "grant_created", "grant": grant }),
            ))
            .await;

        Ok(grant)
    }

    /// Revoke a grant
    ///
    /// Only superusers and the original granter may revoke.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown grants, `PermissionDenied` otherwise
    pub async fn revoke(&self, caller: &Principal, grant_id: &str) -> Result<()> {
        self.revoke_inner(caller, grant_id)
            .await
            .map_err(Error::normalize)
    }

    async fn revoke_inner(&self, caller: &Principal, grant_id: &str) -> Result<()> {
        let grant = self
            .grants
            .get(grant_id)?
            .ok_or_else(|| Error::NotFound(format!("grant '{grant_id}'")))?;

        if !caller.is_admin && grant.granted_by != caller.id {
            return Err(Error::PermissionDenied(
                "only superusers or the original granter may revoke".to_string(),
            ));
        }

        if !self.grants.delete(grant_id)? {
            return Err(Error::NotFound(format!("grant '{grant_id}'")));
        }

        let group = self
            .devices
            .get(&grant.device_id)?
            .map(|d| d.owning_group);
        self.hub
            .publish(&Event::config_change(
                grant.device_id.clone(),
                group,
                serde_json::json!({ "action": "grant_revoked", "grant_id": grant_id }),
            ))
            .await;

        Ok(())
    }

    /// Grants held by a principal
    ///
    /// Principals may list their own grants; superusers may list anyone's.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when listing another principal's grants
    pub fn list_grants(&self, caller: &Principal, principal_id: &str) -> Result<Vec<Grant>> {
        if !caller.is_admin && caller.id != principal_id {
            return Err(Error::PermissionDenied(
                "may only list your own grants".to_string(),
            ));
        }
        self.grants
            .list_for_principal(principal_id)
            .map_err(Error::normalize)
    }

    /// Create or update a sharing agreement
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` unless the caller is a superuser,
    /// `Validation` when source and target are the same group
    pub async fn set_sharing(
        &self,
        caller: &Principal,
        source: &str,
        target: &str,
        allow: bool,
    ) -> Result<SharingAgreement> {
        if !caller.is_admin {
            return Err(Error::PermissionDenied(
                "only superusers may change sharing agreements".to_string(),
            ));
        }
        if source == target {
            return Err(Error::Validation(
                "a group always shares with itself".to_string(),
            ));
        }

        let agreement = self
            .sharing
            .set(source, target, allow)
            .map_err(Error::normalize)?;

        self.hub
            .publish(&Event::config_change(
                format!("sharing:{source}:{target}"),
                Some(source.to_string()),
                serde_json::json!({ "action": "sharing_updated", "agreement": agreement }),
            ))
            .await;

        Ok(agreement)
    }

    /// All sharing agreements
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the store cannot be read
    pub fn list_sharing(&self) -> Result<Vec<SharingAgreement>> {
        self.sharing.list().map_err(Error::normalize)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::db::init_memory;

    struct Fixture {
        admin: AccessAdmin,
        evaluator: PermissionEvaluator,
        devices: DeviceRepo,
    }

    fn setup() -> Fixture {
        let pool = init_memory().unwrap();
        let devices = DeviceRepo::new(pool.clone());
        devices
            .upsert_announced("d1", None, "Dongle", "g1", Utc::now())
            .unwrap();
        let grants = GrantRepo::new(pool.clone());
        let sharing = SharingRepo::new(pool);
        let evaluator = PermissionEvaluator::new(grants.clone(), sharing.clone());
        Fixture {
            admin: AccessAdmin::new(
                evaluator.clone(),
                grants,
                sharing,
                devices.clone(),
                Arc::new(NotificationHub::new(StdDuration::from_millis(50))),
            ),
            evaluator,
            devices,
        }
    }

    fn request(device: &str, principal: &str, permission: PermissionType) -> GrantRequest {
        GrantRequest {
            device_id: device.to_string(),
            principal_id: principal.to_string(),
            permission,
            valid_until: None,
            valid_days: None,
        }
    }

    #[tokio::test]
    async fn only_device_admins_may_grant() {
        let f = setup();
        let member = Principal::new("u1", "g1");
        let err = f
            .admin
            .grant(&member, &request("d1", "u2", PermissionType::Use))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let root = Principal::admin("root", "ops");
        f.admin
            .grant(&root, &request("d1", "u1", PermissionType::Admin))
            .await
            .unwrap();

        // u1 is now a device admin and may delegate
        let grant = f
            .admin
            .grant(&member, &request("d1", "u2", PermissionType::Use))
            .await
            .unwrap();
        assert_eq!(grant.granted_by, "u1");

        let device = f.devices.require("d1").unwrap();
        assert!(f
            .evaluator
            .check(&Principal::new("u2", "g9"), &device, Action::Use));
    }

    #[tokio::test]
    async fn wildcard_grants_are_superuser_only() {
        let f = setup();
        let root = Principal::admin("root", "ops");
        f.admin
            .grant(&root, &request("d1", "u1", PermissionType::Admin))
            .await
            .unwrap();

        let err = f
            .admin
            .grant(
                &Principal::new("u1", "g1"),
                &request("*", "u2", PermissionType::Use),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        f.admin
            .grant(&root, &request("*", "u2", PermissionType::Read))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expiry_is_validated() {
        let f = setup();
        let root = Principal::admin("root", "ops");

        let mut past = request("d1", "u1", PermissionType::Use);
        past.valid_until = Some(Utc::now() - Duration::minutes(1));
        assert!(matches!(
            f.admin.grant(&root, &past).await,
            Err(Error::Validation(_))
        ));

        let mut days = request("d1", "u1", PermissionType::Use);
        days.valid_days = Some(7);
        let grant = f.admin.grant(&root, &days).await.unwrap();
        assert!(grant.is_temporary);
        assert!(grant.valid_until.unwrap() > Utc::now() + Duration::days(6));
    }

    #[tokio::test]
    async fn revoke_by_granter_or_superuser() {
        let f = setup();
        let root = Principal::admin("root", "ops");
        let grant = f
            .admin
            .grant(&root, &request("d1", "u1", PermissionType::Use))
            .await
            .unwrap();

        let err = f
            .admin
            .revoke(&Principal::new("u1", "g1"), &grant.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        f.admin.revoke(&root, &grant.id).await.unwrap();
        assert!(matches!(
            f.admin.revoke(&root, &grant.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sharing_is_superuser_only() {
        let f = setup();
        let err = f
            .admin
            .set_sharing(&Principal::new("u1", "g1"), "g1", "g2", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let root = Principal::admin("root", "ops");
        f.admin.set_sharing(&root, "g1", "g2", true).await.unwrap();
        assert_eq!(f.admin.list_sharing().unwrap().len(), 1);
    }

    #[test]
    fn listing_other_principals_requires_superuser() {
        let f = setup();
        assert!(f.admin.list_grants(&Principal::new("u1", "g1"), "u1").is_ok());
        assert!(matches!(
            f.admin.list_grants(&Principal::new("u1", "g1"), "u2"),
            Err(Error::PermissionDenied(_))
        ));
    }
}
