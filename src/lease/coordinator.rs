//! Lease arbitration

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{AcquireOptions, ActiveLease, DeviceGuard, DeviceStatus, Lease, LeaseTable, ReleaseOutcome};
use crate::access::{Action, PermissionEvaluator, Principal};
use crate::db::{
    DbPool, Device, DeviceRepo, DeviceState, DeviceUpdate, EndReason, GrantRepo, Reservation,
    ReservationRepo, SharingRepo, UsageRepo,
};
use crate::health::Liveness;
use crate::ledger::UsageLedger;
use crate::notify::{Event, NotificationHub};
use crate::scoring::{self, ScoringStrategy, UniformScore};
use crate::{Error, Result};

/// Central arbitration engine
///
/// Enforces at most one holder per device. Every mutation takes the
/// device's guard from the lease table first, then re-reads the device.
pub struct LeaseCoordinator {
    table: Arc<LeaseTable>,
    devices: DeviceRepo,
    reservations: ReservationRepo,
    evaluator: PermissionEvaluator,
    ledger: UsageLedger,
    liveness: Liveness,
    scoring: Arc<dyn ScoringStrategy>,
    hub: Arc<NotificationHub>,
}

impl LeaseCoordinator {
    /// Create a coordinator over a store
    ///
    /// The lease table starts stopped; call [`start`](Self::start) first.
    #[must_use]
    pub fn new(pool: &DbPool, hub: Arc<NotificationHub>, liveness: Liveness) -> Self {
        Self {
            table: Arc::new(LeaseTable::default()),
            devices: DeviceRepo::new(pool.clone()),
            reservations: ReservationRepo::new(pool.clone()),
            evaluator: PermissionEvaluator::new(
                GrantRepo::new(pool.clone()),
                SharingRepo::new(pool.clone()),
            ),
            ledger: UsageLedger::new(UsageRepo::new(pool.clone())),
            liveness,
            scoring: Arc::new(UniformScore),
            hub,
        }
    }

    /// Replace the device ranking strategy
    #[must_use]
    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringStrategy>) -> Self {
        self.scoring = scoring;
        self
    }

    /// Bound how long an operation waits for a busy device
    ///
    /// Replaces the lease table, so call before [`start`](Self::start) and
    /// before handing the table to other components.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.table = Arc::new(LeaseTable::new(lock_timeout));
        self
    }

    /// Shared lease table (for components that take the same guards)
    #[must_use]
    pub fn table(&self) -> Arc<LeaseTable> {
        Arc::clone(&self.table)
    }

    /// Permission evaluator used for lease decisions
    #[must_use]
    pub const fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    /// Usage ledger sessions are recorded in
    #[must_use]
    pub const fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Liveness policy applied to heartbeats
    #[must_use]
    pub const fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Rebuild the lease table from open sessions and start accepting work
    ///
    /// Devices marked leased without an open session are returned to
    /// available. Returns the number of restored leases.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the store cannot be read
    pub fn start(&self) -> Result<usize> {
        self.start_inner().map_err(Error::normalize)
    }

    fn start_inner(&self) -> Result<usize> {
        let now = Utc::now();
        let open = self.ledger.open_sessions()?;

        for device in self.devices.list()? {
            let has_session = open.iter().any(|s| s.device_id == device.id);
            if device.state == DeviceState::Leased && !has_session {
                tracing::warn!(device_id = %device.id, "leased device without session, releasing");
                self.devices.set_state(&device.id, DeviceState::Available)?;
            }
        }

        let restored: Vec<_> = open
            .into_iter()
            .map(|s| {
                (
                    s.device_id,
                    ActiveLease {
                        session_id: s.id,
                        holder: s.user_id,
                        holder_group: s.group_id,
                        client_meta: None,
                        connected_at: s.start_time,
                        last_active: now,
                    },
                )
            })
            .collect();
        let count = restored.len();
        self.table.start(restored);
        Ok(count)
    }

    /// Stop accepting work; later operations fail with `Internal`
    pub fn stop(&self) {
        self.table.stop();
    }

    /// Acquire a lease on a device
    ///
    /// Re-acquiring a device the principal already holds refreshes the
    /// existing lease instead of opening a second session.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown devices
    /// - `Conflict` when the device is disabled, offline, stale, held by
    ///   someone else, or reserved for someone else right now
    /// - `PermissionDenied` without `use` permission
    /// - `Timeout` if another operation holds the device past the lock timeout
    pub async fn acquire(
        &self,
        device_id: &str,
        principal: &Principal,
        options: AcquireOptions,
    ) -> Result<Lease> {
        self.acquire_inner(device_id, principal, options)
            .await
            .map_err(Error::normalize)
    }

    async fn acquire_inner(
        &self,
        device_id: &str,
        principal: &Principal,
        options: AcquireOptions,
    ) -> Result<Lease> {
        let guard = self.table.lock(device_id).await?;
        let now = Utc::now();
        let mut device = self.devices.require(device_id)?;

        match device.state {
            DeviceState::Disabled => {
                return Err(Error::Conflict(format!("device '{device_id}' is disabled")));
            }
            DeviceState::Offline => {
                return Err(Error::Conflict(format!("device '{device_id}' is offline")));
            }
            DeviceState::Available | DeviceState::Leased => {}
        }
        if self.liveness.is_stale(&device, now) {
            return Err(Error::Conflict(format!(
                "device '{device_id}' has not sent a heartbeat since {}",
                device.last_heartbeat
            )));
        }

        self.evaluator.require(principal, &device, Action::Use)?;

        let overrides = options.force && self.evaluator.check(principal, &device, Action::Admin);

        if let Some(active) = self.table.get(device_id) {
            if active.holder == principal.id {
                let refreshed = self.table.touch(&guard, options.client_meta).unwrap_or(active);
                tracing::debug!(device_id, holder = %principal.id, "lease refreshed");
                return Ok(Lease::from_active(device_id, refreshed, true));
            }

            if !overrides {
                return Err(Error::Conflict(format!(
                    "device '{device_id}' is held by '{}'",
                    active.holder
                )));
            }

            tracing::warn!(
                device_id,
                holder = %active.holder,
                by = %principal.id,
                "force-disconnecting holder"
            );
            self.end_lease(&guard, &active, EndReason::Forced)?;
            self.devices.set_state(device_id, DeviceState::Available)?;
            device.state = DeviceState::Available;
            device.current_holder = None;
            self.hub.publish(&Event::device_status(&device)).await;
        }

        if !overrides {
            if let Some(r) = self.reservation_at(device_id, now)? {
                if r.requester_id != principal.id {
                    return Err(Error::Conflict(format!(
                        "device '{device_id}' is reserved by '{}' until {}",
                        r.requester_id, r.end_time
                    )));
                }
            }
        }

        let session = self.ledger.open(device_id, principal)?;
        self.devices.mark_leased(device_id, &principal.id)?;

        let active = ActiveLease {
            session_id: session.id,
            holder: principal.id.clone(),
            holder_group: principal.group_id.clone(),
            client_meta: options.client_meta,
            connected_at: session.start_time,
            last_active: session.start_time,
        };
        self.table.insert(&guard, active.clone());

        device.state = DeviceState::Leased;
        device.current_holder = Some(principal.id.clone());
        self.hub.publish(&Event::device_status(&device)).await;

        tracing::info!(device_id, holder = %principal.id, session_id = %active.session_id, "device leased");
        Ok(Lease::from_active(device_id, active, false))
    }

    /// Release a device
    ///
    /// The holder may always release. Anyone else needs admin on the device
    /// and `force`. Releasing a device nobody holds succeeds as a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices, `PermissionDenied` when the
    /// caller may not release, `Timeout` if the device stays busy
    pub async fn release(
        &self,
        device_id: &str,
        principal: &Principal,
        force: bool,
    ) -> Result<ReleaseOutcome> {
        self.release_inner(device_id, principal, force)
            .await
            .map_err(Error::normalize)
    }

    async fn release_inner(
        &self,
        device_id: &str,
        principal: &Principal,
        force: bool,
    ) -> Result<ReleaseOutcome> {
        let guard = self.table.lock(device_id).await?;
        let mut device = self.devices.require(device_id)?;

        let Some(active) = self.table.get(device_id) else {
            return Ok(ReleaseOutcome::NotHeld);
        };

        let reason = if active.holder == principal.id {
            EndReason::Released
        } else if force && self.evaluator.check(principal, &device, Action::Admin) {
            EndReason::Forced
        } else {
            return Err(Error::PermissionDenied(format!(
                "device '{device_id}' is held by '{}'",
                active.holder
            )));
        };

        let duration_ms = self.end_lease(&guard, &active, reason)?;
        self.devices.set_state(device_id, DeviceState::Available)?;

        device.state = DeviceState::Available;
        device.current_holder = None;
        self.hub.publish(&Event::device_status(&device)).await;

        tracing::info!(device_id, holder = %active.holder, by = %principal.id, %reason, "device released");

        Ok(match reason {
            EndReason::Forced => ReleaseOutcome::Forced {
                session_id: active.session_id,
                duration_ms,
                holder: active.holder,
            },
            _ => ReleaseOutcome::Released {
                session_id: active.session_id,
                duration_ms,
            },
        })
    }

    /// Current state, lease and reservation of a device
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices
    pub fn status(&self, device_id: &str) -> Result<DeviceStatus> {
        self.status_inner(device_id).map_err(Error::normalize)
    }

    /// Status of a device the principal may read
    ///
    /// Devices the principal cannot read are reported as missing, so the
    /// answer does not reveal whether they exist.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown or unreadable devices
    pub fn status_for(&self, device_id: &str, principal: &Principal) -> Result<DeviceStatus> {
        self.status_for_inner(device_id, principal)
            .map_err(Error::normalize)
    }

    fn status_for_inner(&self, device_id: &str, principal: &Principal) -> Result<DeviceStatus> {
        self.table.ensure_running()?;
        let device = self
            .devices
            .get(device_id)?
            .filter(|d| self.evaluator.check(principal, d, Action::Read))
            .ok_or_else(|| Error::NotFound(format!("device '{device_id}'")))?;
        self.build_status(device)
    }

    fn status_inner(&self, device_id: &str) -> Result<DeviceStatus> {
        self.table.ensure_running()?;
        let device = self.devices.require(device_id)?;
        self.build_status(device)
    }

    fn build_status(&self, device: Device) -> Result<DeviceStatus> {
        let now = Utc::now();
        Ok(DeviceStatus {
            stale: self.liveness.is_stale(&device, now),
            lease: self.table.get(&device.id),
            reservation: self.reservation_at(&device.id, now)?,
            device,
        })
    }

    /// Devices the principal may use, best first
    ///
    /// Offline, disabled and stale devices are never listed; leased ones
    /// only with `include_leased`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the store cannot be read
    pub fn available_devices(
        &self,
        principal: &Principal,
        include_leased: bool,
    ) -> Result<Vec<Device>> {
        self.available_inner(principal, include_leased)
            .map_err(Error::normalize)
    }

    fn available_inner(&self, principal: &Principal, include_leased: bool) -> Result<Vec<Device>> {
        self.table.ensure_running()?;
        let now = Utc::now();

        let mut devices: Vec<_> = self
            .devices
            .list()?
            .into_iter()
            .filter(|d| match d.state {
                DeviceState::Available => true,
                DeviceState::Leased => include_leased,
                DeviceState::Offline | DeviceState::Disabled => false,
            })
            .filter(|d| !self.liveness.is_stale(d, now))
            .filter(|d| self.evaluator.check(principal, d, Action::Use))
            .collect();

        scoring::rank(&mut devices, self.scoring.as_ref(), principal);
        Ok(devices)
    }

    /// Devices the principal may see
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the store cannot be read
    pub fn visible_devices(&self, principal: &Principal) -> Result<Vec<Device>> {
        self.table.ensure_running()?;
        Ok(self
            .devices
            .list()
            .map_err(Error::normalize)?
            .into_iter()
            .filter(|d| self.evaluator.check(principal, d, Action::Read))
            .collect())
    }

    /// Patch a device (admins only)
    ///
    /// Disabling a leased device ends its session with reason `disabled`.
    /// Re-enabling returns it to available, or offline if its heartbeat is
    /// stale.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty update, `NotFound` for unknown
    /// devices, `PermissionDenied` without admin
    pub async fn update_device(
        &self,
        device_id: &str,
        principal: &Principal,
        update: &DeviceUpdate,
    ) -> Result<Device> {
        self.update_inner(device_id, principal, update)
            .await
            .map_err(Error::normalize)
    }

    async fn update_inner(
        &self,
        device_id: &str,
        principal: &Principal,
        update: &DeviceUpdate,
    ) -> Result<Device> {
        if update.is_empty() {
            return Err(Error::Validation("update has no fields".to_string()));
        }
        if update
            .display_name
            .as_deref()
            .is_some_and(|n| n.trim().is_empty())
            || update
                .owning_group
                .as_deref()
                .is_some_and(|g| g.trim().is_empty())
        {
            return Err(Error::Validation(
                "display_name and owning_group must not be blank".to_string(),
            ));
        }

        let guard = self.table.lock(device_id).await?;
        let device = self.devices.require(device_id)?;
        self.evaluator.require(principal, &device, Action::Admin)?;

        self.devices.apply_update(device_id, update)?;

        match update.disabled {
            Some(true) if device.state != DeviceState::Disabled => {
                if let Some(active) = self.table.get(device_id) {
                    self.end_lease(&guard, &active, EndReason::Disabled)?;
                }
                self.devices.set_state(device_id, DeviceState::Disabled)?;
                tracing::info!(device_id, by = %principal.id, "device disabled");
            }
            Some(false) if device.state == DeviceState::Disabled => {
                let state = if self.liveness.is_stale(&device, Utc::now()) {
                    DeviceState::Offline
                } else {
                    DeviceState::Available
                };
                self.devices.set_state(device_id, state)?;
                tracing::info!(device_id, by = %principal.id, %state, "device enabled");
            }
            _ => {}
        }

        let device = self.devices.require(device_id)?;
        self.hub.publish(&Event::device_status(&device)).await;
        Ok(device)
    }

    /// Take a device with a stale heartbeat offline
    ///
    /// Any open session is closed with reason `evicted`. Returns whether a
    /// transition happened; a device that is already offline or disabled,
    /// or whose heartbeat has recovered, is left alone.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices
    pub async fn evict_stale(&self, device_id: &str) -> Result<bool> {
        self.evict_stale_inner(device_id)
            .await
            .map_err(Error::normalize)
    }

    async fn evict_stale_inner(&self, device_id: &str) -> Result<bool> {
        let guard = self.table.lock(device_id).await?;
        let mut device = self.devices.require(device_id)?;

        if !matches!(device.state, DeviceState::Available | DeviceState::Leased)
            || !self.liveness.is_stale(&device, Utc::now())
        {
            return Ok(false);
        }

        if let Some(active) = self.table.get(device_id) {
            self.end_lease(&guard, &active, EndReason::Evicted)?;
        }
        self.devices.set_state(device_id, DeviceState::Offline)?;

        tracing::warn!(device_id, last_heartbeat = %device.last_heartbeat, "device offline");

        let message = match &device.current_holder {
            Some(holder) => format!("device '{device_id}' went offline; lease of '{holder}' ended"),
            None => format!("device '{device_id}' went offline"),
        };
        device.state = DeviceState::Offline;
        device.current_holder = None;
        self.hub
            .publish(&Event::alert(
                device_id,
                Some(device.owning_group.clone()),
                message,
            ))
            .await;
        self.hub.publish(&Event::device_status(&device)).await;

        Ok(true)
    }

    /// End a lease whose connection has been inactive since `cutoff`
    ///
    /// Returns whether a lease was ended.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices
    pub async fn evict_idle(&self, device_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        self.evict_idle_inner(device_id, cutoff)
            .await
            .map_err(Error::normalize)
    }

    async fn evict_idle_inner(&self, device_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let guard = self.table.lock(device_id).await?;

        let Some(active) = self.table.get(device_id) else {
            return Ok(false);
        };
        if active.last_active >= cutoff {
            return Ok(false);
        }

        let mut device = self.devices.require(device_id)?;
        self.end_lease(&guard, &active, EndReason::Idle)?;
        self.devices.set_state(device_id, DeviceState::Available)?;

        tracing::info!(device_id, holder = %active.holder, last_active = %active.last_active, "idle lease evicted");

        device.state = DeviceState::Available;
        device.current_holder = None;
        self.hub.publish(&Event::device_status(&device)).await;
        Ok(true)
    }

    /// Bring an offline device with a fresh heartbeat back to available
    ///
    /// Returns whether a transition happened.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices
    pub async fn restore(&self, device_id: &str) -> Result<bool> {
        self.restore_inner(device_id)
            .await
            .map_err(Error::normalize)
    }

    async fn restore_inner(&self, device_id: &str) -> Result<bool> {
        let _guard = self.table.lock(device_id).await?;
        let mut device = self.devices.require(device_id)?;

        if device.state != DeviceState::Offline || self.liveness.is_stale(&device, Utc::now()) {
            return Ok(false);
        }

        self.devices.set_state(device_id, DeviceState::Available)?;
        tracing::info!(device_id, "device back online");

        device.state = DeviceState::Available;
        self.hub.publish(&Event::device_status(&device)).await;
        Ok(true)
    }

    /// Close a lease's session and drop it from the table
    fn end_lease(&self, guard: &DeviceGuard, active: &ActiveLease, reason: EndReason) -> Result<i64> {
        self.table.remove(guard);
        match self.ledger.close(&active.session_id, reason) {
            Ok(duration_ms) => Ok(duration_ms),
            Err(Error::Conflict(_)) => {
                tracing::warn!(
                    device_id = guard.device_id(),
                    session_id = %active.session_id,
                    "session already closed"
                );
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn reservation_at(&self, device_id: &str, at: DateTime<Utc>) -> Result<Option<Reservation>> {
        Ok(self
            .reservations
            .approved_for_device(device_id)?
            .into_iter()
            .find(|r| r.covers(at)))
    }
}
