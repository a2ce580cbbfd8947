//! Future device bookings
//!
//! Requests start pending and only approved reservations block others.
//! Approval re-checks for overlap under the same per-device guard the lease
//! coordinator uses, so two overlapping requests can never both end up
//! approved.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::access::{Action, PermissionEvaluator, Principal};
use crate::db::{
    DbPool, Device, DeviceRepo, GrantRepo, Reservation, ReservationFilter, ReservationRepo,
    ReservationStatus, SharingRepo,
};
use crate::lease::LeaseTable;
use crate::notify::{Event, NotificationHub};
use crate::window::TimeWindow;
use crate::{Error, Result};

/// Books, approves and cancels reservations
pub struct ReservationPlanner {
    table: Arc<LeaseTable>,
    devices: DeviceRepo,
    reservations: ReservationRepo,
    evaluator: PermissionEvaluator,
    hub: Arc<NotificationHub>,
}

impl ReservationPlanner {
    /// Create a planner sharing the coordinator's lease table
    #[must_use]
    pub fn new(pool: &DbPool, table: Arc<LeaseTable>, hub: Arc<NotificationHub>) -> Self {
        Self {
            table,
            devices: DeviceRepo::new(pool.clone()),
            reservations: ReservationRepo::new(pool.clone()),
            evaluator: PermissionEvaluator::new(
                GrantRepo::new(pool.clone()),
                SharingRepo::new(pool.clone()),
            ),
            hub,
        }
    }

    /// Request a booking of `[start, end)`
    ///
    /// # Errors
    ///
    /// - `Validation` if `start >= end` or the window already ended
    /// - `NotFound` for unknown devices
    /// - `PermissionDenied` without `use` permission
    /// - `Conflict` if an approved reservation overlaps
    pub async fn create(
        &self,
        device_id: &str,
        principal: &Principal,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        remarks: Option<&str>,
    ) -> Result<Reservation> {
        self.create_inner(device_id, principal, start, end, remarks)
            .await
            .map_err(Error::normalize)
    }

    async fn create_inner(
        &self,
        device_id: &str,
        principal: &Principal,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        remarks: Option<&str>,
    ) -> Result<Reservation> {
        let window = TimeWindow::new(start, end)?;
        if window.end <= Utc::now() {
            return Err(Error::Validation("reservation window has already ended".to_string()));
        }

        let _guard = self.table.lock(device_id).await?;
        let device = self.devices.require(device_id)?;
        self.evaluator.require(principal, &device, Action::Use)?;
        self.ensure_free(device_id, &window, None)?;

        let reservation = self
            .reservations
            .insert(device_id, &principal.id, start, end, remarks)?;

        tracing::info!(
            reservation_id = %reservation.id,
            device_id,
            requester = %principal.id,
            %start,
            %end,
            "reservation requested"
        );
        self.announce(&device, &reservation, "reservation_created").await;
        Ok(reservation)
    }

    /// Approve or reject a pending reservation
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown reservations
    /// - `PermissionDenied` without admin on the device
    /// - `Conflict` if the reservation is no longer pending, or approval
    ///   would overlap an approved reservation
    pub async fn handle(
        &self,
        reservation_id: &str,
        approver: &Principal,
        approve: bool,
        remarks: Option<&str>,
    ) -> Result<Reservation> {
        self.handle_inner(reservation_id, approver, approve, remarks)
            .await
            .map_err(Error::normalize)
    }

    async fn handle_inner(
        &self,
        reservation_id: &str,
        approver: &Principal,
        approve: bool,
        remarks: Option<&str>,
    ) -> Result<Reservation> {
        let device_id = self.require(reservation_id)?.device_id;

        let _guard = self.table.lock(&device_id).await?;
        // Re-read under the guard; a concurrent decision may have landed
        let reservation = self.require(reservation_id)?;
        let device = self.devices.require(&device_id)?;
        self.evaluator.require(approver, &device, Action::Admin)?;

        if reservation.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "reservation '{reservation_id}' is already {}",
                reservation.status
            )));
        }

        let status = if approve {
            let window = TimeWindow::new(reservation.start_time, reservation.end_time)?;
            self.ensure_free(&device_id, &window, Some(reservation_id))?;
            ReservationStatus::Approved
        } else {
            ReservationStatus::Rejected
        };

        self.transition(&device, reservation_id, status, &approver.id, remarks)
            .await
    }

    /// Withdraw a pending reservation
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown reservations
    /// - `PermissionDenied` unless the caller is the requester or a device
    ///   admin
    /// - `Conflict` if the reservation is no longer pending
    pub async fn cancel(&self, reservation_id: &str, principal: &Principal) -> Result<Reservation> {
        self.cancel_inner(reservation_id, principal)
            .await
            .map_err(Error::normalize)
    }

    async fn cancel_inner(&self, reservation_id: &str, principal: &Principal) -> Result<Reservation> {
        let device_id = self.require(reservation_id)?.device_id;

        let _guard = self.table.lock(&device_id).await?;
        let reservation = self.require(reservation_id)?;
        let device = self.devices.require(&device_id)?;

        if reservation.requester_id != principal.id
            && !self.evaluator.check(principal, &device, Action::Admin)
        {
            return Err(Error::PermissionDenied(
                "only the requester or a device admin may cancel".to_string(),
            ));
        }
        if reservation.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "reservation '{reservation_id}' is already {}",
                reservation.status
            )));
        }

        self.transition(
            &device,
            reservation_id,
            ReservationStatus::Cancelled,
            &principal.id,
            None,
        )
        .await
    }

    /// Get one reservation
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown reservations
    pub fn get(&self, reservation_id: &str) -> Result<Reservation> {
        self.require(reservation_id).map_err(Error::normalize)
    }

    /// Reservations matching a filter
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the store cannot be read
    pub fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>> {
        self.reservations.list(filter).map_err(Error::normalize)
    }

    fn require(&self, reservation_id: &str) -> Result<Reservation> {
        self.reservations
            .get(reservation_id)?
            .ok_or_else(|| Error::NotFound(format!("reservation '{reservation_id}'")))
    }

    /// Fail with `Conflict` if an approved reservation overlaps `window`
    fn ensure_free(&self, device_id: &str, window: &TimeWindow, except: Option<&str>) -> Result<()> {
        let clash = self
            .reservations
            .approved_for_device(device_id)?
            .into_iter()
            .filter(|r| except != Some(r.id.as_str()))
            .find(|r| {
                window.overlaps(&TimeWindow {
                    start: r.start_time,
                    end: r.end_time,
                })
            });

        match clash {
            Some(r) => Err(Error::Conflict(format!(
                "overlaps approved reservation '{}' ({} to {})",
                r.id, r.start_time, r.end_time
            ))),
            None => Ok(()),
        }
    }

    async fn transition(
        &self,
        device: &Device,
        reservation_id: &str,
        status: ReservationStatus,
        by: &str,
        remarks: Option<&str>,
    ) -> Result<Reservation> {
        if !self
            .reservations
            .set_status(reservation_id, status, by, remarks)?
        {
            return Err(Error::Conflict(format!(
                "reservation '{reservation_id}' is no longer pending"
            )));
        }

        let reservation = self.require(reservation_id)?;
        tracing::info!(reservation_id, device_id = %device.id, %status, by, "reservation decided");

        let action = match status {
            ReservationStatus::Approved => "reservation_approved",
            ReservationStatus::Rejected => "reservation_rejected",
            ReservationStatus::Cancelled => "reservation_cancelled",
            ReservationStatus::Pending => "reservation_created",
        };
        self.announce(device, &reservation, action).await;
        Ok(reservation)
    }

    async fn announce(&self, device: &Device, reservation: &Reservation, action: &str) {
        self.hub
            .publish(&Event::config_change(
                device.id.clone(),
                Some(device.owning_group.clone()),
                serde_json::json!({ "action": action, "reservation": reservation }),
            ))
            .await;
    }
}
