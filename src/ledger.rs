//! Usage accounting
//!
//! The ledger opens a session when a lease starts and closes it exactly once
//! when the lease ends. Closed sessions are never edited; adjustments are
//! appended as corrections and folded into utilization.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::access::Principal;
use crate::db::{EndReason, UsageCorrection, UsageFilter, UsageRepo, UsageSession};
use crate::window::TimeWindow;
use crate::{Error, Result};

/// What utilization is computed over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum UsageScope {
    Device(String),
    Group(String),
}

/// Active time over a window
#[derive(Debug, Clone, Serialize)]
pub struct Utilization {
    pub scope: UsageScope,
    pub window: TimeWindow,
    /// Session time inside the window, corrections applied
    pub active_ms: i64,
    pub window_ms: i64,
    /// `active_ms / window_ms`; may exceed 1 for a group with several devices
    pub ratio: f64,
    /// Sessions overlapping the window
    pub sessions: usize,
}

/// Append-only usage ledger
#[derive(Clone)]
pub struct UsageLedger {
    usage: UsageRepo,
}

impl UsageLedger {
    /// Create a ledger over the usage store
    #[must_use]
    pub const fn new(usage: UsageRepo) -> Self {
        Self { usage }
    }

    /// Open a session for `principal` on a device
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the device already has an open session
    pub fn open(&self, device_id: &str, principal: &Principal) -> Result<UsageSession> {
        let session =
            self.usage
                .insert_open(device_id, &principal.id, &principal.group_id, Utc::now())?;
        tracing::debug!(session_id = %session.id, device_id, user = %principal.id, "session opened");
        Ok(session)
    }

    /// Close a session, returning its duration in milliseconds
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sessions, `Conflict` if already closed
    pub fn close(&self, session_id: &str, reason: EndReason) -> Result<i64> {
        let session = self
            .usage
            .get(session_id)?
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;

        let end = Utc::now().max(session.start_time);
        let duration_ms = (end - session.start_time).num_milliseconds();

        if !self.usage.close(session_id, end, duration_ms, reason)? {
            return Err(Error::Conflict(format!(
                "session '{session_id}' is already closed"
            )));
        }

        tracing::debug!(session_id, duration_ms, %reason, "session closed");
        Ok(duration_ms)
    }

    /// Append a correction to a closed session
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sessions, `Validation` for an open
    /// session, a zero delta, or empty remarks
    pub fn compensate(
        &self,
        session_id: &str,
        delta_ms: i64,
        remarks: &str,
    ) -> Result<UsageCorrection> {
        if delta_ms == 0 {
            return Err(Error::Validation("correction delta must be non-zero".to_string()));
        }
        if remarks.trim().is_empty() {
            return Err(Error::Validation("correction remarks are required".to_string()));
        }

        let session = self
            .usage
            .get(session_id)?
            .ok_or_else(|| Error::NotFound(format!("session '{session_id}'")))?;
        if session.is_open() {
            return Err(Error::Validation(format!(
                "session '{session_id}' is still open"
            )));
        }

        let correction = self.usage.insert_correction(session_id, delta_ms, remarks)?;
        tracing::info!(session_id, delta_ms, "usage correction recorded");
        Ok(correction)
    }

    /// The open session on a device, if any
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn open_session(&self, device_id: &str) -> Result<Option<UsageSession>> {
        self.usage.open_for_device(device_id)
    }

    /// Every open session
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn open_sessions(&self) -> Result<Vec<UsageSession>> {
        self.usage.open_all()
    }

    /// Sessions matching a filter
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn history(&self, filter: &UsageFilter) -> Result<Vec<UsageSession>> {
        self.usage.query(filter)
    }

    /// Corrections recorded against a session
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn corrections(&self, session_id: &str) -> Result<Vec<UsageCorrection>> {
        self.usage.corrections_for_session(session_id)
    }

    /// Fraction of a window during which the scope was in use
    ///
    /// Sessions are clipped to the window, open sessions count up to now,
    /// and corrections of every counted session are added on top. The
    /// corrected total never drops below zero.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    pub fn utilization(&self, scope: &UsageScope, window: TimeWindow) -> Result<Utilization> {
        let mut filter = UsageFilter {
            from: Some(window.start),
            to: Some(window.end),
            ..UsageFilter::default()
        };
        match scope {
            UsageScope::Device(id) => filter.device_id = Some(id.clone()),
            UsageScope::Group(id) => filter.group_id = Some(id.clone()),
        }

        let now = Utc::now();
        let mut active_ms = 0_i64;
        let mut sessions = 0_usize;

        for session in self.usage.query(&filter)? {
            let end = session.end_time.unwrap_or(now);
            let clipped = window.clipped_ms(session.start_time, end);
            if clipped == 0 {
                continue;
            }
            sessions += 1;
            active_ms += clipped;
            active_ms += self
                .usage
                .corrections_for_session(&session.id)?
                .iter()
                .map(|c| c.delta_ms)
                .sum::<i64>();
        }

        let active_ms = active_ms.max(0);
        let window_ms = window.duration_ms();
        #[allow(clippy::cast_precision_loss)]
        let ratio = active_ms as f64 / window_ms as f64;

        Ok(Utilization {
            scope: scope.clone(),
            window,
            active_ms,
            window_ms,
            ratio,
            sessions,
        })
    }
}
