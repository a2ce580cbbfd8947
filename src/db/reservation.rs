//! Reservation repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, conn, format_ts, ts_column};
use crate::{Error, Result};

/// Approval state of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are final
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booking of a device over a half-open window
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub id: String,
    pub device_id: String,
    pub requester_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReservationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Whether the window contains `at`
    #[must_use]
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.start_time <= at && at < self.end_time
    }
}

/// Optional filters for listing reservations
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReservationFilter {
    pub device_id: Option<String>,
    pub requester_id: Option<String>,
    pub status: Option<ReservationStatus>,
}

const RESERVATION_COLUMNS: &str = "id, device_id, requester_id, start_time, end_time, status,
     remarks, handled_by, created_at, updated_at";

fn map_reservation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reservation> {
    let status: String = row.get(5)?;
    Ok(Reservation {
        id: row.get(0)?,
        device_id: row.get(1)?,
        requester_id: row.get(2)?,
        start_time: ts_column(row, 3)?,
        end_time: ts_column(row, 4)?,
        status: ReservationStatus::parse(&status).unwrap_or(ReservationStatus::Cancelled),
        remarks: row.get(6)?,
        handled_by: row.get(7)?,
        created_at: ts_column(row, 8)?,
        updated_at: ts_column(row, 9)?,
    })
}

/// Reservation repository
#[derive(Clone)]
pub struct ReservationRepo {
    pool: DbPool,
}

impl ReservationRepo {
    /// Create a new reservation repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a pending reservation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(
        &self,
        device_id: &str,
        requester_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        remarks: Option<&str>,
    ) -> Result<Reservation> {
        let conn = conn(&self.pool)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_s = format_ts(now);

        conn.execute(
            "INSERT INTO reservations (id, device_id, requester_id, start_time, end_time, status, remarks, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)",
            rusqlite::params![
                id,
                device_id,
                requester_id,
                format_ts(start),
                format_ts(end),
                remarks,
                now_s
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Reservation {
            id,
            device_id: device_id.to_string(),
            requester_id: requester_id.to_string(),
            start_time: start,
            end_time: end,
            status: ReservationStatus::Pending,
            remarks: remarks.map(String::from),
            handled_by: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a reservation by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<Reservation>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?1"),
            [id],
            map_reservation,
        );

        match result {
            Ok(reservation) => Ok(Some(reservation)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// Approved reservations on a device, ordered by start
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn approved_for_device(&self, device_id: &str) -> Result<Vec<Reservation>> {
        self.query(
            &format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations
                 WHERE device_id = ?1 AND status = 'approved'
                 ORDER BY start_time"
            ),
            &[&device_id],
        )
    }

    /// Move a pending reservation into `status`
    ///
    /// Returns `false` when the row is missing or no longer pending.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(
        &self,
        id: &str,
        status: ReservationStatus,
        handled_by: &str,
        remarks: Option<&str>,
    ) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute(
                "UPDATE reservations SET
                    status = ?2,
                    handled_by = ?3,
                    remarks = COALESCE(?4, remarks),
                    updated_at = ?5
                 WHERE id = ?1 AND status = 'pending'",
                rusqlite::params![id, status.as_str(), handled_by, remarks, format_ts(Utc::now())],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows > 0)
    }

    /// List reservations matching a filter, ordered by start
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>> {
        let status = filter.status.map(ReservationStatus::as_str);
        self.query(
            &format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations
                 WHERE (?1 IS NULL OR device_id = ?1)
                   AND (?2 IS NULL OR requester_id = ?2)
                   AND (?3 IS NULL OR status = ?3)
                 ORDER BY start_time"
            ),
            &[&filter.device_id, &filter.requester_id, &status],
        )
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Reservation>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(e.to_string()))?;

        let reservations = stmt
            .query_map(params, map_reservation)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(reservations)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::{DeviceRepo, init_memory};

    fn setup() -> ReservationRepo {
        let pool = init_memory().unwrap();
        DeviceRepo::new(pool.clone())
            .upsert_announced("d1", None, "Dongle", "lab", Utc::now())
            .unwrap();
        ReservationRepo::new(pool)
    }

    #[test]
    fn status_transitions_only_from_pending() {
        let repo = setup();
        let start = Utc::now() + Duration::hours(1);
        let r = repo
            .insert("d1", "alice", start, start + Duration::hours(1), None)
            .unwrap();

        assert!(repo
            .set_status(&r.id, ReservationStatus::Approved, "root", Some("ok"))
            .unwrap());
        assert!(!repo
            .set_status(&r.id, ReservationStatus::Rejected, "root", None)
            .unwrap());

        let stored = repo.get(&r.id).unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Approved);
        assert_eq!(stored.handled_by.as_deref(), Some("root"));
        assert_eq!(stored.remarks.as_deref(), Some("ok"));
    }

    #[test]
    fn list_applies_filters() {
        let repo = setup();
        let start = Utc::now() + Duration::hours(1);
        let a = repo
            .insert("d1", "alice", start, start + Duration::hours(1), None)
            .unwrap();
        repo.insert("d1", "bob", start, start + Duration::hours(1), None)
            .unwrap();
        repo.set_status(&a.id, ReservationStatus::Approved, "root", None)
            .unwrap();

        let approved = repo
            .list(&ReservationFilter {
                status: Some(ReservationStatus::Approved),
                ..ReservationFilter::default()
            })
            .unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].requester_id, "alice");

        let bobs = repo
            .list(&ReservationFilter {
                requester_id: Some("bob".to_string()),
                ..ReservationFilter::default()
            })
            .unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(repo.list(&ReservationFilter::default()).unwrap().len(), 2);
        assert_eq!(repo.approved_for_device("d1").unwrap().len(), 1);
    }

    #[test]
    fn covers_is_half_open() {
        let repo = setup();
        let start = Utc::now() + Duration::hours(1);
        let end = start + Duration::hours(1);
        let r = repo.insert("d1", "alice", start, end, None).unwrap();

        assert!(r.covers(start));
        assert!(!r.covers(end));
    }
}
