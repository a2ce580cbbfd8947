//! Device repository
//!
//! Devices are announced by agent nodes and mutated by the lease
//! coordinator and health tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DbPool, conn, format_ts, ts_column};
use crate::{Error, Result};

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Reachable and free to lease
    Available,
    /// Held by a principal through an open usage session
    Leased,
    /// Heartbeat went stale; not leasable until it returns
    Offline,
    /// Administratively taken out of service
    Disabled,
}

impl DeviceState {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Leased => "leased",
            Self::Offline => "offline",
            Self::Disabled => "disabled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "leased" => Some(Self::Leased),
            "offline" => Some(Self::Offline),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leasable device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub display_name: String,
    pub owning_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_holder: Option<String>,
    pub state: DeviceState,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrator-editable device fields
///
/// Every field is optional; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceUpdate {
    pub display_name: Option<String>,
    pub owning_group: Option<String>,
    pub disabled: Option<bool>,
}

impl DeviceUpdate {
    /// Whether the update carries no changes
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.owning_group.is_none() && self.disabled.is_none()
    }
}

const DEVICE_COLUMNS: &str = "id, node_id, display_name, owning_group, current_holder, state,
     last_heartbeat, created_at, updated_at";

fn map_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let state: String = row.get(5)?;
    Ok(Device {
        id: row.get(0)?,
        node_id: row.get(1)?,
        display_name: row.get(2)?,
        owning_group: row.get(3)?,
        current_holder: row.get(4)?,
        state: DeviceState::parse(&state).unwrap_or(DeviceState::Disabled),
        last_heartbeat: ts_column(row, 6)?,
        created_at: ts_column(row, 7)?,
        updated_at: ts_column(row, 8)?,
    })
}

/// Device repository
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

impl DeviceRepo {
    /// Create a new device repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a device announced by an agent, or refresh a known one
    ///
    /// A known device keeps its owning group, holder and state; only the
    /// node binding, display name and heartbeat are refreshed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert_announced(
        &self,
        id: &str,
        node_id: Option<&str>,
        display_name: &str,
        owning_group: &str,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let conn = conn(&self.pool)?;
        let now_s = format_ts(now);

        conn.execute(
            "INSERT INTO devices (id, node_id, display_name, owning_group, state, last_heartbeat, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'available', ?5, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                display_name = excluded.display_name,
                last_heartbeat = excluded.last_heartbeat,
                updated_at = excluded.updated_at",
            rusqlite::params![id, node_id, display_name, owning_group, now_s],
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        self.get(id)?
            .ok_or_else(|| Error::Internal(format!("device '{id}' vanished after upsert")))
    }

    /// Get a device by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<Device>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            [id],
            map_device,
        );

        match result {
            Ok(device) => Ok(Some(device)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// Get a device by ID, failing with `NotFound` when absent
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown devices, or a database error
    pub fn require(&self, id: &str) -> Result<Device> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("device '{id}'")))
    }

    /// List all devices
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<Device>> {
        self.query(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"), &[])
    }

    /// List devices exposed by one agent node
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_by_node(&self, node_id: &str) -> Result<Vec<Device>> {
        self.query(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE node_id = ?1 ORDER BY id"),
            &[&node_id],
        )
    }

    /// Devices still considered reachable whose heartbeat predates `cutoff`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let cutoff = format_ts(cutoff);
        self.query(
            &format!(
                "SELECT {DEVICE_COLUMNS} FROM devices
                 WHERE state IN ('available', 'leased') AND last_heartbeat < ?1
                 ORDER BY id"
            ),
            &[&cutoff],
        )
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Device>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(e.to_string()))?;

        let devices = stmt
            .query_map(params, map_device)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(devices)
    }

    /// Mark a device leased by `holder`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the device does not exist, or a database error
    pub fn mark_leased(&self, id: &str, holder: &str) -> Result<()> {
        self.write(
            "UPDATE devices SET state = 'leased', current_holder = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, holder, format_ts(Utc::now())],
            id,
        )
    }

    /// Clear the holder and set a holder-less state
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the device does not exist, or a database error
    pub fn set_state(&self, id: &str, state: DeviceState) -> Result<()> {
        self.write(
            "UPDATE devices SET state = ?2, current_holder = NULL, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, state.as_str(), format_ts(Utc::now())],
            id,
        )
    }

    /// Apply the descriptive fields of an update
    ///
    /// The `disabled` flag is a state transition and is handled by the
    /// lease coordinator.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the device does not exist, or a database error
    pub fn apply_update(&self, id: &str, update: &DeviceUpdate) -> Result<()> {
        self.write(
            "UPDATE devices SET
                display_name = COALESCE(?2, display_name),
                owning_group = COALESCE(?3, owning_group),
                updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![
                id,
                update.display_name,
                update.owning_group,
                format_ts(Utc::now())
            ],
            id,
        )
    }

    /// Record a heartbeat for one device
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the device does not exist, or a database error
    pub fn touch_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.write(
            "UPDATE devices SET last_heartbeat = ?2 WHERE id = ?1",
            rusqlite::params![id, format_ts(at)],
            id,
        )
    }

    /// Record a heartbeat for every device of a node, returning the count
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch_node_heartbeats(&self, node_id: &str, at: DateTime<Utc>) -> Result<usize> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "UPDATE devices SET last_heartbeat = ?2 WHERE node_id = ?1",
            rusqlite::params![node_id, format_ts(at)],
        )
        .map_err(|e| Error::Database(e.to_string()))
    }

    fn write(&self, sql: &str, params: impl rusqlite::Params, id: &str) -> Result<()> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute(sql, params)
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows == 0 {
            return Err(Error::NotFound(format!("device '{id}'")));
        }
        Ok(())
    }
}
