//! Usage session repository
//!
//! Sessions are append-only: a row is inserted open, closed exactly once,
//! and afterwards only adjusted through correction records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, conn, format_ts, is_unique_violation, opt_ts_column, ts_column};
use crate::{Error, Result};

/// Why a usage session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Holder released the device
    Released,
    /// An administrator disconnected the holder
    Forced,
    /// Device went offline
    Evicted,
    /// Holder's connection stayed idle too long
    Idle,
    /// Device was administratively disabled
    Disabled,
}

impl EndReason {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Forced => "forced",
            Self::Evicted => "evicted",
            Self::Idle => "idle",
            Self::Disabled => "disabled",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "released" => Some(Self::Released),
            "forced" => Some(Self::Forced),
            "evicted" => Some(Self::Evicted),
            "idle" => Some(Self::Idle),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One span of a principal holding a device
#[derive(Debug, Clone, Serialize)]
pub struct UsageSession {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    /// The user's group when the session opened
    pub group_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

impl UsageSession {
    /// Whether the session is still open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Compensating adjustment against a closed session
#[derive(Debug, Clone, Serialize)]
pub struct UsageCorrection {
    pub id: String,
    pub session_id: String,
    pub delta_ms: i64,
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

/// Optional filters for querying usage history
///
/// `from`/`to` select sessions overlapping the window.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageFilter {
    pub device_id: Option<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

const SESSION_COLUMNS: &str =
    "id, device_id, user_id, group_id, start_time, end_time, duration_ms, end_reason";

fn map_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageSession> {
    let reason: Option<String> = row.get(7)?;
    Ok(UsageSession {
        id: row.get(0)?,
        device_id: row.get(1)?,
        user_id: row.get(2)?,
        group_id: row.get(3)?,
        start_time: ts_column(row, 4)?,
        end_time: opt_ts_column(row, 5)?,
        duration_ms: row.get(6)?,
        end_reason: reason.as_deref().and_then(EndReason::parse),
    })
}

fn map_correction(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageCorrection> {
    Ok(UsageCorrection {
        id: row.get(0)?,
        session_id: row.get(1)?,
        delta_ms: row.get(2)?,
        remarks: row.get(3)?,
        created_at: ts_column(row, 4)?,
    })
}

/// Usage session repository
#[derive(Clone)]
pub struct UsageRepo {
    pool: DbPool,
}

impl UsageRepo {
    /// Create a new usage repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert an open session
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the device already has an open session, or a
    /// database error
    pub fn insert_open(
        &self,
        device_id: &str,
        user_id: &str,
        group_id: &str,
        start: DateTime<Utc>,
    ) -> Result<UsageSession> {
        let conn = conn(&self.pool)?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO usage_sessions (id, device_id, user_id, group_id, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, device_id, user_id, group_id, format_ts(start)],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("device '{device_id}' already has an open session"))
            } else {
                Error::Database(e.to_string())
            }
        })?;

        Ok(UsageSession {
            id,
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            start_time: start,
            end_time: None,
            duration_ms: None,
            end_reason: None,
        })
    }

    /// Close an open session
    ///
    /// Returns `false` when the session is missing or already closed.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn close(
        &self,
        id: &str,
        end: DateTime<Utc>,
        duration_ms: i64,
        reason: EndReason,
    ) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute(
                "UPDATE usage_sessions SET end_time = ?2, duration_ms = ?3, end_reason = ?4
                 WHERE id = ?1 AND end_time IS NULL",
                rusqlite::params![id, format_ts(end), duration_ms, reason.as_str()],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows > 0)
    }

    /// Get a session by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<UsageSession>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM usage_sessions WHERE id = ?1"),
            [id],
            map_session,
        );

        match result {
            Ok(session) => Ok(Some(session)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// The open session on a device, if any
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn open_for_device(&self, device_id: &str) -> Result<Option<UsageSession>> {
        Ok(self
            .query_sessions(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM usage_sessions
                     WHERE device_id = ?1 AND end_time IS NULL"
                ),
                &[&device_id],
            )?
            .into_iter()
            .next())
    }

    /// Every open session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn open_all(&self) -> Result<Vec<UsageSession>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM usage_sessions
                 WHERE end_time IS NULL ORDER BY start_time"
            ),
            &[],
        )
    }

    /// Sessions matching a filter, ordered by start
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn query(&self, filter: &UsageFilter) -> Result<Vec<UsageSession>> {
        let from = filter.from.map(format_ts);
        let to = filter.to.map(format_ts);
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM usage_sessions
                 WHERE (?1 IS NULL OR device_id = ?1)
                   AND (?2 IS NULL OR user_id = ?2)
                   AND (?3 IS NULL OR group_id = ?3)
                   AND (?4 IS NULL OR end_time IS NULL OR end_time > ?4)
                   AND (?5 IS NULL OR start_time < ?5)
                 ORDER BY start_time"
            ),
            &[
                &filter.device_id,
                &filter.user_id,
                &filter.group_id,
                &from,
                &to,
            ],
        )
    }

    fn query_sessions(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<UsageSession>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(e.to_string()))?;

        let sessions = stmt
            .query_map(params, map_session)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(sessions)
    }

    /// Append a correction record
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert_correction(
        &self,
        session_id: &str,
        delta_ms: i64,
        remarks: &str,
    ) -> Result<UsageCorrection> {
        let conn = conn(&self.pool)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO usage_corrections (id, session_id, delta_ms, remarks, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, session_id, delta_ms, remarks, format_ts(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(UsageCorrection {
            id,
            session_id: session_id.to_string(),
            delta_ms,
            remarks: remarks.to_string(),
            created_at: now,
        })
    }

    /// Corrections recorded against a session
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn corrections_for_session(&self, session_id: &str) -> Result<Vec<UsageCorrection>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, delta_ms, remarks, created_at
                 FROM usage_corrections WHERE session_id = ?1 ORDER BY created_at",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let corrections = stmt
            .query_map([session_id], map_correction)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(corrections)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::{DeviceRepo, init_memory};

    fn setup() -> UsageRepo {
        let pool = init_memory().unwrap();
        let devices = DeviceRepo::new(pool.clone());
        for id in ["d1", "d2"] {
            devices
                .upsert_announced(id, None, id, "lab", Utc::now())
                .unwrap();
        }
        UsageRepo::new(pool)
    }

    #[test]
    fn second_open_session_conflicts() {
        let repo = setup();
        repo.insert_open("d1", "alice", "lab", Utc::now()).unwrap();

        let err = repo
            .insert_open("d1", "bob", "lab", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Other devices are unaffected
        repo.insert_open("d2", "bob", "lab", Utc::now()).unwrap();
    }

    #[test]
    fn close_is_single_shot() {
        let repo = setup();
        let start = Utc::now() - Duration::minutes(5);
        let session = repo.insert_open("d1", "alice", "lab", start).unwrap();

        assert!(repo
            .close(&session.id, Utc::now(), 300_000, EndReason::Released)
            .unwrap());
        assert!(!repo
            .close(&session.id, Utc::now(), 1, EndReason::Forced)
            .unwrap());

        let stored = repo.get(&session.id).unwrap().unwrap();
        assert!(!stored.is_open());
        assert_eq!(stored.duration_ms, Some(300_000));
        assert_eq!(stored.end_reason, Some(EndReason::Released));
        assert!(repo.open_for_device("d1").unwrap().is_none());

        // A new session can open once the previous one closed
        repo.insert_open("d1", "bob", "lab", Utc::now()).unwrap();
    }

    #[test]
    fn query_selects_overlapping_sessions() {
        let repo = setup();
        let base = Utc::now() - Duration::hours(3);

        let early = repo.insert_open("d1", "alice", "lab", base).unwrap();
        repo.close(
            &early.id,
            base + Duration::hours(1),
            3_600_000,
            EndReason::Released,
        )
        .unwrap();
        repo.insert_open("d2", "bob", "ops", base + Duration::hours(2))
            .unwrap();

        let window = UsageFilter {
            from: Some(base + Duration::minutes(90)),
            ..UsageFilter::default()
        };
        let hits = repo.query(&window).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "bob");

        let by_group = UsageFilter {
            group_id: Some("lab".to_string()),
            ..UsageFilter::default()
        };
        assert_eq!(repo.query(&by_group).unwrap().len(), 1);
        assert_eq!(repo.open_all().unwrap().len(), 1);
    }

    #[test]
    fn corrections_are_appended() {
        let repo = setup();
        let session = repo.insert_open("d1", "alice", "lab", Utc::now()).unwrap();
        repo.insert_correction(&session.id, -1_000, "clock skew")
            .unwrap();
        repo.insert_correction(&session.id, 500, "partial refund")
            .unwrap();

        let corrections = repo.corrections_for_session(&session.id).unwrap();
        assert_eq!(corrections.len(), 2);
        assert_eq!(corrections.iter().map(|c| c.delta_ms).sum::<i64>(), -500);
    }
}
