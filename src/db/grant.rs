//! Permission grants and group sharing agreements

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, conn, format_ts, opt_ts_column, ts_column};
use crate::{Error, Result};

/// Device id that matches every device in a grant
pub const ANY_DEVICE: &str = "*";

/// Permission level carried by a grant
///
/// Levels are ordered: `Admin` implies `Use`, which implies `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionType {
    Read,
    Use,
    Admin,
}

impl PermissionType {
    /// Stored representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Use => "use",
            Self::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "use" => Some(Self::Use),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Whether holding `self` is enough for `required`
    #[must_use]
    pub fn satisfies(self, required: Self) -> bool {
        self >= required
    }
}

impl std::fmt::Display for PermissionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An explicit permission record
#[derive(Debug, Clone, Serialize)]
pub struct Grant {
    pub id: String,
    /// Device id, or `*` for every device
    pub device_id: String,
    pub principal_id: String,
    pub permission: PermissionType,
    pub is_temporary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    pub granted_by: String,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    /// Whether the grant has lapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}

/// Fields for inserting a grant
#[derive(Debug, Clone)]
pub struct NewGrant<'a> {
    pub device_id: &'a str,
    pub principal_id: &'a str,
    pub permission: PermissionType,
    pub valid_until: Option<DateTime<Utc>>,
    pub granted_by: &'a str,
}

const GRANT_COLUMNS: &str =
    "id, device_id, principal_id, permission, is_temporary, valid_until, granted_by, created_at";

fn map_grant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Grant> {
    let permission: String = row.get(3)?;
    Ok(Grant {
        id: row.get(0)?,
        device_id: row.get(1)?,
        principal_id: row.get(2)?,
        // Unknown levels degrade to the weakest permission
        permission: PermissionType::parse(&permission).unwrap_or(PermissionType::Read),
        is_temporary: row.get(4)?,
        valid_until: opt_ts_column(row, 5)?,
        granted_by: row.get(6)?,
        created_at: ts_column(row, 7)?,
    })
}

/// Grant repository
#[derive(Clone)]
pub struct GrantRepo {
    pool: DbPool,
}

impl GrantRepo {
    /// Create a new grant repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a grant
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `valid_until` is not in the future, or a
    /// database error
    pub fn insert(&self, grant: &NewGrant<'_>) -> Result<Grant> {
        let now = Utc::now();
        if grant.valid_until.is_some_and(|until| until <= now) {
            return Err(Error::Validation(
                "valid_until must be later than the grant's creation time".to_string(),
            ));
        }

        let conn = conn(&self.pool)?;
        let id = Uuid::new_v4().to_string();
        let is_temporary = grant.valid_until.is_some();

        conn.execute(
            "INSERT INTO grants (id, device_id, principal_id, permission, is_temporary, valid_until, granted_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                grant.device_id,
                grant.principal_id,
                grant.permission.as_str(),
                is_temporary,
                grant.valid_until.map(format_ts),
                grant.granted_by,
                format_ts(now),
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::info!(
            grant_id = %id,
            device_id = grant.device_id,
            principal_id = grant.principal_id,
            permission = %grant.permission,
            "grant created"
        );

        Ok(Grant {
            id,
            device_id: grant.device_id.to_string(),
            principal_id: grant.principal_id.to_string(),
            permission: grant.permission,
            is_temporary,
            valid_until: grant.valid_until,
            granted_by: grant.granted_by.to_string(),
            created_at: now,
        })
    }

    /// Get a grant by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<Grant>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!("SELECT {GRANT_COLUMNS} FROM grants WHERE id = ?1"),
            [id],
            map_grant,
        );

        match result {
            Ok(grant) => Ok(Some(grant)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// Unexpired grants held by a principal on a device (including `*`)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn active_for(
        &self,
        principal_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Grant>> {
        let now = format_ts(now);
        self.query(
            &format!(
                "SELECT {GRANT_COLUMNS} FROM grants
                 WHERE principal_id = ?1 AND (device_id = ?2 OR device_id = '{ANY_DEVICE}')
                   AND (valid_until IS NULL OR valid_until > ?3)"
            ),
            &[&principal_id, &device_id, &now],
        )
    }

    /// Every grant stored for a principal, expired ones included
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_principal(&self, principal_id: &str) -> Result<Vec<Grant>> {
        self.query(
            &format!(
                "SELECT {GRANT_COLUMNS} FROM grants WHERE principal_id = ?1 ORDER BY created_at"
            ),
            &[&principal_id],
        )
    }

    fn query(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Grant>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(e.to_string()))?;

        let grants = stmt
            .query_map(params, map_grant)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(grants)
    }

    /// Delete a grant
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute("DELETE FROM grants WHERE id = ?1", [id])
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows > 0 {
            tracing::info!(grant_id = id, "grant revoked");
        }
        Ok(rows > 0)
    }

    /// Physically remove grants that expired before `now`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = conn(&self.pool)?;
        conn.execute(
            "DELETE FROM grants WHERE valid_until IS NOT NULL AND valid_until <= ?1",
            [format_ts(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))
    }
}

/// Policy letting one group's devices be used by another group
#[derive(Debug, Clone, Serialize)]
pub struct SharingAgreement {
    pub source_group: String,
    pub target_group: String,
    pub allow_sharing: bool,
    pub updated_at: DateTime<Utc>,
}

fn map_agreement(row: &rusqlite::Row<'_>) -> rusqlite::Result<SharingAgreement> {
    Ok(SharingAgreement {
        source_group: row.get(0)?,
        target_group: row.get(1)?,
        allow_sharing: row.get(2)?,
        updated_at: ts_column(row, 3)?,
    })
}

/// Sharing agreement repository
#[derive(Clone)]
pub struct SharingRepo {
    pool: DbPool,
}

impl SharingRepo {
    /// Create a new sharing repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create or replace the agreement from `source` toward `target`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set(&self, source: &str, target: &str, allow: bool) -> Result<SharingAgreement> {
        let conn = conn(&self.pool)?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO sharing_agreements (source_group, target_group, allow_sharing, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_group, target_group) DO UPDATE SET
                allow_sharing = excluded.allow_sharing,
                updated_at = excluded.updated_at",
            rusqlite::params![source, target, allow, format_ts(now)],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        tracing::info!(source, target, allow, "sharing agreement updated");

        Ok(SharingAgreement {
            source_group: source.to_string(),
            target_group: target.to_string(),
            allow_sharing: allow,
            updated_at: now,
        })
    }

    /// Get the agreement from `source` toward `target`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, source: &str, target: &str) -> Result<Option<SharingAgreement>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            "SELECT source_group, target_group, allow_sharing, updated_at
             FROM sharing_agreements WHERE source_group = ?1 AND target_group = ?2",
            [source, target],
            map_agreement,
        );

        match result {
            Ok(agreement) => Ok(Some(agreement)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// List all agreements
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<SharingAgreement>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(
                "SELECT source_group, target_group, allow_sharing, updated_at
                 FROM sharing_agreements ORDER BY source_group, target_group",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let agreements = stmt
            .query_map([], map_agreement)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(agreements)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::init_memory;

    fn new_grant<'a>(device: &'a str, permission: PermissionType) -> NewGrant<'a> {
        NewGrant {
            device_id: device,
            principal_id: "alice",
            permission,
            valid_until: None,
            granted_by: "root",
        }
    }

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionType::Admin.satisfies(PermissionType::Use));
        assert!(PermissionType::Use.satisfies(PermissionType::Read));
        assert!(!PermissionType::Use.satisfies(PermissionType::Admin));
        assert!(!PermissionType::Read.satisfies(PermissionType::Use));
    }

    #[test]
    fn active_for_matches_wildcard_and_skips_expired() {
        let pool = init_memory().unwrap();
        let repo = GrantRepo::new(pool.clone());

        repo.insert(&new_grant("d1", PermissionType::Use)).unwrap();
        repo.insert(&new_grant(ANY_DEVICE, PermissionType::Read))
            .unwrap();
        repo.insert(&new_grant("d2", PermissionType::Admin)).unwrap();

        let temp = repo
            .insert(&NewGrant {
                valid_until: Some(Utc::now() + Duration::hours(1)),
                ..new_grant("d1", PermissionType::Admin)
            })
            .unwrap();
        assert!(temp.is_temporary);

        let now = Utc::now();
        assert_eq!(repo.active_for("alice", "d1", now).unwrap().len(), 3);

        // Once the temporary grant lapses it is inert
        let later = now + Duration::hours(2);
        let active = repo.active_for("alice", "d1", later).unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|g| g.id != temp.id));
    }

    #[test]
    fn insert_rejects_past_expiry() {
        let repo = GrantRepo::new(init_memory().unwrap());
        let err = repo
            .insert(&NewGrant {
                valid_until: Some(Utc::now() - Duration::minutes(1)),
                ..new_grant("d1", PermissionType::Use)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let repo = GrantRepo::new(init_memory().unwrap());
        repo.insert(&new_grant("d1", PermissionType::Use)).unwrap();
        repo.insert(&NewGrant {
            valid_until: Some(Utc::now() + Duration::minutes(5)),
            ..new_grant("d2", PermissionType::Use)
        })
        .unwrap();

        assert_eq!(repo.purge_expired(Utc::now()).unwrap(), 0);
        assert_eq!(
            repo.purge_expired(Utc::now() + Duration::minutes(10))
                .unwrap(),
            1
        );
        assert_eq!(repo.list_for_principal("alice").unwrap().len(), 1);
    }

    #[test]
    fn sharing_agreements_upsert() {
        let repo = SharingRepo::new(init_memory().unwrap());
        assert!(repo.get("g1", "g2").unwrap().is_none());

        repo.set("g1", "g2", true).unwrap();
        assert!(repo.get("g1", "g2").unwrap().unwrap().allow_sharing);

        repo.set("g1", "g2", false).unwrap();
        assert!(!repo.get("g1", "g2").unwrap().unwrap().allow_sharing);
        assert_eq!(repo.list().unwrap().len(), 1);
    }
}
