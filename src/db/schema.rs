//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Agent nodes exposing devices
        CREATE TABLE IF NOT EXISTS agent_nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            healthy INTEGER NOT NULL DEFAULT 1,
            last_probe_at TEXT,
            last_probe_error TEXT,
            last_heartbeat TEXT,
            created_at TEXT NOT NULL
        );

        -- Leasable devices
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            node_id TEXT REFERENCES agent_nodes(id),
            display_name TEXT NOT NULL,
            owning_group TEXT NOT NULL,
            current_holder TEXT,
            state TEXT NOT NULL DEFAULT 'available'
                CHECK(state IN ('available', 'leased', 'offline', 'disabled')),
            last_heartbeat TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_devices_node ON devices(node_id);
        CREATE INDEX IF NOT EXISTS idx_devices_state ON devices(state, last_heartbeat);

        -- Explicit permission grants; device_id '*' matches every device
        CREATE TABLE IF NOT EXISTS grants (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            principal_id TEXT NOT NULL,
            permission TEXT NOT NULL CHECK(permission IN ('read', 'use', 'admin')),
            is_temporary INTEGER NOT NULL DEFAULT 0,
            valid_until TEXT,
            granted_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_grants_principal ON grants(principal_id, device_id);
        CREATE INDEX IF NOT EXISTS idx_grants_expiry ON grants(valid_until);

        -- Group-to-group sharing policy
        CREATE TABLE IF NOT EXISTS sharing_agreements (
            source_group TEXT NOT NULL,
            target_group TEXT NOT NULL,
            allow_sharing INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (source_group, target_group)
        );

        -- Future device bookings
        CREATE TABLE IF NOT EXISTS reservations (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL REFERENCES devices(id),
            requester_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK(status IN ('pending', 'approved', 'rejected', 'cancelled')),
            remarks TEXT,
            handled_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK(start_time < end_time)
        );

        CREATE INDEX IF NOT EXISTS idx_reservations_device ON reservations(device_id, status);

        -- Usage sessions (append-only once closed)
        CREATE TABLE IF NOT EXISTS usage_sessions (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL REFERENCES devices(id),
            user_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_ms INTEGER,
            end_reason TEXT
                CHECK(end_reason IS NULL OR end_reason IN ('released', 'forced', 'evicted', 'idle', 'disabled'))
        );

        CREATE INDEX IF NOT EXISTS idx_usage_device ON usage_sessions(device_id, start_time);
        CREATE INDEX IF NOT EXISTS idx_usage_group ON usage_sessions(group_id, start_time);

        -- At most one open session per device
        CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_open
            ON usage_sessions(device_id) WHERE end_time IS NULL;

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Compensating records against closed sessions
        CREATE TABLE IF NOT EXISTS usage_corrections (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES usage_sessions(id),
            delta_ms INTEGER NOT NULL,
            remarks TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_usage_corrections_session ON usage_corrections(session_id);

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn open_session_index_rejects_second_open_row() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO devices (id, display_name, owning_group, last_heartbeat, created_at, updated_at)
             VALUES ('d1', 'Dongle', 'g1', 'x', 'x', 'x');
             INSERT INTO usage_sessions (id, device_id, user_id, group_id, start_time)
             VALUES ('s1', 'd1', 'u1', 'g1', 'x');",
        )
        .unwrap();

        let second = conn.execute(
            "INSERT INTO usage_sessions (id, device_id, user_id, group_id, start_time)
             VALUES ('s2', 'd1', 'u2', 'g1', 'x')",
            [],
        );
        assert!(second.is_err());
    }
}
