//! Agent node repository

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{DbPool, conn, format_ts, opt_ts_column, ts_column};
use crate::{Error, Result};

/// A remote agent exposing devices to the coordinator
#[derive(Debug, Clone, Serialize)]
pub struct AgentNode {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub is_active: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const NODE_COLUMNS: &str = "id, name, host, port, is_active, healthy, last_probe_at,
     last_probe_error, last_heartbeat, created_at";

fn map_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentNode> {
    Ok(AgentNode {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        is_active: row.get(4)?,
        healthy: row.get(5)?,
        last_probe_at: opt_ts_column(row, 6)?,
        last_probe_error: row.get(7)?,
        last_heartbeat: opt_ts_column(row, 8)?,
        created_at: ts_column(row, 9)?,
    })
}

/// Agent node repository
#[derive(Clone)]
pub struct NodeRepo {
    pool: DbPool,
}

impl NodeRepo {
    /// Create a new node repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a node by name, reactivating and re-addressing a known one
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn register(&self, name: &str, host: &str, port: u16) -> Result<AgentNode> {
        let conn = conn(&self.pool)?;
        let now = format_ts(Utc::now());

        conn.execute(
            "INSERT INTO agent_nodes (id, name, host, port, is_active, healthy, last_heartbeat, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, 1, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                is_active = 1,
                last_heartbeat = excluded.last_heartbeat",
            rusqlite::params![Uuid::new_v4().to_string(), name, host, port, now],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        let node = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM agent_nodes WHERE name = ?1"),
                [name],
                map_node,
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        tracing::info!(node_id = %node.id, name, host, port, "agent node registered");
        Ok(node)
    }

    /// Get a node by ID
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, id: &str) -> Result<Option<AgentNode>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!("SELECT {NODE_COLUMNS} FROM agent_nodes WHERE id = ?1"),
            [id],
            map_node,
        );

        match result {
            Ok(node) => Ok(Some(node)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// List all nodes
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<AgentNode>> {
        self.query(&format!("SELECT {NODE_COLUMNS} FROM agent_nodes ORDER BY name"))
    }

    /// List nodes that should be probed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_active(&self) -> Result<Vec<AgentNode>> {
        self.query(&format!(
            "SELECT {NODE_COLUMNS} FROM agent_nodes WHERE is_active = 1 ORDER BY name"
        ))
    }

    fn query(&self, sql: &str) -> Result<Vec<AgentNode>> {
        let conn = conn(&self.pool)?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(e.to_string()))?;

        let nodes = stmt
            .query_map([], map_node)
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(nodes)
    }

    /// Store the outcome of a liveness probe
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown nodes, or a database error
    pub fn record_probe(
        &self,
        id: &str,
        healthy: bool,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute(
                "UPDATE agent_nodes SET healthy = ?2, last_probe_error = ?3, last_probe_at = ?4
                 WHERE id = ?1",
                rusqlite::params![id, healthy, error, format_ts(at)],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows == 0 {
            return Err(Error::NotFound(format!("node '{id}'")));
        }
        Ok(())
    }

    /// Record an inbound heartbeat from a node
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown nodes, or a database error
    pub fn touch_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute(
                "UPDATE agent_nodes SET last_heartbeat = ?2 WHERE id = ?1",
                rusqlite::params![id, format_ts(at)],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows == 0 {
            return Err(Error::NotFound(format!("node '{id}'")));
        }
        Ok(())
    }

    /// Enable or disable probing of a node
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown nodes, or a database error
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let conn = conn(&self.pool)?;
        let rows = conn
            .execute(
                "UPDATE agent_nodes SET is_active = ?2 WHERE id = ?1",
                rusqlite::params![id, active],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows == 0 {
            return Err(Error::NotFound(format!("node '{id}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> NodeRepo {
        NodeRepo::new(init_memory().unwrap())
    }

    #[test]
    fn register_is_keyed_by_name() {
        let repo = setup();
        let first = repo.register("agent-1", "10.0.0.5", 7575).unwrap();
        let second = repo.register("agent-1", "10.0.0.6", 7576).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.host, "10.0.0.6");
        assert_eq!(second.port, 7576);
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn record_probe_updates_health() {
        let repo = setup();
        let node = repo.register("agent-1", "10.0.0.5", 7575).unwrap();
        assert!(node.healthy);

        repo.record_probe(&node.id, false, Some("HTTP 503"), Utc::now())
            .unwrap();

        let node = repo.get(&node.id).unwrap().unwrap();
        assert!(!node.healthy);
        assert_eq!(node.last_probe_error.as_deref(), Some("HTTP 503"));
        assert!(node.last_probe_at.is_some());
    }

    #[test]
    fn inactive_nodes_are_not_probed() {
        let repo = setup();
        let a = repo.register("agent-a", "h", 1).unwrap();
        repo.register("agent-b", "h", 2).unwrap();
        repo.set_active(&a.id, false).unwrap();

        let active = repo.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "agent-b");
    }

    #[test]
    fn unknown_node_heartbeat_is_not_found() {
        let repo = setup();
        assert!(matches!(
            repo.touch_heartbeat("ghost", Utc::now()),
            Err(Error::NotFound(_))
        ));
    }
}
