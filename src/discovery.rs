//! Service discovery: partition membership registry.
//!
//! Processes register themselves on startup and deregister on clean
//! shutdown. The registry is a shared SQLite database; the scheduler
//! reads the builder set from it to know when a TimeFrame is complete.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Mutex;

use crate::messages::PeerRole;

#[derive(Debug, Clone, Serialize)]
pub struct MemberRecord {
    pub process_id: String,
    pub role: String,
    pub endpoint: String,
    pub registered_at: DateTime<Utc>,
}

fn role_str(role: PeerRole) -> &'static str {
    match role {
        PeerRole::Builder => "builder",
        PeerRole::Aggregator => "aggregator",
    }
}

/// Handle on the membership database, scoped to one partition.
pub struct DiscoveryDb {
    conn: Mutex<Connection>,
    partition_id: String,
}

impl DiscoveryDb {
    pub fn open(path: &str, partition_id: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS partition_members (
                partition_id  TEXT NOT NULL,
                process_id    TEXT NOT NULL,
                role          TEXT NOT NULL,
                endpoint      TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (partition_id, process_id)
            );",
        )?;
        // registry is shared between processes on the same host
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
            partition_id: partition_id.to_string(),
        })
    }

    /// Upsert this process into the partition.
    pub fn register(
        &self,
        process_id: &str,
        role: PeerRole,
        endpoint: &str,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO partition_members
             (partition_id, process_id, role, endpoint, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.partition_id,
                process_id,
                role_str(role),
                endpoint,
                Utc::now().to_rfc3339()
            ],
        )?;
        log::info!(
            "📇 Registered {} '{}' in partition '{}' at {}",
            role_str(role),
            process_id,
            self.partition_id,
            endpoint
        );
        Ok(())
    }

    pub fn deregister(&self, process_id: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM partition_members WHERE partition_id = ?1 AND process_id = ?2",
            params![self.partition_id, process_id],
        )?;
        log::info!(
            "📇 Deregistered '{}' from partition '{}'",
            process_id,
            self.partition_id
        );
        Ok(())
    }

    pub fn members(&self, role: Option<PeerRole>) -> rusqlite::Result<Vec<MemberRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT process_id, role, endpoint, registered_at
             FROM partition_members
             WHERE partition_id = ?1 AND (?2 IS NULL OR role = ?2)
             ORDER BY process_id",
        )?;
        let role_filter = role.map(role_str);
        let rows = stmt.query_map(params![self.partition_id, role_filter], |row| {
            let registered: String = row.get(3)?;
            Ok(MemberRecord {
                process_id: row.get(0)?,
                role: row.get(1)?,
                endpoint: row.get(2)?,
                registered_at: registered
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect()
    }

    /// Process ids of all registered builders (the expected STF sources).
    pub fn builder_ids(&self) -> rusqlite::Result<Vec<String>> {
        Ok(self
            .members(Some(PeerRole::Builder))?
            .into_iter()
            .map(|m| m.process_id)
            .collect())
    }

    /// Endpoint a given source buffer serves STF pulls on.
    pub fn endpoint_of(&self, process_id: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT endpoint FROM partition_members
             WHERE partition_id = ?1 AND process_id = ?2",
        )?;
        let mut rows = stmt.query(params![self.partition_id, process_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Remove every member of the partition (partition teardown).
    pub fn clear_partition(&self) -> rusqlite::Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM partition_members WHERE partition_id = ?1",
            params![self.partition_id],
        )
    }

    /// JSON snapshot of the membership for diagnostics.
    pub fn snapshot_json(&self) -> rusqlite::Result<String> {
        let members = self.members(None)?;
        Ok(serde_json::to_string_pretty(&members).unwrap_or_else(|_| "[]".to_string()))
    }
}
