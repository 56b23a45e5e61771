//! SQLite state manager
//!
//! Persistent storage for the active-database set and durability markers,
//! so a restarted node can find writes it never finished.

use std::collections::BTreeSet;
use std::path::PathBuf;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::StateManager;
use crate::database::DatabaseEvent;
use crate::durability::{
    DurabilityPhase, InvocationEvent, InvocationKey, InvocationMap, InvokerEvent, InvokerResult,
    Marker,
};
use crate::error::{Error, Result};
use crate::id::TransactionId;

/// Persistent state manager backed by SQLite
pub struct SqliteStateManager {
    /// Database connection
    conn: Mutex<Connection>,
    /// Location of the state database
    path: PathBuf,
}

impl SqliteStateManager {
    /// Create or open the state database in `data_dir`
    pub fn new(data_dir: PathBuf, cluster_id: &str) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let path = data_dir.join(format!("{}.db", cluster_id));
        let conn = Connection::open(&path)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS cluster_state (
                database_id TEXT PRIMARY KEY,
                activated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS cluster_invocation (
                txn_id INTEGER NOT NULL,
                phase INTEGER NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (txn_id, phase)
            );

            CREATE TABLE IF NOT EXISTS cluster_invoker (
                txn_id INTEGER NOT NULL,
                phase INTEGER NOT NULL,
                database_id TEXT NOT NULL,
                result BLOB,
                PRIMARY KEY (txn_id, phase, database_id)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Number of invocations with no AFTER marker
    pub async fn pending_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cluster_invocation", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}

fn phase_from_row(value: i64) -> Result<DurabilityPhase> {
    DurabilityPhase::from_i64(value)
        .ok_or_else(|| Error::State(format!("Unknown durability phase {} in state store", value)))
}

#[async_trait]
impl StateManager for SqliteStateManager {
    async fn active_databases(&self) -> Result<BTreeSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT database_id FROM cluster_state")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut databases = BTreeSet::new();
        for id in rows {
            databases.insert(id?);
        }
        Ok(databases)
    }

    async fn set_active_databases(&self, databases: &BTreeSet<String>) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM cluster_state", [])?;
        for id in databases {
            tx.execute("INSERT INTO cluster_state (database_id) VALUES (?1)", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn activated(&self, event: &DatabaseEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO cluster_state (database_id) VALUES (?1)",
            params![event.database],
        )?;
        Ok(())
    }

    async fn deactivated(&self, event: &DatabaseEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM cluster_state WHERE database_id = ?1",
            params![event.database],
        )?;
        Ok(())
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO cluster_invocation (txn_id, phase) VALUES (?1, ?2)",
            params![event.transaction_id.as_u64() as i64, event.phase.as_i64()],
        )?;
        Ok(())
    }

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let txn_id = event.transaction_id.as_u64() as i64;
        tx.execute(
            "DELETE FROM cluster_invoker WHERE txn_id = ?1 AND phase = ?2",
            params![txn_id, event.phase.as_i64()],
        )?;
        tx.execute(
            "DELETE FROM cluster_invocation WHERE txn_id = ?1 AND phase = ?2",
            params![txn_id, event.phase.as_i64()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO cluster_invoker (txn_id, phase, database_id)
            VALUES (?1, ?2, ?3)
            "#,
            params![
                event.transaction_id.as_u64() as i64,
                event.phase.as_i64(),
                event.database
            ],
        )?;
        Ok(())
    }

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let result = match &event.result {
            Some(result) => Some(bincode::serialize(result)?),
            None => None,
        };

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO cluster_invoker (txn_id, phase, database_id, result)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(txn_id, phase, database_id) DO UPDATE SET result = ?4
            "#,
            params![
                event.transaction_id.as_u64() as i64,
                event.phase.as_i64(),
                event.database,
                result
            ],
        )?;
        Ok(())
    }

    async fn recover(&self) -> Result<InvocationMap> {
        let conn = self.conn.lock().await;
        let mut invocations = InvocationMap::new();

        let mut stmt = conn.prepare("SELECT txn_id, phase FROM cluster_invocation")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (txn_id, phase) = row?;
            let key = InvocationKey {
                transaction_id: TransactionId(txn_id as u64),
                phase: phase_from_row(phase)?,
            };
            invocations.insert(key, Default::default());
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT i.txn_id, i.phase, i.database_id, i.result
            FROM cluster_invoker i
            JOIN cluster_invocation v ON v.txn_id = i.txn_id AND v.phase = i.phase
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<Vec<u8>>>(3)?,
            ))
        })?;

        for row in rows {
            let (txn_id, phase, database, result) = row?;
            let key = InvocationKey {
                transaction_id: TransactionId(txn_id as u64),
                phase: phase_from_row(phase)?,
            };
            let result: Option<InvokerResult> = match result {
                Some(bytes) => Some(bincode::deserialize(&bytes)?),
                None => None,
            };
            let event = InvokerEvent {
                transaction_id: key.transaction_id,
                phase: key.phase,
                database: database.clone(),
                marker: if result.is_some() { Marker::After } else { Marker::Before },
                result,
            };
            invocations.entry(key).or_default().insert(database, event);
        }

        Ok(invocations)
    }
}
