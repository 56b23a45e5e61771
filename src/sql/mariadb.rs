//! MariaDB Replica Client
//!
//! `Connector` and `Handle` implementations over sqlx. One pool is kept per
//! replica; each root handle pins one pooled connection so that session
//! state (transactions, variables) stays on it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlConnection, MySqlDatabaseError, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Connection, Executor, MySqlPool, Row};
use tokio::sync::Mutex;

use super::{Connector, Handle, Operation, Value};
use crate::config::DriverConfig;
use crate::database::Database;
use crate::dialect::{DriverError, DriverErrorKind};

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(|e| i32::from(e.number()));
                let sql_state = db_err.code().map(|c| c.into_owned());
                DriverError::database(code, sql_state.as_deref(), db_err.message())
            }
            sqlx::Error::Io(e) => DriverError::connection(e.to_string()),
            sqlx::Error::Tls(e) => DriverError::connection(e.to_string()),
            e @ (sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed) => {
                DriverError::connection(e.to_string())
            }
            e @ sqlx::Error::PoolTimedOut => DriverError::timeout(e.to_string()),
            e @ (sqlx::Error::Protocol(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::TypeNotFound { .. }) => DriverError::protocol(e.to_string()),
            e => DriverError {
                kind: DriverErrorKind::Other,
                code: None,
                sql_state: None,
                message: e.to_string(),
            },
        }
    }
}

/// Opens pooled connections to MariaDB replicas
pub struct MariaDbConnector {
    pools: Mutex<HashMap<String, MySqlPool>>,
    pool_size: u32,
    connect_timeout: Duration,
}

impl MariaDbConnector {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            pool_size: config.pool_size,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    async fn pool(&self, database: &Database) -> Result<MySqlPool, DriverError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&database.id) {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(self.connect_timeout)
            .connect(&database.url())
            .await?;
        tracing::info!("Opened connection pool to {} ({}:{})", database.id, database.host, database.port);
        pools.insert(database.id.clone(), pool.clone());
        Ok(pool)
    }

    /// Close every pool
    pub async fn close(&self) {
        let pools: Vec<MySqlPool> = self.pools.lock().await.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

#[async_trait]
impl Connector for MariaDbConnector {
    async fn connect(&self, database: &Database) -> Result<Arc<dyn Handle>, DriverError> {
        let pool = self.pool(database).await?;
        let connection = pool.acquire().await?;
        tracing::debug!("Acquired connection to {}", database.id);
        Ok(Arc::new(MariaDbConnection {
            database: database.id.clone(),
            connection: Mutex::new(Some(connection)),
        }))
    }
}

/// One pinned connection to one replica
pub struct MariaDbConnection {
    database: String,
    connection: Mutex<Option<PoolConnection<MySql>>>,
}

impl MariaDbConnection {
    fn sql(operation: &Operation) -> Result<&str, DriverError> {
        operation.text_arg(0).ok_or_else(|| {
            DriverError::protocol(format!("{} requires an SQL text argument", operation.name))
        })
    }
}

#[async_trait]
impl Handle for MariaDbConnection {
    async fn call(&self, operation: &Operation) -> Result<Value, DriverError> {
        let mut guard = self.connection.lock().await;

        if operation.name == "close" {
            if guard.take().is_some() {
                tracing::debug!("Released connection to {}", self.database);
            }
            return Ok(Value::Null);
        }

        let conn: &mut MySqlConnection = guard
            .as_mut()
            .ok_or_else(|| DriverError::connection(format!("Connection to {} is closed", self.database)))?;

        match operation.name.as_str() {
            "execute" => {
                let result = conn.execute(Self::sql(operation)?).await?;
                Ok(Value::Int(result.rows_affected() as i64))
            }
            "query" => {
                let rows = conn.fetch_all(Self::sql(operation)?).await?;
                Ok(Value::Rows(rows.iter().map(decode_row).collect()))
            }
            "begin" => {
                conn.execute("START TRANSACTION").await?;
                Ok(Value::Null)
            }
            "commit" => {
                conn.execute("COMMIT").await?;
                Ok(Value::Null)
            }
            "rollback" => {
                conn.execute("ROLLBACK").await?;
                Ok(Value::Null)
            }
            "ping" => {
                conn.ping().await?;
                Ok(Value::Bool(true))
            }
            "version" => {
                let row = conn.fetch_one("SELECT VERSION()").await?;
                Ok(Value::Text(row.try_get::<String, _>(0)?))
            }
            other => Err(DriverError::protocol(format!("Unsupported operation: {}", other))),
        }
    }
}

fn decode_row(row: &MySqlRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|column| decode_column(row, column.ordinal()))
        .collect()
}

fn decode_column(row: &MySqlRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::Int);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(index) {
        return v.map_or(Value::Null, |v| Value::Int(v as i64));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, Value::Float);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::Text);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v.map_or(Value::Null, |v| Value::Text(v.to_string()));
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, Value::Bytes);
    }
    Value::Null
}
