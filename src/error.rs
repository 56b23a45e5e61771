//! WolfHA Error Types

use thiserror::Error;

use crate::dialect::DriverError;

/// Result type alias for WolfHA operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfHA error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Replica errors
    #[error("Database {database} failed: {source}")]
    Driver {
        database: String,
        #[source]
        source: DriverError,
    },

    #[error("All databases in cluster {cluster} failed: {}", causes.join("; "))]
    ClusterExhausted { cluster: String, causes: Vec<String> },

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Driver protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("State store error: {0}")]
    StateStore(#[from] rusqlite::Error),

    #[error("State transfer failed: {0}")]
    StateTransfer(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Build the error returned when no replica could satisfy a call
    pub fn exhausted(cluster: &str, causes: Vec<String>) -> Self {
        Error::ClusterExhausted {
            cluster: cluster.to_string(),
            causes,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::Network(_) | Error::ConnectionFailed { .. }
        )
    }

    /// Check if this error means the whole cluster is unavailable
    pub fn is_cluster_failure(&self) -> bool {
        matches!(self, Error::ClusterExhausted { .. })
    }

    /// The replica-side error, if this error carries one
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Error::Driver { source, .. } => Some(source),
            _ => None,
        }
    }
}
