//! Vendor Dialects
//!
//! Classifies replica errors into failures (the replica is gone and must be
//! deactivated) and ordinary application errors (passed through unchanged).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse origin of a replica-side error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverErrorKind {
    /// Connection could not be established or was lost
    Connection,
    /// The driver gave up waiting on the replica
    Timeout,
    /// The replica executed the call and reported an error
    Database,
    /// The replica answered with something the caller did not expect
    Protocol,
    /// Anything else
    Other,
}

/// Error raised by a single replica
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct DriverError {
    pub kind: DriverErrorKind,
    /// Vendor error code
    pub code: Option<i32>,
    /// Five character SQLSTATE
    pub sql_state: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Connection,
            code: None,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Timeout,
            code: None,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Protocol,
            code: None,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn database(code: Option<i32>, sql_state: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: DriverErrorKind::Database,
            code,
            sql_state: sql_state.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Classification of a replica error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    /// The replica is unusable
    Failure,
    /// The call failed but the replica is healthy
    NonFailure,
}

/// Vendor-specific error classification
pub trait Dialect: Send + Sync {
    /// Dialect name (for logging)
    fn name(&self) -> &str;

    /// Classify a replica error
    fn classify(&self, error: &DriverError) -> ExceptionClass;

    /// Shorthand for `classify(error) == ExceptionClass::Failure`
    fn indicates_failure(&self, error: &DriverError) -> bool {
        self.classify(error) == ExceptionClass::Failure
    }
}

/// Dialect selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DialectKind {
    Standard,
    #[default]
    Mariadb,
}

impl DialectKind {
    pub fn create(self) -> std::sync::Arc<dyn Dialect> {
        match self {
            DialectKind::Standard => std::sync::Arc::new(StandardDialect),
            DialectKind::Mariadb => std::sync::Arc::new(MariaDbDialect),
        }
    }
}

/// SQLSTATE class for connection exceptions
const CONNECTION_EXCEPTION_CLASS: &str = "08";

/// ANSI classification: connection/timeout errors and SQLSTATE class 08
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDialect;

impl Dialect for StandardDialect {
    fn name(&self) -> &str {
        "standard"
    }

    fn classify(&self, error: &DriverError) -> ExceptionClass {
        match error.kind {
            DriverErrorKind::Connection | DriverErrorKind::Timeout => ExceptionClass::Failure,
            _ if error
                .sql_state
                .as_deref()
                .is_some_and(|state| state.starts_with(CONNECTION_EXCEPTION_CLASS)) =>
            {
                ExceptionClass::Failure
            }
            _ => ExceptionClass::NonFailure,
        }
    }
}

/// MariaDB/MySQL error codes that mean the server is gone
const MARIADB_FAILURE_CODES: &[i32] = &[
    1053, // ER_SERVER_SHUTDOWN
    1927, // ER_CONNECTION_KILLED
    2002, // CR_CONNECTION_ERROR
    2003, // CR_CONN_HOST_ERROR
    2006, // CR_SERVER_GONE_ERROR
    2013, // CR_SERVER_LOST
    2055, // CR_SERVER_LOST_EXTENDED
];

/// MariaDB classification: ANSI rules plus client/server connection codes
#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDbDialect;

impl Dialect for MariaDbDialect {
    fn name(&self) -> &str {
        "mariadb"
    }

    fn classify(&self, error: &DriverError) -> ExceptionClass {
        if error.code.is_some_and(|code| MARIADB_FAILURE_CODES.contains(&code)) {
            return ExceptionClass::Failure;
        }
        StandardDialect.classify(error)
    }
}
