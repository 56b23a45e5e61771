//! Replica Descriptors
//!
//! A `Database` is one physical replica behind the cluster. Identity,
//! equality and ordering are defined by the id alone, so result maps keyed
//! by database always iterate in id order.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

/// One physical database replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// Unique replica identifier
    pub id: String,

    /// Replica host
    pub host: String,

    /// Replica port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database user
    #[serde(default)]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Schema to connect to (optional)
    #[serde(default)]
    pub schema: Option<String>,

    /// Balancing weight (0 = never chosen for reads while others exist)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Replica runs on the same host as this node
    #[serde(default)]
    pub local: bool,
}

fn default_port() -> u16 {
    3306
}

fn default_weight() -> u32 {
    1
}

impl Database {
    /// Create a replica descriptor with default connection parameters
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            schema: None,
            weight: default_weight(),
            local: false,
        }
    }

    /// Builder-style weight override
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connection URL for the MySQL protocol
    pub fn url(&self) -> String {
        match &self.schema {
            Some(schema) => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, schema
            ),
            None => format!(
                "mysql://{}:{}@{}:{}",
                self.user, self.password, self.host, self.port
            ),
        }
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Database {}

impl PartialOrd for Database {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Database {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Database {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Activation state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationState {
    Active,
    Inactive,
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivationState::Active => write!(f, "ACTIVE"),
            ActivationState::Inactive => write!(f, "INACTIVE"),
        }
    }
}

/// Activation/deactivation notification for one replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEvent {
    /// Replica id
    pub database: String,
    /// When the transition happened on the originating node
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl DatabaseEvent {
    pub fn new(database: &Database) -> Self {
        Self {
            database: database.id.clone(),
            timestamp: chrono::Utc::now(),
        }
    }
}
