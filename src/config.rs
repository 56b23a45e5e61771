//! WolfHA Configuration
//!
//! This module provides configuration structures for a WolfHA node and the
//! database cluster it fronts.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::balancer::BalancerKind;
use crate::database::Database;
use crate::dialect::DialectKind;
use crate::durability::DurabilityLevel;
use crate::invocation::ExecutionMode;
use crate::state::StateBackend;

/// Main WolfHA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfHaConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Driver (connection pool) configuration
    #[serde(default)]
    pub driver: DriverConfig,

    /// Replicas behind the cluster
    #[serde(default)]
    pub databases: Vec<Database>,

    /// State store configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for node-to-node communication
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Data directory for state storage
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier, shared by every node fronting the same replicas
    #[serde(default = "default_cluster_id")]
    pub id: String,

    /// Read balancer
    #[serde(default)]
    pub balancer: BalancerKind,

    /// Error classification
    #[serde(default)]
    pub dialect: DialectKind,

    /// Write tracking level
    #[serde(default)]
    pub durability: DurabilityLevel,

    /// Whether writes reach replicas concurrently
    #[serde(default)]
    pub execution: ExecutionMode,

    /// Share cluster state with other WolfHA nodes
    #[serde(default)]
    pub distributed: bool,

    /// List of peer node addresses
    #[serde(default)]
    pub peers: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence in milliseconds after which a peer is removed
    #[serde(default = "default_member_timeout_ms")]
    pub member_timeout_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Peer connect timeout in milliseconds
    #[serde(default = "default_peer_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Replica connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Connection pool size per replica
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Interval between pings of the active replicas in seconds (0 disables)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7654".to_string()
}

fn default_cluster_id() -> String {
    "default".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_member_timeout_ms() -> u64 {
    5000
}

fn default_dispatch_timeout_ms() -> u64 {
    3000
}

fn default_peer_connect_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfha")
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl WolfHaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfHaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfHaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.cluster.id.is_empty() {
            return Err(crate::Error::Config("cluster.id cannot be empty".into()));
        }

        if self.databases.is_empty() {
            return Err(crate::Error::Config("at least one [[databases]] entry is required".into()));
        }

        let mut seen = HashSet::new();
        for db in &self.databases {
            if db.id.is_empty() {
                return Err(crate::Error::Config("databases.id cannot be empty".into()));
            }
            if db.host.is_empty() {
                return Err(crate::Error::Config(format!("database {} has no host", db.id)));
            }
            if !seen.insert(db.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate database id {}", db.id)));
            }
        }

        if self.cluster.distributed {
            if self.node.bind_address.is_empty() {
                return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
            }
            if self.cluster.member_timeout_ms <= self.cluster.heartbeat_interval_ms {
                return Err(crate::Error::Config(
                    "cluster.member_timeout_ms must exceed cluster.heartbeat_interval_ms".into(),
                ));
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get member timeout as Duration
    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.member_timeout_ms)
    }

    /// Get dispatch timeout as Duration
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.dispatch_timeout_ms)
    }

    /// Get peer connect timeout as Duration
    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get replica health check interval, if enabled
    pub fn health_check_interval(&self) -> Option<Duration> {
        match self.driver.health_check_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Generate a sample configuration file
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# WolfHA node configuration

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7654"
# advertise_address = "10.0.0.1:7654"
data_dir = "/var/lib/wolfha"

[cluster]
id = "default"
balancer = "round-robin"   # simple, random, round-robin, load
dialect = "mariadb"        # standard, mariadb
durability = "fine"        # none, coarse, fine
execution = "parallel"     # parallel, sequential
distributed = false
peers = []

[driver]
pool_size = 10
connect_timeout_secs = 30
health_check_interval_secs = 10

[[databases]]
id = "db1"
host = "10.0.0.11"
port = 3306
user = "wolfha"
password = "changeme"

[[databases]]
id = "db2"
host = "10.0.0.12"
port = 3306
user = "wolfha"
password = "changeme"

[state]
backend = "sqlite"         # memory, sqlite

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}
