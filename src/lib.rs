//! WolfHA - High-Availability Database Access Middleware
//!
//! WolfHA sits between an application and a set of MariaDB replicas that
//! hold the same data. Reads go to one replica chosen by a balancer, writes
//! go to every active replica, and a replica that fails is deactivated
//! instead of failing the application.
//!
//! # Architecture
//!
//! A `DatabaseCluster` owns the replicas, the balancer over the active ones
//! and a `StateManager` that persists which replicas are active. Every
//! write is bracketed with durability markers so that a write interrupted
//! by a crash can be detected and reconciled on restart.
//!
//! # Features
//!
//! - Fan-out proxies (connections, statements, result sets) over all replicas
//! - Simple, random, round-robin and least-load read balancing
//! - Invocation and per-replica durability markers with crash recovery
//! - In-memory or SQLite state
//! - Cluster state shared between WolfHA nodes over TCP

pub mod config;
pub mod error;
pub mod dialect;
pub mod database;
pub mod balancer;
pub mod id;
pub mod sql;
pub mod invocation;
pub mod durability;
pub mod state;
pub mod distributed;
pub mod network;
pub mod cluster;

#[cfg(test)]
mod testing;

pub use config::WolfHaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfHaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::cluster::{ClusterBuilder, DatabaseCluster, DatabaseClusterListener};
    pub use crate::database::{Database, DatabaseEvent};
    pub use crate::balancer::{Balancer, BalancerKind};
    pub use crate::sql::{Connector, Handle, Operation, Reply, SqlProxy, Value};
    pub use crate::state::{MemoryStateManager, SqliteStateManager, StateManager};
    pub use crate::distributed::{CommandDispatcher, LocalCommandDispatcher, Member, TcpCommandDispatcher};
}
