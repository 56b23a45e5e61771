//! State Management Module
//!
//! Persists the active-database set and durability markers. The local
//! managers keep state on this node; the distributed manager mirrors every
//! transition to the other middleware nodes.

mod memory;
mod sqlite;
pub mod codec;
pub mod distributed;

pub use memory::MemoryStateManager;
pub use sqlite::SqliteStateManager;
pub use distributed::{DistributedContext, DistributedStateManager};

use std::collections::BTreeSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::database::DatabaseEvent;
use crate::durability::{InvocationEvent, InvocationMap, InvokerEvent};
use crate::error::Result;

/// Cluster state store and durability listener
#[async_trait]
pub trait StateManager: Send + Sync {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Ids of the databases recorded as active
    async fn active_databases(&self) -> Result<BTreeSet<String>>;

    /// Replace the recorded active set
    async fn set_active_databases(&self, databases: &BTreeSet<String>) -> Result<()>;

    async fn activated(&self, event: &DatabaseEvent) -> Result<()>;

    async fn deactivated(&self, event: &DatabaseEvent) -> Result<()>;

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()>;

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()>;

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()>;

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()>;

    /// Invocations that have a BEFORE marker but no AFTER marker
    async fn recover(&self) -> Result<InvocationMap>;

    /// True when no other middleware node shares this state
    async fn is_membership_empty(&self) -> bool {
        true
    }
}

/// State backend selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StateBackend {
    /// Nothing survives a restart
    Memory,
    /// SQLite database under the node's state directory
    #[default]
    Sqlite,
}
