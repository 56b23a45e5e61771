//! Command Dispatch
//!
//! Delivers state commands to the other middleware nodes sharing a cluster
//! and reports membership changes. Two dispatchers are provided: a TCP one
//! for real deployments and an in-process one for single-process clusters.

mod command;
mod local;
mod membership;
mod tcp;

pub use command::{Command, RemoteInvocationDescriptor, RemoteInvokerDescriptor};
pub use local::{LocalCommandDispatcher, LocalGroup};
pub use membership::MemberTable;
pub use tcp::{TcpCommandDispatcher, TcpDispatcherConfig};

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::DatabaseCluster;
use crate::error::Result;
use crate::state::distributed::RemoteInvokers;
use crate::state::StateManager;

/// A middleware node taking part in command dispatch
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub address: String,
}

impl Member {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Result of running a command on one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// Command ran; carries its return value
    Completed(bool),
    /// Command ran and raised an error
    Failed(String),
    /// Member could not be reached and has been removed
    Unreachable(String),
}

/// What a received command runs against
pub trait StateCommandContext: Send + Sync {
    /// The cluster, unless it has already been dropped
    fn cluster(&self) -> Option<Arc<DatabaseCluster>>;

    /// State manager that applies changes on this node only
    fn local_state_manager(&self) -> &Arc<dyn StateManager>;

    /// In-flight invocations of the other members
    fn remote_invokers(&self) -> &RemoteInvokers;
}

/// Membership change callbacks
#[async_trait]
pub trait MembershipListener: Send + Sync {
    async fn added(&self, member: &Member);

    async fn removed(&self, member: &Member);
}

/// State handed to a joining member
#[async_trait]
pub trait Stateful: Send + Sync {
    async fn get_state(&self) -> Result<Vec<u8>>;

    async fn set_state(&self, state: &[u8]) -> Result<()>;
}

/// Group communication used by the distributed state manager
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// This node
    fn local(&self) -> &Member;

    /// Known members, this node included
    async fn members(&self) -> Vec<Member>;

    /// Join the group, taking initial state from an existing member
    async fn start(
        &self,
        context: Arc<dyn StateCommandContext>,
        membership: Arc<dyn MembershipListener>,
        stateful: Arc<dyn Stateful>,
    ) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Run `command` on every other member and wait for all of them
    async fn execute_all(&self, command: &Command) -> BTreeMap<Member, CommandOutcome>;

    /// Run `command` on one member
    async fn send(&self, member: &Member, command: &Command) -> CommandOutcome;
}
