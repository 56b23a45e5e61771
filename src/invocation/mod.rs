//! Invocation Strategy Engine
//!
//! Decides which replicas a call goes to, runs it against each, and turns
//! per-replica outcomes into one ordered result map, deactivating replicas
//! that fail.

mod strategy;

pub use strategy::{InvocationStrategy, Results};

use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::DatabaseCluster;
use crate::database::Database;
use crate::dialect::DriverError;
use crate::error::Result;
use crate::sql::{Handle, Operation, Value};

/// Outcome of one replica call
pub type Outcome = std::result::Result<Value, DriverError>;

/// Replica-parameterised unit of work
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, database: &Arc<Database>, handle: Arc<dyn Handle>) -> Outcome;

    /// Runs before the call to `database` is issued
    async fn before_invoke(&self, _database: &Arc<Database>) -> Result<()> {
        Ok(())
    }

    /// Runs once the call to `database` has completed
    async fn after_invoke(&self, _database: &Arc<Database>, _outcome: &Outcome) -> Result<()> {
        Ok(())
    }
}

/// Something that holds per-replica handles for the engine to call
#[async_trait]
pub trait InvocationTarget: Send + Sync {
    fn cluster(&self) -> &Arc<DatabaseCluster>;

    /// Active replicas this target already holds a handle for, in id order
    fn entries(&self) -> Vec<(Arc<Database>, Arc<dyn Handle>)>;

    /// Handle for `database`, created on demand
    async fn handle(&self, database: &Arc<Database>) -> std::result::Result<Arc<dyn Handle>, DriverError>;
}

/// Whether OnAll calls replicas concurrently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

/// Applies an operation to the handle as-is
pub struct OperationInvoker {
    operation: Operation,
}

impl OperationInvoker {
    pub fn new(operation: Operation) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

#[async_trait]
impl Invoker for OperationInvoker {
    async fn invoke(&self, _database: &Arc<Database>, handle: Arc<dyn Handle>) -> Outcome {
        handle.call(&self.operation).await
    }
}
