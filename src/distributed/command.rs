//! State Commands
//!
//! Each command mirrors one state transition of the sending node onto the
//! receiving node.

use serde::{Deserialize, Serialize};

use super::{Member, StateCommandContext};
use crate::database::DatabaseEvent;
use crate::durability::{InvocationEvent, InvokerEvent};
use crate::error::{Error, Result};

/// Invocation marker of a remote member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInvocationDescriptor {
    pub member: Member,
    pub event: InvocationEvent,
}

/// Invoker marker of a remote member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInvokerDescriptor {
    pub member: Member,
    pub event: InvokerEvent,
}

/// Command sent between middleware nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Activation(DatabaseEvent),
    Deactivation(DatabaseEvent),
    PreInvocation(RemoteInvocationDescriptor),
    PostInvocation(RemoteInvocationDescriptor),
    Invoker(RemoteInvokerDescriptor),
}

impl Command {
    /// Apply the command on this node
    pub async fn execute(&self, context: &dyn StateCommandContext) -> Result<bool> {
        match self {
            Command::Activation(event) | Command::Deactivation(event) => {
                let Some(cluster) = context.cluster() else {
                    return Ok(false);
                };
                let database = cluster
                    .database(&event.database)
                    .ok_or_else(|| Error::DatabaseNotFound(event.database.clone()))?;
                let state_manager = context.local_state_manager().as_ref();

                if matches!(self, Command::Activation(_)) {
                    cluster.activate(&database, state_manager).await
                } else {
                    cluster.deactivate(&database, state_manager).await
                }
            }
            Command::PreInvocation(descriptor) => {
                context
                    .remote_invokers()
                    .begin(&descriptor.member, descriptor.event.key())
                    .await;
                Ok(true)
            }
            Command::PostInvocation(descriptor) => Ok(context
                .remote_invokers()
                .complete(&descriptor.member, descriptor.event.key())
                .await),
            Command::Invoker(descriptor) => {
                context
                    .remote_invokers()
                    .record(&descriptor.member, &descriptor.event)
                    .await;
                Ok(true)
            }
        }
    }

    /// Get the command type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Command::Activation(_) => "Activation",
            Command::Deactivation(_) => "Deactivation",
            Command::PreInvocation(_) => "PreInvocation",
            Command::PostInvocation(_) => "PostInvocation",
            Command::Invoker(_) => "Invoker",
        }
    }
}
