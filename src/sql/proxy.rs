//! Fan-out Proxies
//!
//! A root proxy holds one connection per replica. Operations whose result is
//! itself a handle (statements, result sets) produce child proxies holding
//! one such handle per replica that answered. Handles are created lazily:
//! a root proxy connects, a child replays the operation that created it on
//! its parent's handle for the same replica.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use async_trait::async_trait;

use super::{Connector, Handle, Operation, OperationClass, ResultShape, Value};
use crate::balancer::Removal;
use crate::cluster::DatabaseCluster;
use crate::database::Database;
use crate::dialect::DriverError;
use crate::error::{Error, Result};
use crate::invocation::{
    InvocationStrategy, InvocationTarget, Invoker, OperationInvoker, Outcome, Results,
};

/// Where a proxy's handles come from
enum Origin {
    Root(Arc<dyn Connector>),
    Child {
        parent: Arc<SqlProxy>,
        operation: Operation,
    },
}

/// Answer to a proxied operation
pub enum Reply {
    /// Result of the primary replica
    Value(Value),
    /// Per-replica handles behind a child proxy
    Proxy(Arc<SqlProxy>),
}

impl Reply {
    pub fn into_value(self) -> Result<Value> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Proxy(_) => Err(Error::Protocol("Expected a value, got a handle".into())),
        }
    }

    pub fn into_proxy(self) -> Result<Arc<SqlProxy>> {
        match self {
            Reply::Proxy(proxy) => Ok(proxy),
            Reply::Value(value) => Err(Error::Protocol(format!(
                "Expected a handle, got {}",
                value.summary()
            ))),
        }
    }
}

/// One logical handle standing for a handle per replica
pub struct SqlProxy {
    cluster: Arc<DatabaseCluster>,
    origin: Origin,
    handles: RwLock<BTreeMap<Arc<Database>, Arc<dyn Handle>>>,
    update_copy: bool,
}

/// Does nothing beyond obtaining the handle
struct ConnectInvoker;

#[async_trait]
impl Invoker for ConnectInvoker {
    async fn invoke(&self, _database: &Arc<Database>, _handle: Arc<dyn Handle>) -> Outcome {
        Ok(Value::Null)
    }
}

impl SqlProxy {
    /// Connect to every active replica
    pub async fn connect(cluster: Arc<DatabaseCluster>, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let proxy = Arc::new(Self {
            cluster,
            origin: Origin::Root(connector),
            handles: RwLock::new(BTreeMap::new()),
            update_copy: false,
        });

        InvocationStrategy::OnAll.invoke(proxy.as_ref(), &ConnectInvoker).await?;
        tracing::debug!(
            "Connected to {} databases of cluster {}",
            proxy.entries().len(),
            proxy.cluster.id()
        );
        Ok(proxy)
    }

    /// Proxy over handles produced by `operation` on `parent`
    pub fn child(
        parent: &Arc<SqlProxy>,
        operation: Operation,
        handles: BTreeMap<Arc<Database>, Arc<dyn Handle>>,
        update_copy: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster: Arc::clone(&parent.cluster),
            origin: Origin::Child {
                parent: Arc::clone(parent),
                operation,
            },
            handles: RwLock::new(handles),
            update_copy,
        })
    }

    pub fn update_copy(&self) -> bool {
        self.update_copy
    }

    /// Replicas this proxy holds a handle for, active or not
    pub fn bound_databases(&self) -> Vec<Arc<Database>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn strategy_for(&self, operation: &Operation) -> InvocationStrategy {
        match self.origin {
            Origin::Root(_) => operation.class.strategy(),
            Origin::Child { .. } => match operation.class {
                OperationClass::DriverRead | OperationClass::DatabaseRead => InvocationStrategy::OnAny,
                OperationClass::DatabaseWrite | OperationClass::TransactionWrite if self.update_copy => {
                    InvocationStrategy::OnAll
                }
                _ => InvocationStrategy::OnExisting,
            },
        }
    }

    /// Run `operation` against the replicas its class calls for
    pub async fn invoke(self: &Arc<Self>, operation: Operation) -> Result<Reply> {
        let strategy = self.strategy_for(&operation);
        let write = operation.class.is_write();
        tracing::trace!("{} {} on cluster {}", strategy, operation.name, self.cluster.id());

        let invoker = OperationInvoker::new(operation);
        let operation = invoker.operation();

        let results = if write {
            let results = self
                .cluster
                .durability()
                .invoke(
                    self.cluster.state_manager().as_ref(),
                    operation.phase,
                    strategy,
                    self.as_ref(),
                    &invoker,
                )
                .await?;
            self.reconcile(operation, results).await?
        } else {
            strategy.invoke(self.as_ref(), &invoker).await?
        };

        match operation.shape {
            ResultShape::Value => {
                let (_, value) = results
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::exhausted(self.cluster.id(), Vec::new()))?;
                Ok(Reply::Value(value))
            }
            ResultShape::Handle { update_copy } => {
                let mut handles = BTreeMap::new();
                for (db, value) in results {
                    match value {
                        Value::Handle(handle) => {
                            handles.insert(db, handle);
                        }
                        other => {
                            return Err(Error::Protocol(format!(
                                "{} on {} returned {} instead of a handle",
                                operation.name,
                                db.id,
                                other.summary()
                            )))
                        }
                    }
                }
                Ok(Reply::Proxy(Self::child(self, operation.clone(), handles, update_copy)))
            }
        }
    }

    /// Deactivate replicas whose write result differs from the primary's
    async fn reconcile(&self, operation: &Operation, mut results: Results) -> Result<Results> {
        let Some((primary, reference)) = results.iter().next() else {
            return Ok(results);
        };
        let primary = Arc::clone(primary);
        let reference = reference.summary();

        let inconsistent: Vec<(Arc<Database>, String)> = results
            .iter()
            .skip(1)
            .map(|(db, value)| (Arc::clone(db), value.summary()))
            .filter(|(_, summary)| *summary != reference)
            .collect();

        for (db, summary) in inconsistent {
            let removal = self
                .cluster
                .deactivate_unless_last(&db, self.cluster.state_manager().as_ref())
                .await?;
            if removal == Removal::Removed {
                tracing::error!(
                    "{} on {} returned {}, primary {} returned {}: database is inconsistent",
                    operation.name,
                    db.id,
                    summary,
                    primary.id,
                    reference
                );
                results.remove(&db);
            }
        }

        Ok(results)
    }

    /// Close every bound handle and forget them
    pub async fn close(&self) -> Result<()> {
        if self.entries().is_empty() {
            return Ok(());
        }

        let result = InvocationStrategy::OnExisting
            .invoke(self, &OperationInvoker::new(Operation::close()))
            .await;
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        result.map(|_| ())
    }

    async fn create_handle(&self, database: &Arc<Database>) -> std::result::Result<Arc<dyn Handle>, DriverError> {
        match &self.origin {
            Origin::Root(connector) => connector.connect(database).await,
            Origin::Child { parent, operation } => {
                let parent_handle = parent.handle(database).await?;
                match parent_handle.call(operation).await? {
                    Value::Handle(handle) => Ok(handle),
                    other => Err(DriverError::protocol(format!(
                        "{} returned {} instead of a handle",
                        operation.name,
                        other.summary()
                    ))),
                }
            }
        }
    }
}

#[async_trait]
impl InvocationTarget for SqlProxy {
    fn cluster(&self) -> &Arc<DatabaseCluster> {
        &self.cluster
    }

    fn entries(&self) -> Vec<(Arc<Database>, Arc<dyn Handle>)> {
        let balancer = self.cluster.balancer();
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|db, _| balancer.contains(db));
        handles
            .iter()
            .map(|(db, handle)| (Arc::clone(db), Arc::clone(handle)))
            .collect()
    }

    async fn handle(&self, database: &Arc<Database>) -> std::result::Result<Arc<dyn Handle>, DriverError> {
        let existing = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(database)
            .cloned();
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let handle = self.create_handle(database).await?;
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(handles.entry(Arc::clone(database)).or_insert(handle)))
    }
}
