//! Test support: scripted replicas and pre-started clusters

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use async_trait::async_trait;

use crate::cluster::{ClusterBuilder, DatabaseCluster};
use crate::database::{Database, DatabaseEvent};
use crate::dialect::DriverError;
use crate::distributed::CommandDispatcher;
use crate::durability::{InvocationEvent, InvocationMap, InvokerEvent};
use crate::error::Result;
use crate::id::TransactionIdGenerator;
use crate::sql::{Connector, Handle, Operation, ResultShape, Value};
use crate::state::{DistributedContext, DistributedStateManager, MemoryStateManager, StateManager};

type Key = (String, String);

#[derive(Default)]
struct Script {
    failures: Mutex<HashMap<Key, DriverError>>,
    responses: Mutex<HashMap<Key, Value>>,
    calls: Mutex<Vec<Key>>,
}

impl Script {
    fn call(&self, database: &str, operation: &str) -> Option<std::result::Result<Value, DriverError>> {
        let key = (database.to_string(), operation.to_string());
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());

        if let Some(error) = self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return Some(Err(error.clone()));
        }
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .map(Ok)
    }
}

/// Connector whose replicas answer from a script
#[derive(Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `operation` on `database` fail with `error`. `"connect"` fails the connection itself.
    pub fn fail(&self, database: &str, operation: &str, error: DriverError) {
        self.script
            .failures
            .lock()
            .unwrap()
            .insert((database.to_string(), operation.to_string()), error);
    }

    pub fn respond(&self, database: &str, operation: &str, value: Value) {
        self.script
            .responses
            .lock()
            .unwrap()
            .insert((database.to_string(), operation.to_string()), value);
    }

    /// Databases `operation` was called on, in call order
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.script
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, op)| op == operation)
            .map(|(db, _)| db.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, database: &Database) -> std::result::Result<Arc<dyn Handle>, DriverError> {
        if let Some(Err(e)) = self.script.call(&database.id, "connect") {
            return Err(e);
        }
        Ok(Arc::new(ScriptedHandle {
            database: database.id.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedHandle {
    database: String,
    script: Arc<Script>,
}

#[async_trait]
impl Handle for ScriptedHandle {
    async fn call(&self, operation: &Operation) -> std::result::Result<Value, DriverError> {
        if let Some(scripted) = self.script.call(&self.database, &operation.name) {
            return scripted;
        }
        match operation.shape {
            ResultShape::Handle { .. } => Ok(Value::Handle(Arc::new(ScriptedHandle {
                database: self.database.clone(),
                script: Arc::clone(&self.script),
            }))),
            ResultShape::Value => Ok(Value::Int(1)),
        }
    }
}

/// In-memory state manager that also logs durability callbacks
#[derive(Default)]
pub struct RecordingStateManager {
    inner: MemoryStateManager,
    events: Mutex<Vec<String>>,
}

impl RecordingStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl StateManager for RecordingStateManager {
    async fn active_databases(&self) -> Result<BTreeSet<String>> {
        self.inner.active_databases().await
    }

    async fn set_active_databases(&self, databases: &BTreeSet<String>) -> Result<()> {
        self.inner.set_active_databases(databases).await
    }

    async fn activated(&self, event: &DatabaseEvent) -> Result<()> {
        self.record(format!("activated:{}", event.database));
        self.inner.activated(event).await
    }

    async fn deactivated(&self, event: &DatabaseEvent) -> Result<()> {
        self.record(format!("deactivated:{}", event.database));
        self.inner.deactivated(event).await
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.record("before_invocation".to_string());
        self.inner.before_invocation(event).await
    }

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.record("after_invocation".to_string());
        self.inner.after_invocation(event).await
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        self.record(format!("before_invoker:{}", event.database));
        self.inner.before_invoker(event).await
    }

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()> {
        self.record(format!("after_invoker:{}", event.database));
        self.inner.after_invoker(event).await
    }

    async fn recover(&self) -> Result<InvocationMap> {
        self.inner.recover().await
    }
}

fn builder(ids: &[&str]) -> ClusterBuilder {
    ids.iter()
        .fold(ClusterBuilder::new("test"), |b, id| b.database(Database::new(*id, "localhost")))
}

/// Started cluster over `ids` with in-memory state
pub async fn started_cluster(ids: &[&str]) -> Arc<DatabaseCluster> {
    started_cluster_with(ids, |b| b).await
}

pub async fn started_cluster_with<F>(ids: &[&str], configure: F) -> Arc<DatabaseCluster>
where
    F: FnOnce(ClusterBuilder) -> ClusterBuilder,
{
    let cluster = configure(builder(ids))
        .build(|_| Arc::new(MemoryStateManager::new()))
        .unwrap();
    cluster.start().await.unwrap();
    cluster
}

pub async fn cluster_with_state_manager(ids: &[&str], state_manager: Arc<dyn StateManager>) -> Arc<DatabaseCluster> {
    let cluster = builder(ids).build(|_| state_manager).unwrap();
    cluster.start().await.unwrap();
    cluster
}

/// Started cluster whose state is shared through `dispatcher`
pub async fn distributed_cluster(
    ids: &[&str],
    dispatcher: Arc<dyn CommandDispatcher>,
) -> (Arc<DatabaseCluster>, Arc<DistributedContext>) {
    let ordinal = TransactionIdGenerator::ordinal_for(&dispatcher.local().id);
    let mut context = None;
    let cluster = builder(ids)
        .node_ordinal(ordinal)
        .build(|weak| {
            let manager = DistributedStateManager::new(weak, Arc::new(MemoryStateManager::new()), dispatcher);
            context = Some(Arc::clone(manager.context()));
            Arc::new(manager)
        })
        .unwrap();
    cluster.start().await.unwrap();
    (cluster, context.unwrap())
}

/// Error a MariaDB driver raises when the server goes away
pub fn link_failure() -> DriverError {
    DriverError::connection("Communications link failure")
}

pub fn duplicate_key() -> DriverError {
    DriverError::database(Some(1062), Some("23000"), "Duplicate entry '1' for key 'PRIMARY'")
}

/// Loopback address nothing is listening on yet
pub fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}
