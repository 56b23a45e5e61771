//! Database Cluster
//!
//! The replica registry: the configured replicas, which of them are active,
//! and the policies (balancer, dialect, durability) applied to calls.
//! Activation state lives in the balancer; every change is reported to the
//! state manager passed in, which is the cluster's own manager for local
//! decisions and the local-only manager for changes mirrored from peers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::balancer::{Balancer, BalancerKind, Removal};
use crate::config::WolfHaConfig;
use crate::database::{Database, DatabaseEvent};
use crate::dialect::{Dialect, DialectKind, DriverError};
use crate::durability::{Durability, DurabilityLevel};
use crate::error::{Error, Result};
use crate::id::TransactionIdGenerator;
use crate::invocation::ExecutionMode;
use crate::state::StateManager;

/// Observer of activation changes
pub trait DatabaseClusterListener: Send + Sync {
    fn activated(&self, _database: &Database) {}

    fn deactivated(&self, _database: &Database) {}
}

/// Builds a `DatabaseCluster`
pub struct ClusterBuilder {
    id: String,
    databases: Vec<Database>,
    balancer: BalancerKind,
    dialect: DialectKind,
    durability: DurabilityLevel,
    execution_mode: ExecutionMode,
    node_ordinal: u16,
}

impl ClusterBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            databases: Vec::new(),
            balancer: BalancerKind::default(),
            dialect: DialectKind::default(),
            durability: DurabilityLevel::default(),
            execution_mode: ExecutionMode::default(),
            node_ordinal: 0,
        }
    }

    /// Builder populated from the `[cluster]` and `[[databases]]` sections
    pub fn from_config(config: &WolfHaConfig) -> Self {
        let mut builder = Self::new(config.cluster.id.clone())
            .balancer(config.cluster.balancer)
            .dialect(config.cluster.dialect)
            .durability(config.cluster.durability)
            .execution_mode(config.cluster.execution)
            .node_ordinal(TransactionIdGenerator::ordinal_for(&config.node.id));
        for db in &config.databases {
            builder = builder.database(db.clone());
        }
        builder
    }

    pub fn database(mut self, database: Database) -> Self {
        self.databases.push(database);
        self
    }

    pub fn balancer(mut self, kind: BalancerKind) -> Self {
        self.balancer = kind;
        self
    }

    pub fn dialect(mut self, kind: DialectKind) -> Self {
        self.dialect = kind;
        self
    }

    pub fn durability(mut self, level: DurabilityLevel) -> Self {
        self.durability = level;
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Ordinal mixed into transaction ids so nodes never collide
    pub fn node_ordinal(mut self, ordinal: u16) -> Self {
        self.node_ordinal = ordinal;
        self
    }

    /// Build the cluster. `state_manager` receives a weak handle to the
    /// cluster being built, for managers that act on it later.
    pub fn build<F>(self, state_manager: F) -> Result<Arc<DatabaseCluster>>
    where
        F: FnOnce(Weak<DatabaseCluster>) -> Arc<dyn StateManager>,
    {
        if self.databases.is_empty() {
            return Err(Error::Config(format!("Cluster {} has no databases", self.id)));
        }

        let mut databases = BTreeMap::new();
        for db in self.databases {
            let id = db.id.clone();
            if databases.insert(id.clone(), Arc::new(db)).is_some() {
                return Err(Error::Config(format!("Duplicate database id {} in cluster {}", id, self.id)));
            }
        }

        let balancer = self.balancer.create();
        let dialect = self.dialect.create();
        let durability = Durability::new(self.durability, self.node_ordinal);
        let id = self.id;
        let execution_mode = self.execution_mode;

        Ok(Arc::new_cyclic(|weak| DatabaseCluster {
            id,
            databases,
            balancer,
            dialect,
            durability,
            execution_mode,
            state_manager: state_manager(weak.clone()),
            listeners: RwLock::new(Vec::new()),
        }))
    }
}

/// A set of replicas that hold the same data
pub struct DatabaseCluster {
    id: String,
    databases: BTreeMap<String, Arc<Database>>,
    balancer: Box<dyn Balancer>,
    dialect: Arc<dyn Dialect>,
    durability: Durability,
    execution_mode: ExecutionMode,
    state_manager: Arc<dyn StateManager>,
    listeners: RwLock<Vec<Arc<dyn DatabaseClusterListener>>>,
}

impl DatabaseCluster {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configured replica by id
    pub fn database(&self, id: &str) -> Option<Arc<Database>> {
        self.databases.get(id).cloned()
    }

    /// Every configured replica, in id order
    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.values().cloned().collect()
    }

    /// Active replicas, in id order
    pub fn active_databases(&self) -> Vec<Arc<Database>> {
        self.balancer.databases()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.databases
            .get(id)
            .map_or(false, |db| self.balancer.contains(db))
    }

    pub fn balancer(&self) -> &dyn Balancer {
        self.balancer.as_ref()
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn durability(&self) -> &Durability {
        &self.durability
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn state_manager(&self) -> &Arc<dyn StateManager> {
        &self.state_manager
    }

    pub fn add_listener(&self, listener: Arc<dyn DatabaseClusterListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn DatabaseClusterListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Load or establish the active set and recover unfinished writes
    pub async fn start(&self) -> Result<()> {
        self.state_manager.start().await?;

        let persisted = self.state_manager.active_databases().await?;
        let mut active = BTreeSet::new();
        for id in &persisted {
            match self.databases.get(id) {
                Some(db) => {
                    active.insert(id.clone());
                    self.balancer.add(Arc::clone(db));
                }
                None => tracing::warn!("Ignoring unknown database {} in persisted state", id),
            }
        }

        if active.is_empty() {
            for (id, db) in &self.databases {
                active.insert(id.clone());
                self.balancer.add(Arc::clone(db));
            }
        }

        self.state_manager.set_active_databases(&active).await?;
        tracing::info!("Cluster {} started with active databases {:?}", self.id, active);

        if self.state_manager.is_membership_empty().await {
            let pending = self.state_manager.recover().await?;
            if !pending.is_empty() {
                tracing::warn!("Cluster {} has {} unfinished invocations", self.id, pending.len());
                self.durability
                    .recover(self, self.state_manager.as_ref(), pending)
                    .await?;
            }
        }

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.state_manager.stop().await?;
        self.balancer.clear();
        tracing::info!("Cluster {} stopped", self.id);
        Ok(())
    }

    /// Add a replica to the active set. Returns false if it already was.
    pub async fn activate(&self, database: &Arc<Database>, state_manager: &dyn StateManager) -> Result<bool> {
        if !self.balancer.add(Arc::clone(database)) {
            return Ok(false);
        }

        state_manager.activated(&DatabaseEvent::new(database)).await?;
        tracing::info!("Database {} activated in cluster {}", database.id, self.id);
        for listener in self.listeners() {
            listener.activated(database);
        }
        Ok(true)
    }

    /// Remove a replica from the active set. Returns false if it already was.
    pub async fn deactivate(&self, database: &Arc<Database>, state_manager: &dyn StateManager) -> Result<bool> {
        if !self.balancer.remove(database) {
            return Ok(false);
        }

        self.deactivated(database, state_manager).await?;
        Ok(true)
    }

    /// Remove a replica unless it is the only one active
    pub async fn deactivate_unless_last(
        &self,
        database: &Arc<Database>,
        state_manager: &dyn StateManager,
    ) -> Result<Removal> {
        let removal = self.balancer.remove_unless_last(database);
        if removal == Removal::Removed {
            self.deactivated(database, state_manager).await?;
        }
        Ok(removal)
    }

    async fn deactivated(&self, database: &Arc<Database>, state_manager: &dyn StateManager) -> Result<()> {
        state_manager.deactivated(&DatabaseEvent::new(database)).await?;
        tracing::error!("Database {} deactivated in cluster {}", database.id, self.id);
        for listener in self.listeners() {
            listener.deactivated(database);
        }
        Ok(())
    }

    /// React to a classified failure of `database`.
    ///
    /// Returns true if the replica is no longer active, false if it was kept
    /// because it is the last active replica.
    pub async fn handle_failure(&self, database: &Arc<Database>, error: &DriverError) -> Result<bool> {
        match self.deactivate_unless_last(database, self.state_manager.as_ref()).await? {
            Removal::Removed => {
                tracing::warn!("Database {} failed: {}", database.id, error);
                Ok(true)
            }
            Removal::Absent => Ok(true),
            Removal::LastActive => {
                tracing::error!(
                    "Database {} failed but is the last active database in cluster {}: {}",
                    database.id,
                    self.id,
                    error
                );
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateManager, SqliteStateManager};
    use crate::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Counter {
        activated: AtomicUsize,
        deactivated: AtomicUsize,
    }

    impl DatabaseClusterListener for Counter {
        fn activated(&self, _database: &Database) {
            self.activated.fetch_add(1, Ordering::SeqCst);
        }

        fn deactivated(&self, _database: &Database) {
            self.deactivated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_build_rejects_bad_membership() {
        let memory = |_| Arc::new(MemoryStateManager::new()) as Arc<dyn StateManager>;
        assert!(ClusterBuilder::new("c").build(memory).is_err());

        let duplicate = ClusterBuilder::new("c")
            .database(Database::new("db1", "a"))
            .database(Database::new("db1", "b"))
            .build(memory);
        assert!(matches!(duplicate, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_start_activates_everything_on_first_run() {
        let cluster = testing::started_cluster(&["db2", "db1"]).await;
        let ids: Vec<String> = cluster.active_databases().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["db1", "db2"]);

        let persisted = cluster.state_manager().active_databases().await.unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn test_activation_is_idempotent_and_notifies() {
        let cluster = testing::started_cluster(&["db1", "db2"]).await;
        let counter = Arc::new(Counter::default());
        cluster.add_listener(counter.clone());
        let sm = cluster.state_manager().as_ref();
        let db2 = cluster.database("db2").unwrap();

        assert!(cluster.deactivate(&db2, sm).await.unwrap());
        assert!(!cluster.deactivate(&db2, sm).await.unwrap());
        assert!(!cluster.is_active("db2"));
        assert!(!sm.active_databases().await.unwrap().contains("db2"));

        assert!(cluster.activate(&db2, sm).await.unwrap());
        assert!(!cluster.activate(&db2, sm).await.unwrap());

        assert_eq!(counter.activated.load(Ordering::SeqCst), 1);
        assert_eq!(counter.deactivated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_failure_keeps_last_replica() {
        let cluster = testing::started_cluster(&["db1", "db2"]).await;
        let db1 = cluster.database("db1").unwrap();
        let db2 = cluster.database("db2").unwrap();

        assert!(cluster.handle_failure(&db1, &testing::link_failure()).await.unwrap());
        assert!(!cluster.handle_failure(&db2, &testing::link_failure()).await.unwrap());
        assert!(cluster.is_active("db2"));
    }

    #[tokio::test]
    async fn test_restart_restores_active_set_and_recovers() {
        use crate::durability::{DurabilityPhase, InvocationEvent, InvocationKey, InvokerEvent, InvokerResult};
        use crate::id::TransactionId;

        let dir = tempdir().unwrap();
        let build = |path: std::path::PathBuf| {
            ClusterBuilder::new("orders")
                .database(Database::new("db1", "a"))
                .database(Database::new("db2", "b"))
                .database(Database::new("db3", "c"))
                .build(|_| {
                    Arc::new(SqliteStateManager::new(path, "orders").unwrap()) as Arc<dyn StateManager>
                })
                .unwrap()
        };

        {
            let cluster = build(dir.path().to_path_buf());
            cluster.start().await.unwrap();
            let sm = cluster.state_manager();
            let db1 = cluster.database("db1").unwrap();
            cluster.deactivate(&db1, sm.as_ref()).await.unwrap();

            // Crash between the replica calls and the AFTER marker
            let key = InvocationKey {
                transaction_id: TransactionId(1),
                phase: DurabilityPhase::Execute,
            };
            sm.before_invocation(&InvocationEvent::before(key)).await.unwrap();
            sm.before_invoker(&InvokerEvent::before(key, "db2")).await.unwrap();
            sm.before_invoker(&InvokerEvent::before(key, "db3")).await.unwrap();
            sm.after_invoker(&InvokerEvent::after(key, "db2", InvokerResult::Value("1".into())))
                .await
                .unwrap();
        }

        let cluster = build(dir.path().to_path_buf());
        cluster.start().await.unwrap();

        assert!(!cluster.is_active("db1"));
        assert!(cluster.is_active("db2"));
        assert!(!cluster.is_active("db3"));
        assert!(cluster.state_manager().recover().await.unwrap().is_empty());
    }
}
