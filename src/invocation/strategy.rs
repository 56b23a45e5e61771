//! Invocation Strategies

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;

use super::{ExecutionMode, InvocationTarget, Invoker, Outcome};
use crate::cluster::DatabaseCluster;
use crate::database::Database;
use crate::dialect::DriverError;
use crate::error::{Error, Result};
use crate::sql::Value;

/// Per-replica results, ordered by replica id
pub type Results = BTreeMap<Arc<Database>, Value>;

/// Which replicas a call is sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStrategy {
    /// Every active replica
    OnAll,
    /// The balancer's choice, no retry
    OnNext,
    /// First bound replica that answers, then OnNext
    OnAny,
    /// Every active replica the target is already bound to
    OnExisting,
}

impl std::fmt::Display for InvocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStrategy::OnAll => write!(f, "ON_ALL"),
            InvocationStrategy::OnNext => write!(f, "ON_NEXT"),
            InvocationStrategy::OnAny => write!(f, "ON_ANY"),
            InvocationStrategy::OnExisting => write!(f, "ON_EXISTING"),
        }
    }
}

impl InvocationStrategy {
    /// Run `invoker` against the replicas this strategy selects
    pub async fn invoke(self, target: &dyn InvocationTarget, invoker: &dyn Invoker) -> Result<Results> {
        match self {
            InvocationStrategy::OnAll => {
                let databases = target.cluster().balancer().databases();
                invoke_each(databases, target, invoker).await
            }
            InvocationStrategy::OnExisting => {
                let databases = target.entries().into_iter().map(|(db, _)| db).collect();
                invoke_each(databases, target, invoker).await
            }
            InvocationStrategy::OnNext => invoke_on_next(target, invoker).await,
            InvocationStrategy::OnAny => invoke_on_any(target, invoker).await,
        }
    }
}

fn no_active_databases(cluster: &DatabaseCluster) -> Error {
    Error::exhausted(cluster.id(), vec!["no active databases".to_string()])
}

async fn call(
    target: &dyn InvocationTarget,
    invoker: &dyn Invoker,
    database: &Arc<Database>,
) -> (Arc<Database>, Outcome) {
    let outcome = match target.handle(database).await {
        Ok(handle) => invoker.invoke(database, handle).await,
        Err(e) => Err(e),
    };
    (Arc::clone(database), outcome)
}

async fn invoke_each(
    databases: Vec<Arc<Database>>,
    target: &dyn InvocationTarget,
    invoker: &dyn Invoker,
) -> Result<Results> {
    let cluster = target.cluster();
    if databases.is_empty() {
        return Err(no_active_databases(cluster));
    }

    // All BEFORE hooks complete before the first replica is called
    for db in &databases {
        invoker.before_invoke(db).await?;
    }

    let outcomes = match cluster.execution_mode() {
        ExecutionMode::Parallel => {
            join_all(databases.iter().map(|db| call(target, invoker, db))).await
        }
        ExecutionMode::Sequential => {
            let mut outcomes = Vec::with_capacity(databases.len());
            for db in &databases {
                outcomes.push(call(target, invoker, db).await);
            }
            outcomes
        }
    };

    for (db, outcome) in &outcomes {
        invoker.after_invoke(db, outcome).await?;
    }

    collect(cluster, outcomes).await
}

/// Fold per-replica outcomes into a result map.
///
/// Classified failures deactivate their replica unless it is the last one
/// active; application errors are returned as-is and deactivate nothing.
async fn collect(cluster: &DatabaseCluster, outcomes: Vec<(Arc<Database>, Outcome)>) -> Result<Results> {
    let mut results = Results::new();
    let mut application_error: Option<(Arc<Database>, DriverError)> = None;
    let mut causes = Vec::new();
    let mut stranded = false;

    for (db, outcome) in outcomes {
        match outcome {
            Ok(value) => {
                results.insert(db, value);
            }
            Err(e) if cluster.dialect().indicates_failure(&e) => {
                causes.push(format!("{}: {}", db.id, e));
                if !cluster.handle_failure(&db, &e).await? {
                    stranded = true;
                }
            }
            Err(e) => {
                if application_error.is_none() {
                    application_error = Some((db, e));
                }
            }
        }
    }

    if let Some((db, source)) = application_error {
        return Err(Error::Driver {
            database: db.id.clone(),
            source,
        });
    }

    if stranded || results.is_empty() {
        return Err(Error::exhausted(cluster.id(), causes));
    }

    Ok(results)
}

/// One call to one replica with balancer and invoker hooks around it
async fn invoke_single(
    target: &dyn InvocationTarget,
    invoker: &dyn Invoker,
    database: &Arc<Database>,
    handle: Option<Arc<dyn crate::sql::Handle>>,
) -> Result<Outcome> {
    let balancer = target.cluster().balancer();

    invoker.before_invoke(database).await?;
    balancer.before_invocation(database);
    let outcome = match handle {
        Some(handle) => invoker.invoke(database, handle).await,
        None => call(target, invoker, database).await.1,
    };
    balancer.after_invocation(database);
    invoker.after_invoke(database, &outcome).await?;

    Ok(outcome)
}

/// Error for a failed single-target call; deactivates the replica when allowed
async fn single_failure(cluster: &DatabaseCluster, database: &Arc<Database>, error: DriverError) -> Error {
    if !cluster.dialect().indicates_failure(&error) {
        return Error::Driver {
            database: database.id.clone(),
            source: error,
        };
    }

    match cluster.handle_failure(database, &error).await {
        Ok(true) => Error::Driver {
            database: database.id.clone(),
            source: error,
        },
        Ok(false) => Error::exhausted(cluster.id(), vec![format!("{}: {}", database.id, error)]),
        Err(e) => e,
    }
}

async fn invoke_on_next(target: &dyn InvocationTarget, invoker: &dyn Invoker) -> Result<Results> {
    let cluster = target.cluster();
    let database = cluster
        .balancer()
        .next()
        .ok_or_else(|| no_active_databases(cluster))?;

    match invoke_single(target, invoker, &database, None).await? {
        Ok(value) => Ok(Results::from([(database, value)])),
        Err(e) => Err(single_failure(cluster, &database, e).await),
    }
}

async fn invoke_on_any(target: &dyn InvocationTarget, invoker: &dyn Invoker) -> Result<Results> {
    let cluster = target.cluster();

    for (database, handle) in target.entries() {
        match invoke_single(target, invoker, &database, Some(handle)).await? {
            Ok(value) => return Ok(Results::from([(database, value)])),
            Err(e) if cluster.dialect().indicates_failure(&e) => {
                if !cluster.handle_failure(&database, &e).await? {
                    return Err(Error::exhausted(cluster.id(), vec![format!("{}: {}", database.id, e)]));
                }
                tracing::debug!("Database {} failed, trying next bound database", database.id);
            }
            Err(e) => {
                return Err(Error::Driver {
                    database: database.id.clone(),
                    source: e,
                })
            }
        }
    }

    invoke_on_next(target, invoker).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{InvocationTarget, OperationInvoker};
    use crate::sql::{Operation, SqlProxy};
    use crate::testing::{self, ScriptedConnector};

    async fn setup(ids: &[&str]) -> (Arc<DatabaseCluster>, Arc<ScriptedConnector>, Arc<SqlProxy>) {
        let cluster = testing::started_cluster(ids).await;
        let connector = ScriptedConnector::new();
        let proxy = SqlProxy::connect(Arc::clone(&cluster), connector.clone()).await.unwrap();
        (cluster, connector, proxy)
    }

    fn ids(results: &Results) -> Vec<String> {
        results.keys().map(|db| db.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_on_all_deactivates_failed_replica() {
        let (cluster, connector, proxy) = setup(&["db3", "db1", "db2"]).await;
        connector.fail("db2", "execute", testing::link_failure());

        let invoker = OperationInvoker::new(Operation::execute("UPDATE t SET x = 1"));
        let results = InvocationStrategy::OnAll.invoke(&*proxy, &invoker).await.unwrap();

        assert_eq!(ids(&results), vec!["db1", "db3"]);
        assert!(!cluster.is_active("db2"));
        assert!(cluster.is_active("db1"));
        assert!(cluster.is_active("db3"));
    }

    #[tokio::test]
    async fn test_on_all_sequential_mode_orders_calls() {
        let cluster = testing::started_cluster_with(&["db2", "db1"], |b| {
            b.execution_mode(ExecutionMode::Sequential)
        })
        .await;
        let connector = ScriptedConnector::new();
        let proxy = SqlProxy::connect(Arc::clone(&cluster), connector.clone()).await.unwrap();

        let invoker = OperationInvoker::new(Operation::execute("DELETE FROM t"));
        InvocationStrategy::OnAll.invoke(&*proxy, &invoker).await.unwrap();
        assert_eq!(connector.calls_to("execute"), vec!["db1", "db2"]);
    }

    #[tokio::test]
    async fn test_on_all_never_deactivates_last_replica() {
        let (cluster, connector, proxy) = setup(&["db1", "db2"]).await;
        connector.fail("db1", "execute", testing::link_failure());
        connector.fail("db2", "execute", testing::link_failure());

        let invoker = OperationInvoker::new(Operation::execute("UPDATE t SET x = 1"));
        let err = InvocationStrategy::OnAll.invoke(&*proxy, &invoker).await.unwrap_err();

        assert!(err.is_cluster_failure());
        assert!(!cluster.is_active("db1"));
        assert!(cluster.is_active("db2"));
        assert_eq!(cluster.balancer().size(), 1);
    }

    #[tokio::test]
    async fn test_single_replica_failure_propagates() {
        let (cluster, connector, proxy) = setup(&["db1"]).await;
        connector.fail("db1", "execute", testing::link_failure());

        let invoker = OperationInvoker::new(Operation::execute("UPDATE t SET x = 1"));
        let err = InvocationStrategy::OnAll.invoke(&*proxy, &invoker).await.unwrap_err();
        assert!(err.is_cluster_failure());
        assert!(cluster.is_active("db1"));
    }

    #[tokio::test]
    async fn test_application_error_propagates_without_deactivation() {
        let (cluster, connector, proxy) = setup(&["db1", "db2"]).await;
        connector.fail("db2", "execute", testing::duplicate_key());

        let invoker = OperationInvoker::new(Operation::execute("INSERT INTO t VALUES (1)"));
        let err = InvocationStrategy::OnAll.invoke(&*proxy, &invoker).await.unwrap_err();

        match err {
            Error::Driver { database, source } => {
                assert_eq!(database, "db2");
                assert_eq!(source.code, Some(1062));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cluster.balancer().size(), 2);
    }

    #[tokio::test]
    async fn test_on_any_skips_failed_replicas() {
        let (cluster, connector, proxy) = setup(&["A", "B", "C"]).await;
        connector.fail("A", "metadata", testing::link_failure());
        connector.fail("B", "metadata", testing::link_failure());
        connector.respond("C", "metadata", Value::Text("MariaDB".into()));

        let invoker = OperationInvoker::new(Operation::new("metadata", crate::sql::OperationClass::DriverRead));
        let results = InvocationStrategy::OnAny.invoke(&*proxy, &invoker).await.unwrap();

        assert_eq!(ids(&results), vec!["C"]);
        assert_eq!(results.values().next(), Some(&Value::Text("MariaDB".into())));
        assert!(!cluster.is_active("A"));
        assert!(!cluster.is_active("B"));
        assert!(cluster.is_active("C"));
    }

    #[tokio::test]
    async fn test_on_any_stops_at_first_success() {
        let (_cluster, connector, proxy) = setup(&["db1", "db2", "db3"]).await;

        let invoker = OperationInvoker::new(Operation::new("metadata", crate::sql::OperationClass::DriverRead));
        let results = InvocationStrategy::OnAny.invoke(&*proxy, &invoker).await.unwrap();

        assert_eq!(ids(&results), vec!["db1"]);
        assert_eq!(connector.calls_to("metadata"), vec!["db1"]);
    }

    #[tokio::test]
    async fn test_on_next_deactivates_without_retry() {
        let cluster = testing::started_cluster_with(&["db1", "db2"], |b| {
            b.balancer(crate::balancer::BalancerKind::Simple)
        })
        .await;
        let connector = ScriptedConnector::new();
        let proxy = SqlProxy::connect(Arc::clone(&cluster), connector.clone()).await.unwrap();
        connector.fail("db1", "query", testing::link_failure());

        let invoker = OperationInvoker::new(Operation::query("SELECT 1"));
        let err = InvocationStrategy::OnNext.invoke(&*proxy, &invoker).await.unwrap_err();

        assert!(matches!(err, Error::Driver { ref database, .. } if database == "db1"));
        assert!(!cluster.is_active("db1"));
        assert_eq!(connector.calls_to("query"), vec!["db1"]);

        let results = InvocationStrategy::OnNext.invoke(&*proxy, &invoker).await.unwrap();
        assert_eq!(ids(&results), vec!["db2"]);
    }

    #[tokio::test]
    async fn test_on_existing_targets_bound_replicas_only() {
        let (cluster, connector, proxy) = setup(&["db1", "db2", "db3"]).await;
        // db3 was never bound to this handle
        let handles = proxy
            .entries()
            .into_iter()
            .filter(|(db, _)| db.id != "db3")
            .collect();
        let statement = Operation::new("statement", crate::sql::OperationClass::Existing).returning_handle(false);
        let child = SqlProxy::child(&proxy, statement, handles, false);

        let invoker = OperationInvoker::new(Operation::commit());
        let results = InvocationStrategy::OnExisting.invoke(&*child, &invoker).await.unwrap();

        assert_eq!(ids(&results), vec!["db1", "db2"]);
        assert_eq!(cluster.balancer().size(), 3);
        assert_eq!(connector.calls_to("commit"), vec!["db1", "db2"]);
    }

    #[tokio::test]
    async fn test_empty_cluster_is_exhausted() {
        let (cluster, _connector, proxy) = setup(&["db1"]).await;
        cluster.balancer().clear();

        let invoker = OperationInvoker::new(Operation::query("SELECT 1"));
        for strategy in [
            InvocationStrategy::OnAll,
            InvocationStrategy::OnNext,
            InvocationStrategy::OnAny,
            InvocationStrategy::OnExisting,
        ] {
            let err = strategy.invoke(&*proxy, &invoker).await.unwrap_err();
            assert!(err.is_cluster_failure(), "{strategy} should be exhausted");
        }
    }
}
