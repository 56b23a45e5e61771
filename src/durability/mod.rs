//! Durability Tracking
//!
//! Brackets every write-class invocation with BEFORE/AFTER markers, and
//! every per-replica call within it with BEFORE/AFTER invoker markers. A
//! BEFORE without its AFTER, found after a crash, identifies a write that may
//! have reached only some replicas; `Durability::recover` decides which
//! replicas can no longer be trusted and deactivates them.

mod event;

pub use event::{
    DurabilityPhase, InvocationEvent, InvocationKey, InvocationMap, InvokerEvent, InvokerMap,
    InvokerResult, Marker,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::balancer::Removal;
use crate::cluster::DatabaseCluster;
use crate::database::Database;
use crate::error::Result;
use crate::id::TransactionIdGenerator;
use crate::invocation::{InvocationStrategy, InvocationTarget, Invoker, Outcome, Results};
use crate::sql::Handle;
use crate::state::StateManager;

/// How much is recorded per write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DurabilityLevel {
    /// Nothing is recorded
    None,
    /// Invocation markers only
    Coarse,
    /// Invocation and per-replica invoker markers
    #[default]
    Fine,
}

/// Durability tracker for one cluster
pub struct Durability {
    level: DurabilityLevel,
    ids: TransactionIdGenerator,
}

impl Durability {
    pub fn new(level: DurabilityLevel, ordinal: u16) -> Self {
        Self {
            level,
            ids: TransactionIdGenerator::new(ordinal),
        }
    }

    pub fn level(&self) -> DurabilityLevel {
        self.level
    }

    /// Run a write-class invocation with its markers recorded.
    ///
    /// The AFTER invocation marker is recorded whether or not the
    /// invocation succeeded; a failed write is abandoned, not pending.
    pub async fn invoke(
        &self,
        state_manager: &dyn StateManager,
        phase: DurabilityPhase,
        strategy: InvocationStrategy,
        target: &dyn InvocationTarget,
        invoker: &dyn Invoker,
    ) -> Result<Results> {
        if self.level == DurabilityLevel::None {
            return strategy.invoke(target, invoker).await;
        }

        let key = InvocationKey {
            transaction_id: self.ids.next(),
            phase,
        };

        state_manager.before_invocation(&InvocationEvent::before(key)).await?;

        let results = match self.level {
            DurabilityLevel::Fine => {
                let durable = DurableInvoker {
                    inner: invoker,
                    state_manager,
                    key,
                };
                strategy.invoke(target, &durable).await
            }
            _ => strategy.invoke(target, invoker).await,
        };

        if let Err(e) = state_manager.after_invocation(&InvocationEvent::after(key)).await {
            tracing::warn!("Failed to record completion of invocation {}: {}", key, e);
            results?;
            return Err(e);
        }

        results
    }

    /// Reconcile incomplete invocations by deactivating replicas whose state
    /// is unknown or disagrees with the others.
    pub async fn recover(
        &self,
        cluster: &DatabaseCluster,
        state_manager: &dyn StateManager,
        invocations: InvocationMap,
    ) -> Result<()> {
        for (key, invokers) in invocations {
            let suspects: Vec<String> = match self.level {
                DurabilityLevel::None => Vec::new(),
                DurabilityLevel::Coarse => cluster
                    .balancer()
                    .databases()
                    .iter()
                    .skip(1)
                    .map(|db| db.id.clone())
                    .collect(),
                DurabilityLevel::Fine => inconsistent_databases(&invokers),
            };

            if !suspects.is_empty() {
                tracing::warn!(
                    "Recovering incomplete invocation {}: deactivating {:?}",
                    key,
                    suspects
                );
            }

            for id in suspects {
                let Some(database) = cluster.database(&id) else {
                    tracing::warn!("Incomplete invocation {} names unknown database {}", key, id);
                    continue;
                };

                if cluster.deactivate_unless_last(&database, state_manager).await? == Removal::LastActive {
                    tracing::error!(
                        "Database {} may be inconsistent after invocation {} but is the last active database",
                        id,
                        key
                    );
                }
            }

            state_manager.after_invocation(&InvocationEvent::after(key)).await?;
        }

        Ok(())
    }
}

/// Replicas of one incomplete invocation that must not stay active.
///
/// The result reported by most completed replicas is the reference (lowest
/// id wins a tie). Replicas that disagree with it, or never completed, are
/// suspect. With no completed replica, the one with the lowest id is kept.
fn inconsistent_databases(invokers: &InvokerMap) -> Vec<String> {
    let completed: Vec<(&String, &InvokerResult)> = invokers
        .iter()
        .filter_map(|(id, event)| event.result.as_ref().map(|r| (id, r)))
        .collect();

    if completed.is_empty() {
        return invokers.keys().skip(1).cloned().collect();
    }

    let mut tally: BTreeMap<&InvokerResult, (usize, &String)> = BTreeMap::new();
    for (id, result) in &completed {
        tally.entry(*result).or_insert((0, *id)).0 += 1;
    }

    let reference = tally
        .iter()
        .max_by(|a, b| (a.1).0.cmp(&(b.1).0).then_with(|| (b.1).1.cmp((a.1).1)))
        .map(|(result, _)| *result);

    invokers
        .iter()
        .filter(|(_, event)| event.result.as_ref() != reference)
        .map(|(id, _)| id.clone())
        .collect()
}

/// Records invoker markers around each replica call
struct DurableInvoker<'a> {
    inner: &'a dyn Invoker,
    state_manager: &'a dyn StateManager,
    key: InvocationKey,
}

#[async_trait]
impl<'a> Invoker for DurableInvoker<'a> {
    async fn invoke(&self, database: &Arc<Database>, handle: Arc<dyn Handle>) -> Outcome {
        self.inner.invoke(database, handle).await
    }

    async fn before_invoke(&self, database: &Arc<Database>) -> Result<()> {
        self.inner.before_invoke(database).await?;
        self.state_manager
            .before_invoker(&InvokerEvent::before(self.key, &database.id))
            .await
    }

    async fn after_invoke(&self, database: &Arc<Database>, outcome: &Outcome) -> Result<()> {
        let event = InvokerEvent::after(self.key, &database.id, InvokerResult::from_outcome(outcome));
        self.state_manager.after_invoker(&event).await?;
        self.inner.after_invoke(database, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TransactionId;
    use crate::testing;

    fn key(id: u64) -> InvocationKey {
        InvocationKey {
            transaction_id: TransactionId(id),
            phase: DurabilityPhase::Execute,
        }
    }

    fn done(k: InvocationKey, db: &str, value: &str) -> InvokerEvent {
        InvokerEvent::after(k, db, InvokerResult::Value(value.to_string()))
    }

    fn invokers(events: Vec<InvokerEvent>) -> InvokerMap {
        events.into_iter().map(|e| (e.database.clone(), e)).collect()
    }

    #[test]
    fn test_unfinished_replica_is_suspect() {
        let k = key(1);
        let map = invokers(vec![
            done(k, "db1", "1"),
            done(k, "db2", "1"),
            InvokerEvent::before(k, "db3"),
        ]);
        assert_eq!(inconsistent_databases(&map), vec!["db3"]);
    }

    #[test]
    fn test_minority_result_is_suspect() {
        let k = key(1);
        let map = invokers(vec![
            done(k, "db1", "1"),
            InvokerEvent::after(
                k,
                "db2",
                InvokerResult::Exception {
                    code: Some(1062),
                    sql_state: Some("23000".into()),
                    message: "Duplicate entry".into(),
                },
            ),
            done(k, "db3", "1"),
        ]);
        assert_eq!(inconsistent_databases(&map), vec!["db2"]);
    }

    #[test]
    fn test_tie_prefers_lowest_id() {
        let k = key(1);
        let map = invokers(vec![done(k, "db1", "1"), done(k, "db2", "2")]);
        assert_eq!(inconsistent_databases(&map), vec!["db2"]);
    }

    #[test]
    fn test_nothing_completed_keeps_lowest_id() {
        let k = key(1);
        let map = invokers(vec![InvokerEvent::before(k, "db2"), InvokerEvent::before(k, "db1")]);
        assert_eq!(inconsistent_databases(&map), vec!["db2"]);
    }

    #[tokio::test]
    async fn test_fine_recovery_deactivates_and_clears() {
        let cluster = testing::started_cluster(&["db1", "db2", "db3"]).await;
        let state_manager = cluster.state_manager();

        let k = key(42);
        state_manager.before_invocation(&InvocationEvent::before(k)).await.unwrap();
        for db in ["db1", "db2", "db3"] {
            state_manager.before_invoker(&InvokerEvent::before(k, db)).await.unwrap();
        }
        state_manager.after_invoker(&done(k, "db1", "1")).await.unwrap();
        state_manager.after_invoker(&done(k, "db2", "1")).await.unwrap();

        let pending = state_manager.recover().await.unwrap();
        assert_eq!(pending.len(), 1);

        cluster
            .durability()
            .recover(&cluster, state_manager.as_ref(), pending)
            .await
            .unwrap();

        assert!(cluster.is_active("db1"));
        assert!(cluster.is_active("db2"));
        assert!(!cluster.is_active("db3"));
        assert!(state_manager.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_coarse_recovery_keeps_primary_only() {
        let cluster = testing::started_cluster_with(&["db1", "db2", "db3"], |b| {
            b.durability(DurabilityLevel::Coarse)
        })
        .await;

        let mut pending = InvocationMap::new();
        pending.insert(key(7), InvokerMap::new());
        cluster
            .durability()
            .recover(&cluster, cluster.state_manager().as_ref(), pending)
            .await
            .unwrap();

        let active: Vec<String> = cluster.active_databases().iter().map(|d| d.id.clone()).collect();
        assert_eq!(active, vec!["db1"]);
    }

    #[tokio::test]
    async fn test_recovery_never_strands_cluster() {
        let cluster = testing::started_cluster(&["db1", "db2"]).await;
        let db1 = cluster.database("db1").unwrap();
        cluster.deactivate(&db1, cluster.state_manager().as_ref()).await.unwrap();

        let k = key(9);
        let mut pending = InvocationMap::new();
        pending.insert(
            k,
            invokers(vec![done(k, "db1", "1"), InvokerEvent::before(k, "db2")]),
        );
        cluster
            .durability()
            .recover(&cluster, cluster.state_manager().as_ref(), pending)
            .await
            .unwrap();

        assert!(cluster.is_active("db2"));
        assert_eq!(cluster.balancer().size(), 1);
    }
}
