//! Distributed State Manager
//!
//! Wraps a local state manager and mirrors every transition to the other
//! members through a command dispatcher. Activations and BEFORE markers are
//! applied locally before they are broadcast; deactivations and AFTER markers
//! are broadcast first. Each member keeps the in-flight invocations of the
//! others and recovers them when that member disappears.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{codec, StateManager};
use crate::cluster::DatabaseCluster;
use crate::database::DatabaseEvent;
use crate::distributed::{
    Command, CommandDispatcher, CommandOutcome, Member, MembershipListener,
    RemoteInvocationDescriptor, RemoteInvokerDescriptor, StateCommandContext, Stateful,
};
use crate::durability::{InvocationEvent, InvocationKey, InvocationMap, InvokerEvent, Marker};
use crate::error::Result;

/// In-flight invocations of other members, by member id
///
/// Keyed by id alone so a member that comes back on another address is
/// still the same entry.
#[derive(Default)]
pub struct RemoteInvokers {
    members: RwLock<HashMap<String, InvocationMap>>,
}

impl RemoteInvokers {
    /// Start tracking a member; an existing map is kept
    pub async fn add_member(&self, member: &Member) {
        self.members.write().await.entry(member.id.clone()).or_default();
    }

    /// Stop tracking a member, returning what it left unfinished
    pub async fn remove_member(&self, member: &Member) -> Option<InvocationMap> {
        self.members.write().await.remove(&member.id)
    }

    pub async fn begin(&self, member: &Member, key: InvocationKey) {
        self.members
            .write()
            .await
            .entry(member.id.clone())
            .or_default()
            .entry(key)
            .or_default();
    }

    /// Record an invoker marker. A BEFORE never overwrites a recorded AFTER.
    pub async fn record(&self, member: &Member, event: &InvokerEvent) {
        let mut members = self.members.write().await;
        let invokers = members
            .entry(member.id.clone())
            .or_default()
            .entry(event.key())
            .or_default();

        match event.marker {
            Marker::Before => {
                invokers.entry(event.database.clone()).or_insert_with(|| event.clone());
            }
            Marker::After => {
                invokers.insert(event.database.clone(), event.clone());
            }
        }
    }

    /// Drop a finished invocation. Returns true if it was tracked.
    pub async fn complete(&self, member: &Member, key: InvocationKey) -> bool {
        let mut members = self.members.write().await;
        members
            .get_mut(&member.id)
            .map_or(false, |invocations| invocations.remove(&key).is_some())
    }

    pub async fn snapshot(&self, member: &Member) -> InvocationMap {
        self.members
            .read()
            .await
            .get(&member.id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Receiving side of the distributed state manager
pub struct DistributedContext {
    cluster: Weak<DatabaseCluster>,
    local: Arc<dyn StateManager>,
    remote: RemoteInvokers,
}

impl DistributedContext {
    pub fn remote(&self) -> &RemoteInvokers {
        &self.remote
    }
}

impl StateCommandContext for DistributedContext {
    fn cluster(&self) -> Option<Arc<DatabaseCluster>> {
        self.cluster.upgrade()
    }

    fn local_state_manager(&self) -> &Arc<dyn StateManager> {
        &self.local
    }

    fn remote_invokers(&self) -> &RemoteInvokers {
        &self.remote
    }
}

#[async_trait]
impl MembershipListener for DistributedContext {
    async fn added(&self, member: &Member) {
        tracing::info!("Tracking invocations of member {}", member);
        self.remote.add_member(member).await;
    }

    async fn removed(&self, member: &Member) {
        let Some(invocations) = self.remote.remove_member(member).await else {
            return;
        };
        if invocations.is_empty() {
            return;
        }
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };

        tracing::warn!(
            "Member {} left with {} unfinished invocations, recovering",
            member,
            invocations.len()
        );
        // Deactivations go through the shared state manager so every member applies them
        let state_manager = Arc::clone(cluster.state_manager());
        if let Err(e) = cluster
            .durability()
            .recover(&cluster, state_manager.as_ref(), invocations)
            .await
        {
            tracing::error!("Recovery of invocations from {} failed: {}", member, e);
        }
    }
}

#[async_trait]
impl Stateful for DistributedContext {
    async fn get_state(&self) -> Result<Vec<u8>> {
        codec::encode_active_databases(&self.local.active_databases().await?)
    }

    async fn set_state(&self, state: &[u8]) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        let databases: BTreeSet<String> = codec::decode_active_databases(state)?;
        tracing::info!("Adopting active databases {:?}", databases);
        self.local.set_active_databases(&databases).await
    }
}

/// State manager shared by every member of the group
pub struct DistributedStateManager {
    context: Arc<DistributedContext>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

impl DistributedStateManager {
    pub fn new(
        cluster: Weak<DatabaseCluster>,
        local: Arc<dyn StateManager>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> Self {
        Self {
            context: Arc::new(DistributedContext {
                cluster,
                local,
                remote: RemoteInvokers::default(),
            }),
            dispatcher,
        }
    }

    pub fn context(&self) -> &Arc<DistributedContext> {
        &self.context
    }

    pub fn dispatcher(&self) -> &Arc<dyn CommandDispatcher> {
        &self.dispatcher
    }

    fn local(&self) -> &dyn StateManager {
        self.context.local.as_ref()
    }

    fn member(&self) -> Member {
        self.dispatcher.local().clone()
    }

    /// Run a command on every other member; failures are logged, not raised
    async fn broadcast(&self, command: Command) {
        let outcomes = self.dispatcher.execute_all(&command).await;
        for (member, outcome) in outcomes {
            match outcome {
                CommandOutcome::Completed(_) => {}
                CommandOutcome::Failed(e) => {
                    tracing::warn!("{} failed on {}: {}", command.type_name(), member, e);
                }
                CommandOutcome::Unreachable(e) => {
                    tracing::warn!("{} not delivered to {}: {}", command.type_name(), member, e);
                }
            }
        }
    }

    fn invocation(&self, event: &InvocationEvent) -> RemoteInvocationDescriptor {
        RemoteInvocationDescriptor {
            member: self.member(),
            event: event.clone(),
        }
    }

    fn invoker(&self, event: &InvokerEvent) -> Command {
        Command::Invoker(RemoteInvokerDescriptor {
            member: self.member(),
            event: event.clone(),
        })
    }
}

#[async_trait]
impl StateManager for DistributedStateManager {
    async fn start(&self) -> Result<()> {
        self.local().start().await?;
        let context = Arc::clone(&self.context);
        self.dispatcher
            .start(context.clone(), context.clone(), context)
            .await
    }

    async fn stop(&self) -> Result<()> {
        self.dispatcher.stop().await?;
        self.local().stop().await
    }

    async fn active_databases(&self) -> Result<BTreeSet<String>> {
        self.local().active_databases().await
    }

    async fn set_active_databases(&self, databases: &BTreeSet<String>) -> Result<()> {
        self.local().set_active_databases(databases).await
    }

    async fn activated(&self, event: &DatabaseEvent) -> Result<()> {
        self.local().activated(event).await?;
        self.broadcast(Command::Activation(event.clone())).await;
        Ok(())
    }

    async fn deactivated(&self, event: &DatabaseEvent) -> Result<()> {
        self.broadcast(Command::Deactivation(event.clone())).await;
        self.local().deactivated(event).await
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.local().before_invocation(event).await?;
        self.broadcast(Command::PreInvocation(self.invocation(event))).await;
        Ok(())
    }

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.broadcast(Command::PostInvocation(self.invocation(event))).await;
        self.local().after_invocation(event).await
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        self.local().before_invoker(event).await?;
        self.broadcast(self.invoker(event)).await;
        Ok(())
    }

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()> {
        self.broadcast(self.invoker(event)).await;
        self.local().after_invoker(event).await
    }

    async fn recover(&self) -> Result<InvocationMap> {
        self.local().recover().await
    }

    async fn is_membership_empty(&self) -> bool {
        let local = self.dispatcher.local();
        self.dispatcher
            .members()
            .await
            .iter()
            .all(|member| member == local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalCommandDispatcher, LocalGroup};
    use crate::durability::{DurabilityPhase, InvokerResult};
    use crate::id::TransactionId;
    use crate::testing;

    fn key(id: u64) -> InvocationKey {
        InvocationKey {
            transaction_id: TransactionId(id),
            phase: DurabilityPhase::Execute,
        }
    }

    fn dispatcher(group: &Arc<LocalGroup>, id: &str) -> Arc<LocalCommandDispatcher> {
        Arc::new(LocalCommandDispatcher::new(
            Member::new(id, format!("local:{}", id)),
            Arc::clone(group),
        ))
    }

    #[tokio::test]
    async fn test_remote_invokers() {
        let remote = RemoteInvokers::default();
        let member = Member::new("node-2", "local:node-2");
        let k = key(3);

        remote.add_member(&member).await;
        remote.begin(&member, k).await;
        remote.add_member(&member).await;
        assert_eq!(remote.snapshot(&member).await.len(), 1);

        remote
            .record(&member, &InvokerEvent::after(k, "db1", InvokerResult::Value("1".into())))
            .await;
        remote.record(&member, &InvokerEvent::before(k, "db1")).await;
        assert_eq!(remote.snapshot(&member).await[&k]["db1"].marker, Marker::After);

        assert!(remote.complete(&member, k).await);
        assert!(!remote.complete(&member, k).await);
        assert!(remote.remove_member(&member).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_invokers_follow_member_id() {
        let remote = RemoteInvokers::default();
        let before = Member::new("node-2", "10.0.0.2:7654");
        let after = Member::new("node-2", "10.0.0.9:7654");
        let k = key(4);

        remote.add_member(&before).await;
        remote.record(&before, &InvokerEvent::before(k, "db1")).await;
        assert_eq!(remote.snapshot(&after).await.len(), 1);

        let left = remote.remove_member(&after).await.unwrap();
        assert!(left[&k].contains_key("db1"));
        assert!(remote.remove_member(&before).await.is_none());
    }

    #[tokio::test]
    async fn test_state_transfer_and_mirrored_activation() {
        let group = LocalGroup::new();
        let (a, _) = testing::distributed_cluster(&["db1", "db2", "db3"], dispatcher(&group, "a")).await;

        let db3 = a.database("db3").unwrap();
        a.deactivate(&db3, a.state_manager().as_ref()).await.unwrap();

        let (b, _) = testing::distributed_cluster(&["db1", "db2", "db3"], dispatcher(&group, "b")).await;
        assert!(b.is_active("db1"));
        assert!(!b.is_active("db3"));
        assert!(!b.state_manager().is_membership_empty().await);

        let db1 = b.database("db1").unwrap();
        b.deactivate(&db1, b.state_manager().as_ref()).await.unwrap();
        assert!(!a.is_active("db1"));

        a.activate(&db3, a.state_manager().as_ref()).await.unwrap();
        assert!(b.is_active("db3"));
    }

    #[tokio::test]
    async fn test_markers_are_mirrored() {
        let group = LocalGroup::new();
        let (a, _) = testing::distributed_cluster(&["db1", "db2"], dispatcher(&group, "a")).await;
        let (_b, context_b) = testing::distributed_cluster(&["db1", "db2"], dispatcher(&group, "b")).await;
        let member_a = Member::new("a", "local:a");
        let k = key(77);

        let sm = a.state_manager();
        sm.before_invocation(&InvocationEvent::before(k)).await.unwrap();
        sm.before_invoker(&InvokerEvent::before(k, "db1")).await.unwrap();

        let seen = context_b.remote().snapshot(&member_a).await;
        assert!(seen[&k].contains_key("db1"));

        sm.after_invoker(&InvokerEvent::after(k, "db1", InvokerResult::Value("1".into())))
            .await
            .unwrap();
        sm.after_invocation(&InvocationEvent::after(k)).await.unwrap();
        assert!(context_b.remote().snapshot(&member_a).await.is_empty());
        assert!(sm.recover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_member_removal_recovers_its_invocations() {
        let group = LocalGroup::new();
        let (a, _) = testing::distributed_cluster(&["db1", "db2", "db3"], dispatcher(&group, "a")).await;
        let (b, _) = testing::distributed_cluster(&["db1", "db2", "db3"], dispatcher(&group, "b")).await;
        let k = key(5);

        // a crashes part-way through a write: db3 never reported back
        let sm = a.state_manager();
        sm.before_invocation(&InvocationEvent::before(k)).await.unwrap();
        for db in ["db1", "db2", "db3"] {
            sm.before_invoker(&InvokerEvent::before(k, db)).await.unwrap();
        }
        for db in ["db1", "db2"] {
            sm.after_invoker(&InvokerEvent::after(k, db, InvokerResult::Value("1".into())))
                .await
                .unwrap();
        }
        sm.stop().await.unwrap();

        assert!(b.is_active("db1"));
        assert!(b.is_active("db2"));
        assert!(!b.is_active("db3"));
        assert!(b.state_manager().is_membership_empty().await);
    }

    #[tokio::test]
    async fn test_recovery_of_evicted_member_reaches_survivors() {
        let group = LocalGroup::new();
        let (a, context_a) = testing::distributed_cluster(&["db1", "db2", "db3"], dispatcher(&group, "a")).await;
        let (b, _) = testing::distributed_cluster(&["db1", "db2", "db3"], dispatcher(&group, "b")).await;
        let k = key(9);

        let sm = b.state_manager();
        sm.before_invocation(&InvocationEvent::before(k)).await.unwrap();
        for db in ["db1", "db2", "db3"] {
            sm.before_invoker(&InvokerEvent::before(k, db)).await.unwrap();
        }

        // a gives up on b while b is still running
        context_a.removed(&Member::new("b", "local:b")).await;

        let active_a = a.state_manager().active_databases().await.unwrap();
        let active_b = b.state_manager().active_databases().await.unwrap();
        assert_eq!(active_a, active_b);
        assert_eq!(active_a.into_iter().collect::<Vec<_>>(), vec!["db1"]);
        assert!(!b.is_active("db2"));
        assert!(!b.is_active("db3"));
    }

    #[tokio::test]
    async fn test_set_state() {
        let group = LocalGroup::new();
        let (a, context) = testing::distributed_cluster(&["db1", "db2"], dispatcher(&group, "a")).await;

        context.set_state(&[]).await.unwrap();
        assert_eq!(
            a.state_manager().active_databases().await.unwrap().len(),
            2
        );

        let state = codec::encode_active_databases(&["db2".to_string()].into()).unwrap();
        context.set_state(&state).await.unwrap();
        let active: Vec<String> = a.state_manager().active_databases().await.unwrap().into_iter().collect();
        assert_eq!(active, vec!["db2"]);
        assert_eq!(context.get_state().await.unwrap(), state);

        assert!(context.set_state(&[0, 0, 0, 1]).await.is_err());
    }
}
