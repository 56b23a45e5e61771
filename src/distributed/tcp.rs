//! TCP dispatch
//!
//! Members find each other through a static seed list, exchange heartbeats,
//! and run commands over framed request/response connections. A member that
//! misses heartbeats or fails a request is removed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{
    Command, CommandDispatcher, CommandOutcome, Member, MemberTable, MembershipListener,
    StateCommandContext, Stateful,
};
use crate::error::{Error, Result};
use crate::network::{Message, MessageHandler, NetworkClient, NetworkServer};

/// Timing and addressing of a TCP dispatcher
#[derive(Debug, Clone)]
pub struct TcpDispatcherConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Seed addresses of other members
    pub peers: Vec<String>,
    pub heartbeat_interval: Duration,
    /// Silence after which a member is removed
    pub member_timeout: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

enum MembershipEvent {
    Added(Member),
    Removed(Member),
    /// A known member joined again: its previous session is over.
    /// `done` fires once the previous session has been recovered.
    Rejoined {
        previous: Member,
        current: Member,
        done: oneshot::Sender<()>,
    },
}

struct Running {
    server: NetworkServer,
    tasks: Vec<JoinHandle<()>>,
}

/// Command dispatcher over TCP
pub struct TcpCommandDispatcher {
    config: TcpDispatcherConfig,
    members: Arc<MemberTable>,
    client: Arc<NetworkClient>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MembershipEvent>>>,
    running: Mutex<Option<Running>>,
}

impl TcpCommandDispatcher {
    pub fn new(local: Member, config: TcpDispatcherConfig) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = NetworkClient::new(config.connect_timeout, config.request_timeout);

        Self {
            config,
            members: Arc::new(MemberTable::new(local)),
            client: Arc::new(client),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            running: Mutex::new(None),
        }
    }

    /// Record a new member and queue its notification
    async fn admit(&self, member: Member) {
        admit(&self.members, &self.events, member).await;
    }

    /// Forget a member and queue its notification
    async fn evict(&self, member: &Member, reason: &str) {
        if self.members.remove(member).await {
            tracing::warn!("Removing member {}: {}", member, reason);
            let _ = self.events.send(MembershipEvent::Removed(member.clone()));
        }
    }

    /// Contact the seeds and every member they report, taking state from the
    /// first member that answers
    async fn join(&self, stateful: &dyn Stateful) -> Result<()> {
        let local = self.members.local().clone();
        let mut pending: VecDeque<String> = self
            .config
            .peers
            .iter()
            .filter(|addr| **addr != local.address)
            .cloned()
            .collect();
        let mut contacted = BTreeSet::new();
        let mut state_received = false;

        while let Some(address) = pending.pop_front() {
            if !contacted.insert(address.clone()) {
                continue;
            }

            match self.client.send(&address, Message::Join { member: local.clone() }).await {
                Ok(Message::JoinAck { member, members, state }) => {
                    tracing::info!("Joined {} at {}", member, address);
                    if !state_received {
                        stateful.set_state(&state).await?;
                        state_received = true;
                    }
                    self.admit(member).await;
                    for other in members {
                        if other.id != local.id && !self.members.contains(&other).await {
                            pending.push_back(other.address);
                        }
                    }
                }
                Ok(other) => {
                    tracing::warn!("Unexpected {} from {} during join", other.type_name(), address);
                }
                Err(e) => {
                    tracing::debug!("Peer {} unreachable during join: {}", address, e);
                }
            }
        }

        if !state_received {
            tracing::info!("No peers reachable, starting as first member");
        }

        Ok(())
    }
}

async fn admit(
    members: &MemberTable,
    events: &mpsc::UnboundedSender<MembershipEvent>,
    member: Member,
) {
    if members.insert(member.clone()).await {
        tracing::info!("Member {} added", member);
        let _ = events.send(MembershipEvent::Added(member));
    }
}

/// Answers requests from other members
struct DispatchHandler {
    members: Arc<MemberTable>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    context: Arc<dyn StateCommandContext>,
    stateful: Arc<dyn Stateful>,
}

impl DispatchHandler {
    /// Admit a joining member. A member already in the table restarted
    /// without leaving, so its previous session is recovered before it is
    /// answered.
    async fn accept_join(&self, member: Member) {
        let Some(previous) = self.members.get(&member.id).await.map(|state| state.member) else {
            admit(&self.members, &self.events, member).await;
            return;
        };

        tracing::warn!("Member {} joined again, recovering its previous session", member);
        self.members.insert(member.clone()).await;

        let (done, recovered) = oneshot::channel();
        let event = MembershipEvent::Rejoined {
            previous,
            current: member,
            done,
        };
        if self.events.send(event).is_ok() {
            let _ = recovered.await;
        }
    }
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, peer_addr: &str, message: Message) -> Option<Message> {
        let local = self.members.local().clone();

        let response = match message {
            Message::Join { member } => {
                let joining = member.id.clone();
                if member.id != local.id {
                    self.accept_join(member).await;
                }
                match self.stateful.get_state().await {
                    Ok(state) => {
                        let members = self
                            .members
                            .peers()
                            .await
                            .into_iter()
                            .filter(|m| m.id != joining)
                            .collect();
                        Message::JoinAck {
                            member: local,
                            members,
                            state,
                        }
                    }
                    Err(e) => Message::Error {
                        message: format!("State unavailable: {}", e),
                    },
                }
            }
            Message::Heartbeat { member } => {
                if !self.members.touch(&member).await {
                    admit(&self.members, &self.events, member).await;
                }
                Message::HeartbeatAck { member: local }
            }
            Message::Execute { from, command } => {
                if !self.members.touch(&from).await {
                    tracing::debug!("{} from unknown member {}", command.type_name(), from);
                }
                let outcome = match command.execute(self.context.as_ref()).await {
                    Ok(result) => CommandOutcome::Completed(result),
                    Err(e) => {
                        tracing::warn!("{} from {} failed: {}", command.type_name(), from, e);
                        CommandOutcome::Failed(e.to_string())
                    }
                };
                Message::ExecuteResult { outcome }
            }
            Message::Leave { member } => {
                if self.members.remove(&member).await {
                    tracing::info!("Member {} left", member);
                    let _ = self.events.send(MembershipEvent::Removed(member));
                }
                Message::LeaveAck
            }
            other => {
                tracing::warn!("Unexpected {} from {}", other.type_name(), peer_addr);
                Message::Error {
                    message: format!("Unexpected {}", other.type_name()),
                }
            }
        };

        Some(response)
    }
}

/// Sends heartbeats and expires silent members
async fn heartbeat_loop(
    members: Arc<MemberTable>,
    client: Arc<NetworkClient>,
    events: mpsc::UnboundedSender<MembershipEvent>,
    interval: Duration,
    member_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;

        let local = members.local().clone();
        let peers = members.peers().await;
        let acks = join_all(peers.iter().map(|peer| {
            client.send(&peer.address, Message::Heartbeat { member: local.clone() })
        }))
        .await;

        for (peer, ack) in peers.iter().zip(acks) {
            match ack {
                Ok(Message::HeartbeatAck { .. }) => {
                    members.touch(peer).await;
                }
                Ok(other) => {
                    tracing::debug!("Unexpected {} heartbeat reply from {}", other.type_name(), peer);
                }
                Err(e) => {
                    tracing::trace!("Heartbeat to {} failed: {}", peer, e);
                }
            }
        }

        for member in members.expire(member_timeout).await {
            tracing::warn!("Member {} timed out", member);
            let _ = events.send(MembershipEvent::Removed(member));
        }
        client.cleanup_stale(member_timeout).await;
    }
}

/// Delivers membership notifications in order, off the request path
async fn membership_loop(
    mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    listener: Arc<dyn MembershipListener>,
) {
    while let Some(event) = events.recv().await {
        match event {
            MembershipEvent::Added(member) => listener.added(&member).await,
            MembershipEvent::Removed(member) => listener.removed(&member).await,
            MembershipEvent::Rejoined { previous, current, done } => {
                listener.removed(&previous).await;
                listener.added(&current).await;
                let _ = done.send(());
            }
        }
    }
}

#[async_trait]
impl CommandDispatcher for TcpCommandDispatcher {
    fn local(&self) -> &Member {
        self.members.local()
    }

    async fn members(&self) -> Vec<Member> {
        self.members.members().await
    }

    async fn start(
        &self,
        context: Arc<dyn StateCommandContext>,
        membership: Arc<dyn MembershipListener>,
        stateful: Arc<dyn Stateful>,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Dispatch("Dispatcher already started".into()));
        }
        let events_rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Dispatch("Dispatcher cannot be restarted".into()))?;

        let handler = DispatchHandler {
            members: Arc::clone(&self.members),
            events: self.events.clone(),
            context,
            stateful: Arc::clone(&stateful),
        };
        let server = NetworkServer::new(self.config.bind_address.clone(), Arc::new(handler));
        server.start().await?;

        let mut tasks = vec![tokio::spawn(membership_loop(events_rx, membership))];

        if let Err(e) = self.join(stateful.as_ref()).await {
            server.stop();
            for task in &tasks {
                task.abort();
            }
            return Err(e);
        }

        tasks.push(tokio::spawn(heartbeat_loop(
            Arc::clone(&self.members),
            Arc::clone(&self.client),
            self.events.clone(),
            self.config.heartbeat_interval,
            self.config.member_timeout,
        )));

        tracing::info!(
            "Dispatcher for {} started with {} peers",
            self.members.local(),
            self.members.len().await
        );

        *running = Some(Running { server, tasks });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let local = self.members.local().clone();
        let peers = self.members.clear().await;
        join_all(
            peers
                .iter()
                .map(|peer| self.client.send(&peer.address, Message::Leave { member: local.clone() })),
        )
        .await;

        running.server.stop();
        for task in running.tasks {
            task.abort();
        }
        self.client.close_all().await;

        tracing::info!("Dispatcher for {} stopped", local);
        Ok(())
    }

    async fn execute_all(&self, command: &Command) -> BTreeMap<Member, CommandOutcome> {
        let peers = self.members.peers().await;
        let outcomes = join_all(peers.iter().map(|peer| self.send(peer, command))).await;
        peers.into_iter().zip(outcomes).collect()
    }

    async fn send(&self, member: &Member, command: &Command) -> CommandOutcome {
        let message = Message::Execute {
            from: self.members.local().clone(),
            command: command.clone(),
        };

        match self.client.send(&member.address, message).await {
            Ok(Message::ExecuteResult { outcome }) => {
                self.members.touch(member).await;
                outcome
            }
            Ok(Message::Error { message }) => CommandOutcome::Failed(message),
            Ok(other) => CommandOutcome::Failed(format!("Unexpected {}", other.type_name())),
            Err(e) => {
                self.evict(member, &e.to_string()).await;
                CommandOutcome::Unreachable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn config(bind_address: &str, peers: &[&str]) -> TcpDispatcherConfig {
        TcpDispatcherConfig {
            bind_address: bind_address.to_string(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
            heartbeat_interval: Duration::from_millis(50),
            member_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_join_transfers_state_and_commands_flow() {
        let addr_a = testing::free_address();
        let addr_b = testing::free_address();

        let dispatcher_a = Arc::new(TcpCommandDispatcher::new(
            Member::new("node-a", &addr_a),
            config(&addr_a, &[&addr_b]),
        ));
        let (cluster_a, _) = testing::distributed_cluster(&["db1", "db2"], dispatcher_a.clone()).await;

        // Alone: nothing to broadcast to
        let db2 = cluster_a.database("db2").unwrap();
        cluster_a.deactivate(&db2, cluster_a.state_manager().as_ref()).await.unwrap();

        let dispatcher_b = Arc::new(TcpCommandDispatcher::new(
            Member::new("node-b", &addr_b),
            config(&addr_b, &[&addr_a]),
        ));
        let (cluster_b, _) = testing::distributed_cluster(&["db1", "db2"], dispatcher_b.clone()).await;

        assert!(!cluster_b.is_active("db2"));
        assert_eq!(dispatcher_a.members().await.len(), 2);
        assert_eq!(dispatcher_b.members().await.len(), 2);

        let db2 = cluster_b.database("db2").unwrap();
        assert!(cluster_b.activate(&db2, cluster_b.state_manager().as_ref()).await.unwrap());
        assert!(cluster_a.is_active("db2"));

        cluster_b.stop().await.unwrap();
        assert_eq!(dispatcher_a.members().await, vec![Member::new("node-a", &addr_a)]);

        cluster_a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restarted_member_session_is_recovered() {
        use crate::durability::{DurabilityPhase, InvocationEvent, InvocationKey, InvokerEvent};
        use crate::id::TransactionId;

        let addr_a = testing::free_address();
        let addr_b = testing::free_address();
        let member_b = Member::new("node-b", &addr_b);
        let databases = ["db1", "db2", "db3"];

        let dispatcher_a = Arc::new(TcpCommandDispatcher::new(
            Member::new("node-a", &addr_a),
            config(&addr_a, &[&addr_b]),
        ));
        let (cluster_a, context_a) = testing::distributed_cluster(&databases, dispatcher_a.clone()).await;

        let dispatcher_b = Arc::new(TcpCommandDispatcher::new(member_b.clone(), config(&addr_b, &[&addr_a])));
        let (cluster_b, _) = testing::distributed_cluster(&databases, dispatcher_b.clone()).await;

        let key = InvocationKey {
            transaction_id: TransactionId(42),
            phase: DurabilityPhase::Execute,
        };
        let sm = cluster_b.state_manager();
        sm.before_invocation(&InvocationEvent::before(key)).await.unwrap();
        for db in databases {
            sm.before_invoker(&InvokerEvent::before(key, db)).await.unwrap();
        }
        assert_eq!(context_a.remote().snapshot(&member_b).await.len(), 1);

        // b dies without a Leave and comes back before it times out
        let running = dispatcher_b.running.lock().await.take().unwrap();
        running.server.stop();
        for task in running.tasks {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let restarted = Arc::new(TcpCommandDispatcher::new(member_b.clone(), config(&addr_b, &[&addr_a])));
        let (cluster_b2, _) = testing::distributed_cluster(&databases, restarted.clone()).await;

        assert!(context_a.remote().snapshot(&member_b).await.is_empty());
        for cluster in [&cluster_a, &cluster_b2] {
            assert!(cluster.is_active("db1"));
            assert!(!cluster.is_active("db2"));
            assert!(!cluster.is_active("db3"));
        }
        assert_eq!(dispatcher_a.members().await.len(), 2);

        cluster_b2.stop().await.unwrap();
        cluster_a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_member_is_removed() {
        let addr_a = testing::free_address();
        let dispatcher = TcpCommandDispatcher::new(Member::new("node-a", &addr_a), config(&addr_a, &[]));
        let ghost = Member::new("node-x", testing::free_address());
        dispatcher.admit(ghost.clone()).await;

        let db = crate::database::Database::new("db1", "h");
        let outcomes = dispatcher
            .execute_all(&Command::Activation(crate::database::DatabaseEvent::new(&db)))
            .await;

        assert!(matches!(outcomes[&ghost], CommandOutcome::Unreachable(_)));
        assert!(!dispatcher.members.contains(&ghost).await);
    }
}
