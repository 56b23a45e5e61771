//! In-process dispatch
//!
//! Members of a `LocalGroup` live in the same process and receive commands
//! by direct call.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use async_trait::async_trait;
use futures::future::join_all;

use super::{
    Command, CommandDispatcher, CommandOutcome, Member, MembershipListener, StateCommandContext,
    Stateful,
};
use crate::error::{Error, Result};

struct Endpoint {
    member: Member,
    context: Arc<dyn StateCommandContext>,
    membership: Arc<dyn MembershipListener>,
    stateful: Arc<dyn Stateful>,
}

/// Shared registry of in-process members
#[derive(Default)]
pub struct LocalGroup {
    endpoints: RwLock<BTreeMap<Member, Arc<Endpoint>>>,
}

impl LocalGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn snapshot(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn register(&self, endpoint: Arc<Endpoint>) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.member.clone(), endpoint);
    }

    fn unregister(&self, member: &Member) -> bool {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(member)
            .is_some()
    }

    fn endpoint(&self, member: &Member) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(member)
            .cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Dispatcher for one member of a `LocalGroup`
pub struct LocalCommandDispatcher {
    local: Member,
    group: Arc<LocalGroup>,
}

impl LocalCommandDispatcher {
    pub fn new(local: Member, group: Arc<LocalGroup>) -> Self {
        Self { local, group }
    }
}

async fn execute_on(endpoint: &Endpoint, command: &Command) -> CommandOutcome {
    match command.execute(endpoint.context.as_ref()).await {
        Ok(result) => CommandOutcome::Completed(result),
        Err(e) => CommandOutcome::Failed(e.to_string()),
    }
}

#[async_trait]
impl CommandDispatcher for LocalCommandDispatcher {
    fn local(&self) -> &Member {
        &self.local
    }

    async fn members(&self) -> Vec<Member> {
        self.group.members()
    }

    async fn start(
        &self,
        context: Arc<dyn StateCommandContext>,
        membership: Arc<dyn MembershipListener>,
        stateful: Arc<dyn Stateful>,
    ) -> Result<()> {
        if self.group.endpoint(&self.local).is_some() {
            return Err(Error::Dispatch(format!("{} already joined", self.local)));
        }

        let existing = self.group.snapshot();
        if let Some(coordinator) = existing.first() {
            let state = coordinator.stateful.get_state().await?;
            stateful.set_state(&state).await?;
            tracing::info!("Received state from {} ({} bytes)", coordinator.member, state.len());
        }

        self.group.register(Arc::new(Endpoint {
            member: self.local.clone(),
            context,
            membership: Arc::clone(&membership),
            stateful,
        }));

        for endpoint in existing {
            endpoint.membership.added(&self.local).await;
            membership.added(&endpoint.member).await;
        }

        tracing::info!("{} joined local group", self.local);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.group.unregister(&self.local) {
            return Ok(());
        }

        for endpoint in self.group.snapshot() {
            endpoint.membership.removed(&self.local).await;
        }

        tracing::info!("{} left local group", self.local);
        Ok(())
    }

    async fn execute_all(&self, command: &Command) -> BTreeMap<Member, CommandOutcome> {
        let targets: Vec<Arc<Endpoint>> = self
            .group
            .snapshot()
            .into_iter()
            .filter(|e| e.member != self.local)
            .collect();

        let outcomes = join_all(targets.iter().map(|e| execute_on(e, command))).await;

        targets
            .iter()
            .map(|e| e.member.clone())
            .zip(outcomes)
            .collect()
    }

    async fn send(&self, member: &Member, command: &Command) -> CommandOutcome {
        match self.group.endpoint(member) {
            Some(endpoint) => execute_on(&endpoint, command).await,
            None => CommandOutcome::Unreachable(format!("{} is not a member", member)),
        }
    }
}
