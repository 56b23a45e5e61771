//! In-memory state manager

use std::collections::BTreeSet;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::StateManager;
use crate::database::DatabaseEvent;
use crate::durability::{InvocationEvent, InvocationMap, InvokerEvent};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    active: BTreeSet<String>,
    invocations: InvocationMap,
}

/// State manager that keeps everything in process memory
#[derive(Default)]
pub struct MemoryStateManager {
    inner: RwLock<Inner>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn active_databases(&self) -> Result<BTreeSet<String>> {
        Ok(self.inner.read().await.active.clone())
    }

    async fn set_active_databases(&self, databases: &BTreeSet<String>) -> Result<()> {
        self.inner.write().await.active = databases.clone();
        Ok(())
    }

    async fn activated(&self, event: &DatabaseEvent) -> Result<()> {
        self.inner.write().await.active.insert(event.database.clone());
        Ok(())
    }

    async fn deactivated(&self, event: &DatabaseEvent) -> Result<()> {
        self.inner.write().await.active.remove(&event.database);
        Ok(())
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.inner.write().await.invocations.entry(event.key()).or_default();
        Ok(())
    }

    async fn after_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.inner.write().await.invocations.remove(&event.key());
        Ok(())
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .invocations
            .entry(event.key())
            .or_default()
            .entry(event.database.clone())
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn after_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .invocations
            .entry(event.key())
            .or_default()
            .insert(event.database.clone(), event.clone());
        Ok(())
    }

    async fn recover(&self) -> Result<InvocationMap> {
        Ok(self.inner.read().await.invocations.clone())
    }
}
