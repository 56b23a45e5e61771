//! Replica Balancers
//!
//! A balancer owns the set of active replicas and picks the replica that
//! single-target reads go to. Activation and deactivation are nothing more
//! than `add`/`remove` on the balancer, so every strategy observes the same
//! active set.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::database::Database;

/// Outcome of a guarded removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Replica was active and has been removed
    Removed,
    /// Replica was not active
    Absent,
    /// Replica is the only active one and was kept
    LastActive,
}

/// Selection policy over the active replicas
pub trait Balancer: Send + Sync {
    /// Replica the next single-target call should use
    fn next(&self) -> Option<Arc<Database>>;

    /// Mark a replica active. Returns false if it already was.
    fn add(&self, database: Arc<Database>) -> bool;

    /// Mark a replica inactive. Returns false if it already was.
    fn remove(&self, database: &Database) -> bool;

    /// Remove a replica unless that would leave no active replica.
    /// The check and the removal happen under one lock.
    fn remove_unless_last(&self, database: &Database) -> Removal;

    fn contains(&self, database: &Database) -> bool;

    fn size(&self) -> usize;

    /// Active replicas in id order
    fn databases(&self) -> Vec<Arc<Database>>;

    /// First active replica by id
    fn primary(&self) -> Option<Arc<Database>> {
        self.databases().into_iter().next()
    }

    fn clear(&self);

    /// Called before a single-target call is sent to `database`
    fn before_invocation(&self, _database: &Database) {}

    /// Called after a single-target call to `database` completes
    fn after_invocation(&self, _database: &Database) {}
}

/// Balancer selection in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Highest weight wins
    Simple,
    /// Weighted random
    Random,
    /// Rotate through active replicas
    #[default]
    RoundRobin,
    /// Fewest in-flight calls relative to weight
    Load,
}

impl BalancerKind {
    pub fn create(self) -> Box<dyn Balancer> {
        match self {
            BalancerKind::Simple => Box::new(SimpleBalancer::default()),
            BalancerKind::Random => Box::new(RandomBalancer::default()),
            BalancerKind::RoundRobin => Box::new(RoundRobinBalancer::default()),
            BalancerKind::Load => Box::new(LoadBalancer::default()),
        }
    }
}

/// Active replica set shared by all balancer implementations
#[derive(Default)]
struct ActiveSet {
    databases: RwLock<BTreeSet<Arc<Database>>>,
}

impl ActiveSet {
    fn add(&self, database: Arc<Database>) -> bool {
        self.databases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(database)
    }

    fn remove(&self, database: &Database) -> bool {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let found = databases.iter().find(|d| d.id == database.id).cloned();
        match found {
            Some(d) => databases.remove(&d),
            None => false,
        }
    }

    fn remove_unless_last(&self, database: &Database) -> Removal {
        let mut databases = self.databases.write().unwrap_or_else(PoisonError::into_inner);
        let found = databases.iter().find(|d| d.id == database.id).cloned();
        match found {
            None => Removal::Absent,
            Some(_) if databases.len() <= 1 => Removal::LastActive,
            Some(d) => {
                databases.remove(&d);
                Removal::Removed
            }
        }
    }

    fn contains(&self, database: &Database) -> bool {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|d| d.id == database.id)
    }

    fn size(&self) -> usize {
        self.databases.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn snapshot(&self) -> Vec<Arc<Database>> {
        self.databases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn clear(&self) {
        self.databases.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

macro_rules! delegate_active_set {
    () => {
        fn add(&self, database: Arc<Database>) -> bool {
            self.active.add(database)
        }

        fn remove(&self, database: &Database) -> bool {
            self.active.remove(database)
        }

        fn remove_unless_last(&self, database: &Database) -> Removal {
            self.active.remove_unless_last(database)
        }

        fn contains(&self, database: &Database) -> bool {
            self.active.contains(database)
        }

        fn size(&self) -> usize {
            self.active.size()
        }

        fn databases(&self) -> Vec<Arc<Database>> {
            self.active.snapshot()
        }

        fn clear(&self) {
            self.active.clear()
        }
    };
}

/// Always picks the highest-weight replica (lowest id on ties)
#[derive(Default)]
pub struct SimpleBalancer {
    active: ActiveSet,
}

impl Balancer for SimpleBalancer {
    fn next(&self) -> Option<Arc<Database>> {
        // Iteration is in id order, so the first maximum is the lowest id
        self.active
            .snapshot()
            .into_iter()
            .fold(None, |best: Option<Arc<Database>>, db| match best {
                Some(b) if b.weight >= db.weight => Some(b),
                _ => Some(db),
            })
    }

    delegate_active_set!();
}

/// Weighted random choice
#[derive(Default)]
pub struct RandomBalancer {
    active: ActiveSet,
}

impl Balancer for RandomBalancer {
    fn next(&self) -> Option<Arc<Database>> {
        let databases = self.active.snapshot();
        let total: u64 = databases.iter().map(|d| d.weight as u64).sum();
        if total == 0 {
            return databases.into_iter().next();
        }

        let mut pick = rand::thread_rng().gen_range(0..total);
        for db in databases {
            let weight = db.weight as u64;
            if pick < weight {
                return Some(db);
            }
            pick -= weight;
        }
        None
    }

    delegate_active_set!();
}

/// Round-robin across active replicas with non-zero weight
#[derive(Default)]
pub struct RoundRobinBalancer {
    active: ActiveSet,
    counter: AtomicUsize,
}

impl Balancer for RoundRobinBalancer {
    fn next(&self) -> Option<Arc<Database>> {
        let databases = self.active.snapshot();
        let weighted: Vec<Arc<Database>> = databases
            .iter()
            .filter(|d| d.weight > 0)
            .cloned()
            .collect();
        let candidates = if weighted.is_empty() { databases } else { weighted };

        if candidates.is_empty() {
            return None;
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(idx).cloned()
    }

    delegate_active_set!();
}

/// Picks the replica with the fewest in-flight calls per unit of weight
#[derive(Default)]
pub struct LoadBalancer {
    active: ActiveSet,
    loads: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    /// Current in-flight call count for a replica
    pub fn load(&self, database: &Database) -> usize {
        self.loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&database.id)
            .copied()
            .unwrap_or(0)
    }
}

impl Balancer for LoadBalancer {
    fn next(&self) -> Option<Arc<Database>> {
        let databases = self.active.snapshot();
        let loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<(Arc<Database>, f64)> = None;
        for db in databases {
            if db.weight == 0 {
                continue;
            }
            let load = loads.get(&db.id).copied().unwrap_or(0) as f64;
            let score = (load + 1.0) / db.weight as f64;
            let better = best.as_ref().map_or(true, |(_, best_score)| score < *best_score);
            if better {
                best = Some((db, score));
            }
        }

        drop(loads);
        best.map(|(db, _)| db).or_else(|| self.active.snapshot().into_iter().next())
    }

    fn before_invocation(&self, database: &Database) {
        let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        *loads.entry(database.id.clone()).or_insert(0) += 1;
    }

    fn after_invocation(&self, database: &Database) {
        let mut loads = self.loads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(load) = loads.get_mut(&database.id) {
            *load = load.saturating_sub(1);
        }
    }

    delegate_active_set!();
}
