//! Member Table
//!
//! Tracks the peers a dispatcher knows about and when each was last heard
//! from.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::Member;

/// State of a single peer
#[derive(Debug, Clone)]
pub struct MemberState {
    pub member: Member,
    /// When the peer joined
    pub joined_at: chrono::DateTime<chrono::Utc>,
    /// Last message received from the peer
    pub last_seen: Instant,
}

impl MemberState {
    fn new(member: Member) -> Self {
        Self {
            member,
            joined_at: chrono::Utc::now(),
            last_seen: Instant::now(),
        }
    }

    /// Check if the peer was heard from within `timeout`
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

/// Peers of the local member, keyed by member id
pub struct MemberTable {
    local: Member,
    peers: RwLock<HashMap<String, MemberState>>,
}

impl MemberTable {
    pub fn new(local: Member) -> Self {
        Self {
            local,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &Member {
        &self.local
    }

    /// Add a peer. Returns true if it was not known before.
    ///
    /// A known id with a new address is updated in place.
    pub async fn insert(&self, member: Member) -> bool {
        if member.id == self.local.id {
            return false;
        }

        let mut peers = self.peers.write().await;
        match peers.get_mut(&member.id) {
            Some(state) => {
                state.member = member;
                state.last_seen = Instant::now();
                false
            }
            None => {
                peers.insert(member.id.clone(), MemberState::new(member));
                true
            }
        }
    }

    /// Record that a peer was heard from. Returns false if it is unknown.
    pub async fn touch(&self, member: &Member) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&member.id) {
            Some(state) => {
                state.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a peer. Returns true if it was known.
    pub async fn remove(&self, member: &Member) -> bool {
        self.peers.write().await.remove(&member.id).is_some()
    }

    pub async fn contains(&self, member: &Member) -> bool {
        self.peers.read().await.contains_key(&member.id)
    }

    /// Known peers, local member excluded, in id order
    pub async fn peers(&self) -> Vec<Member> {
        let peers = self.peers.read().await;
        let mut members: Vec<Member> = peers.values().map(|s| s.member.clone()).collect();
        members.sort();
        members
    }

    /// Known peers plus the local member, in id order
    pub async fn members(&self) -> Vec<Member> {
        let mut members = self.peers().await;
        members.push(self.local.clone());
        members.sort();
        members
    }

    pub async fn get(&self, member_id: &str) -> Option<MemberState> {
        self.peers.read().await.get(member_id).cloned()
    }

    /// Remove and return peers not heard from within `timeout`
    pub async fn expire(&self, timeout: Duration) -> Vec<Member> {
        let mut peers = self.peers.write().await;
        let expired: Vec<String> = peers
            .iter()
            .filter(|(_, state)| !state.is_healthy(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| peers.remove(&id).map(|state| state.member))
            .collect()
    }

    /// Drop every peer
    pub async fn clear(&self) -> Vec<Member> {
        let mut peers = self.peers.write().await;
        peers.drain().map(|(_, state)| state.member).collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }
}
