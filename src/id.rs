//! Transaction Identifiers
//!
//! Every tracked invocation gets a 64-bit id that is unique across the
//! middleware nodes of a cluster and increases monotonically on each node,
//! so durability markers sort in the order operations began.
//!
//! Layout (64 bits):
//! - 1 bit: unused (sign bit, keeps ids positive in SQLite INTEGER columns)
//! - 41 bits: milliseconds since `ID_EPOCH`
//! - 10 bits: node ordinal (0-1023)
//! - 12 bits: per-millisecond sequence

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// 2025-01-01 00:00:00 UTC
const ID_EPOCH: u64 = 1_735_689_600_000;

const ORDINAL_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

const MAX_ORDINAL: u64 = (1 << ORDINAL_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

const ORDINAL_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = ORDINAL_BITS + SEQUENCE_BITS;

/// Identifier of one logical (possibly multi-replica) operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Milliseconds since the UNIX epoch at which the id was issued
    pub fn timestamp(&self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) + ID_EPOCH
    }

    /// Ordinal of the node that issued the id
    pub fn ordinal(&self) -> u16 {
        ((self.0 >> ORDINAL_SHIFT) & MAX_ORDINAL) as u16
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TransactionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Lock-free generator of transaction ids for one node
pub struct TransactionIdGenerator {
    ordinal: u64,
    /// upper bits = last timestamp, lower 12 bits = sequence
    state: AtomicU64,
}

impl TransactionIdGenerator {
    /// Create a generator; ordinals above 1023 are folded into range
    pub fn new(ordinal: u16) -> Self {
        Self {
            ordinal: ordinal as u64 & MAX_ORDINAL,
            state: AtomicU64::new(0),
        }
    }

    /// Derive a stable ordinal from a node identifier
    pub fn ordinal_for(node_id: &str) -> u16 {
        (crc32fast::hash(node_id.as_bytes()) as u64 & MAX_ORDINAL) as u16
    }

    pub fn next(&self) -> TransactionId {
        self.next_at(Self::now_millis())
    }

    /// Issue an id for wall time `now` (milliseconds since `ID_EPOCH`)
    fn next_at(&self, now: u64) -> TransactionId {
        loop {
            let old_state = self.state.load(Ordering::Relaxed);
            let last = old_state >> SEQUENCE_BITS;
            let sequence = old_state & MAX_SEQUENCE;

            // A clock that steps backwards keeps issuing from the last timestamp,
            // borrowing the next millisecond once its sequence is used up
            let (timestamp, sequence) = if now > last {
                (now, 0)
            } else if sequence < MAX_SEQUENCE {
                (last, sequence + 1)
            } else {
                (last + 1, 0)
            };

            let new_state = (timestamp << SEQUENCE_BITS) | sequence;
            if self
                .state
                .compare_exchange(old_state, new_state, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return TransactionId(
                    (timestamp << TIMESTAMP_SHIFT) | (self.ordinal << ORDINAL_SHIFT) | sequence,
                );
            }
        }
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(ID_EPOCH)
            .saturating_sub(ID_EPOCH)
    }
}
