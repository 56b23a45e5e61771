//! Durability Markers

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::dialect::DriverError;
use crate::id::TransactionId;
use crate::invocation::Outcome;

/// Phase of the logical operation being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DurabilityPhase {
    Execute,
    Prepare,
    Commit,
    Rollback,
    Forget,
}

impl DurabilityPhase {
    pub fn as_i64(self) -> i64 {
        match self {
            DurabilityPhase::Execute => 0,
            DurabilityPhase::Prepare => 1,
            DurabilityPhase::Commit => 2,
            DurabilityPhase::Rollback => 3,
            DurabilityPhase::Forget => 4,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(DurabilityPhase::Execute),
            1 => Some(DurabilityPhase::Prepare),
            2 => Some(DurabilityPhase::Commit),
            3 => Some(DurabilityPhase::Rollback),
            4 => Some(DurabilityPhase::Forget),
            _ => None,
        }
    }
}

/// Which side of the operation a marker records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Marker {
    Before,
    After,
}

/// Key of a tracked invocation: BEFORE and AFTER markers share it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvocationKey {
    pub transaction_id: TransactionId,
    pub phase: DurabilityPhase,
}

impl std::fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{:?}", self.transaction_id, self.phase)
    }
}

/// Marker for one logical operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub transaction_id: TransactionId,
    pub phase: DurabilityPhase,
    pub marker: Marker,
}

impl InvocationEvent {
    pub fn before(key: InvocationKey) -> Self {
        Self {
            transaction_id: key.transaction_id,
            phase: key.phase,
            marker: Marker::Before,
        }
    }

    pub fn after(key: InvocationKey) -> Self {
        Self {
            transaction_id: key.transaction_id,
            phase: key.phase,
            marker: Marker::After,
        }
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey {
            transaction_id: self.transaction_id,
            phase: self.phase,
        }
    }
}

/// Recorded outcome of one replica call
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InvokerResult {
    /// Summary of the value returned
    Value(String),
    /// Error raised by the replica
    Exception {
        code: Option<i32>,
        sql_state: Option<String>,
        message: String,
    },
}

impl InvokerResult {
    pub fn from_outcome(outcome: &Outcome) -> Self {
        match outcome {
            Ok(value) => InvokerResult::Value(value.summary()),
            Err(DriverError {
                code,
                sql_state,
                message,
                ..
            }) => InvokerResult::Exception {
                code: *code,
                sql_state: sql_state.clone(),
                message: message.clone(),
            },
        }
    }
}

/// Marker for one replica's part of a logical operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerEvent {
    pub transaction_id: TransactionId,
    pub phase: DurabilityPhase,
    pub database: String,
    pub marker: Marker,
    /// Present on AFTER markers
    pub result: Option<InvokerResult>,
}

impl InvokerEvent {
    pub fn before(key: InvocationKey, database: &str) -> Self {
        Self {
            transaction_id: key.transaction_id,
            phase: key.phase,
            database: database.to_string(),
            marker: Marker::Before,
            result: None,
        }
    }

    pub fn after(key: InvocationKey, database: &str, result: InvokerResult) -> Self {
        Self {
            transaction_id: key.transaction_id,
            phase: key.phase,
            database: database.to_string(),
            marker: Marker::After,
            result: Some(result),
        }
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey {
            transaction_id: self.transaction_id,
            phase: self.phase,
        }
    }
}

/// Invoker markers of one invocation, by database id
pub type InvokerMap = BTreeMap<String, InvokerEvent>;

/// Incomplete invocations and their invoker markers
pub type InvocationMap = BTreeMap<InvocationKey, InvokerMap>;
