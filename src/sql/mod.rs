//! Replica Client Abstraction and Fan-out Proxies
//!
//! The replica client API is reduced to one call shape: an `Operation`
//! applied to a `Handle`. A `SqlProxy` stands for one logical handle that is
//! really a handle per replica.

mod proxy;
pub mod mariadb;

pub use proxy::{Reply, SqlProxy};

use std::sync::Arc;
use async_trait::async_trait;

use crate::database::Database;
use crate::dialect::DriverError;
use crate::durability::DurabilityPhase;
use crate::invocation::InvocationStrategy;

/// Value produced by a replica call
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Rows(Vec<Vec<Value>>),
    /// A replica-side resource that accepts further operations
    Handle(Arc<dyn Handle>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Stable textual form used for durability records and logging
    pub fn summary(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Text(v) => format!("{:?}", v),
            Value::Bytes(v) => format!("bytes[{}:{:08x}]", v.len(), crc32fast::hash(v)),
            Value::Rows(rows) => {
                let mut hasher = crc32fast::Hasher::new();
                for row in rows {
                    for value in row {
                        hasher.update(value.summary().as_bytes());
                        hasher.update(&[0]);
                    }
                    hasher.update(&[1]);
                }
                format!("rows[{}:{:08x}]", rows.len(), hasher.finalize())
            }
            Value::Handle(_) => "handle".to_string(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Text(v) => write!(f, "Text({:?})", v),
            Value::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Value::Rows(v) => f.debug_tuple("Rows").field(v).finish(),
            Value::Handle(_) => write!(f, "Handle(..)"),
        }
    }
}

/// Handles compare by identity; everything else by content
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Rows(a), Value::Rows(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// How an operation interacts with the replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Answer is the same on every replica (metadata, driver properties)
    DriverRead,
    /// Reads data; one replica is enough
    DatabaseRead,
    /// Changes data; must reach every active replica
    DatabaseWrite,
    /// Changes data on the replicas this handle is already bound to
    TransactionWrite,
    /// Handle housekeeping on the bound replicas (close, settings)
    Existing,
}

impl OperationClass {
    /// Whether operations of this class are bracketed with durability markers
    pub fn is_write(self) -> bool {
        matches!(self, OperationClass::DatabaseWrite | OperationClass::TransactionWrite)
    }

    /// Default strategy on a root handle
    pub fn strategy(self) -> InvocationStrategy {
        match self {
            OperationClass::DriverRead => InvocationStrategy::OnAny,
            OperationClass::DatabaseRead => InvocationStrategy::OnNext,
            OperationClass::DatabaseWrite => InvocationStrategy::OnAll,
            OperationClass::TransactionWrite | OperationClass::Existing => {
                InvocationStrategy::OnExisting
            }
        }
    }
}

/// Declared result of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Plain value; the primary replica's result is returned
    Value,
    /// Per-replica resource wrapped in a child proxy.
    /// With `update_copy`, writes on the child reach every active replica
    /// even if the child was obtained from a single one.
    Handle { update_copy: bool },
}

/// One call against a replica handle
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub args: Vec<Value>,
    pub class: OperationClass,
    pub shape: ResultShape,
    /// Durability phase recorded for write-class operations
    pub phase: DurabilityPhase,
}

impl Operation {
    pub fn new(name: impl Into<String>, class: OperationClass) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            class,
            shape: ResultShape::Value,
            phase: DurabilityPhase::Execute,
        }
    }

    pub fn read(name: impl Into<String>) -> Self {
        Self::new(name, OperationClass::DatabaseRead)
    }

    pub fn write(name: impl Into<String>) -> Self {
        Self::new(name, OperationClass::DatabaseWrite)
    }

    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn returning_handle(mut self, update_copy: bool) -> Self {
        self.shape = ResultShape::Handle { update_copy };
        self
    }

    pub fn with_phase(mut self, phase: DurabilityPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Text argument at `index`
    pub fn text_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_text)
    }

    /// Statement that changes data on every replica
    pub fn execute(sql: impl Into<String>) -> Self {
        Self::write("execute").arg(Value::Text(sql.into()))
    }

    /// Query answered by one replica
    pub fn query(sql: impl Into<String>) -> Self {
        Self::read("query").arg(Value::Text(sql.into()))
    }

    pub fn begin() -> Self {
        Self::new("begin", OperationClass::Existing)
    }

    pub fn commit() -> Self {
        Self::new("commit", OperationClass::TransactionWrite).with_phase(DurabilityPhase::Commit)
    }

    pub fn rollback() -> Self {
        Self::new("rollback", OperationClass::TransactionWrite).with_phase(DurabilityPhase::Rollback)
    }

    pub fn close() -> Self {
        Self::new("close", OperationClass::Existing)
    }
}

/// Replica-side handle (connection, statement, result, large object ...)
#[async_trait]
pub trait Handle: Send + Sync {
    async fn call(&self, operation: &Operation) -> Result<Value, DriverError>;
}

/// Opens root handles to replicas
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, database: &Database) -> Result<Arc<dyn Handle>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_classes() {
        assert_eq!(Operation::execute("DELETE FROM t").class.strategy(), InvocationStrategy::OnAll);
        assert_eq!(Operation::query("SELECT 1").class.strategy(), InvocationStrategy::OnNext);
        assert_eq!(Operation::commit().class.strategy(), InvocationStrategy::OnExisting);
        assert!(Operation::commit().class.is_write());
        assert!(!Operation::close().class.is_write());
        assert_eq!(Operation::commit().phase, DurabilityPhase::Commit);
        assert_eq!(Operation::execute("x").text_arg(0), Some("x"));
    }

    #[test]
    fn test_value_summary_is_content_based() {
        let a = Value::Rows(vec![vec![Value::Int(1), Value::Text("a".into())]]);
        let b = Value::Rows(vec![vec![Value::Int(1), Value::Text("a".into())]]);
        let c = Value::Rows(vec![vec![Value::Int(2), Value::Text("a".into())]]);
        assert_eq!(a, b);
        assert_eq!(a.summary(), b.summary());
        assert_ne!(a.summary(), c.summary());
        assert_eq!(Value::Int(3).summary(), "3");
    }
}
