use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable identity of a logical record, stable across all of its versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalId(pub i64);

impl LogicalId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LogicalId {
    fn from(id: i64) -> Self {
        LogicalId(id)
    }
}

/// Identity of one stored row (one version). Monotonic in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalId(pub i64);

impl PhysicalId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
