use crate::connection::ConnectionPool;
use crate::core::{LogicalId, Result, StoreError};
use crate::driver::Statement;

/// Source of fresh logical ids for newly constructed entities.
pub trait IdAllocator: Send + Sync {
    fn allocate(&self, pool: &ConnectionPool) -> Result<LogicalId>;
}

/// Allocates from a single-row counter table
/// (`UPDATE oids SET id = LAST_INSERT_ID(id + 1)`).
#[derive(Debug, Clone)]
pub struct CounterAllocator {
    table: String,
}

impl CounterAllocator {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl IdAllocator for CounterAllocator {
    fn allocate(&self, pool: &ConnectionPool) -> Result<LogicalId> {
        let conn = pool.acquire()?;
        conn.execute(&Statement::AllocateId {
            table: self.table.clone(),
        })?;
        let id = conn.last_insert_id()?;
        if id <= 0 {
            return Err(StoreError::Driver(format!(
                "counter '{}' returned invalid id {}",
                self.table, id
            )));
        }
        Ok(LogicalId(id))
    }
}
