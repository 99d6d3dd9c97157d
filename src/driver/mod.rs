pub mod clock;
pub mod memory;
pub mod statement;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryDatabase;
pub use statement::{Condition, OrderBy, Projection, Select, Statement};

use crate::connection::config::ConnectionConfig;
use crate::core::Result;
use crate::result::QueryResult;

/// One physical database connection.
///
/// Implement this over a real client (MySQL or anything that speaks
/// `Statement::to_sql()`), or use `MemoryDatabase` for tests and embedded use.
/// Calls block until the round trip completes.
pub trait Driver: Send {
    /// Execute one statement and return its rows or affected count.
    fn execute(&mut self, statement: &Statement) -> Result<QueryResult>;

    /// Id produced by the most recent `Insert` or `AllocateId` on this connection.
    fn last_insert_id(&self) -> Result<i64>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Opens physical connections for the pool.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Driver>>;
}
