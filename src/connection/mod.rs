pub mod config;
pub mod pool;

pub use config::ConnectionConfig;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};

use crate::core::{Result, StoreError};
use crate::driver::{Driver, Statement};
use crate::result::QueryResult;
use std::sync::Mutex;
use tracing::{Level, event};

/// Pooled database connection handle
///
/// Wraps one physical `Driver`. The `owned` flag is what the pool's scan
/// claims: `hold()` succeeds for exactly one caller until `release()`.
pub struct Connection {
    id: u64,
    driver: Mutex<Option<Box<dyn Driver>>>,
    owned: Mutex<bool>,
    state: Mutex<ConnectionState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    InTransaction,
    Closed,
}

impl Connection {
    pub(crate) fn new(id: u64, driver: Box<dyn Driver>) -> Self {
        Self {
            id,
            driver: Mutex::new(Some(driver)),
            owned: Mutex::new(false),
            state: Mutex::new(ConnectionState::Active),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Claim the connection; true only if nobody owned it.
    pub(crate) fn hold(&self) -> Result<bool> {
        let mut owned = self.owned.lock()?;
        if *owned {
            return Ok(false);
        }
        *owned = true;
        Ok(true)
    }

    pub(crate) fn release(&self) -> Result<()> {
        *self.owned.lock()? = false;
        Ok(())
    }

    pub fn is_owned(&self) -> bool {
        self.owned.lock().map(|owned| *owned).unwrap_or(true)
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.state() == ConnectionState::InTransaction
    }

    pub fn is_active(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    fn with_driver<T>(&self, f: impl FnOnce(&mut dyn Driver) -> Result<T>) -> Result<T> {
        let mut driver = self.driver.lock()?;
        match driver.as_mut() {
            Some(inner) => f(&mut **inner),
            None => Err(StoreError::Driver(format!("connection {} is closed", self.id))),
        }
    }

    /// Execute one statement on this connection.
    pub fn execute(&self, statement: &Statement) -> Result<QueryResult> {
        self.with_driver(|driver| driver.execute(statement))
    }

    pub fn last_insert_id(&self) -> Result<i64> {
        self.with_driver(|driver| driver.last_insert_id())
    }

    /// Rejected: transactions are driven by `ConnectionPool::with_transaction`.
    pub fn commit(&self) -> Result<()> {
        Err(Self::unmanaged("commit"))
    }

    /// Rejected: transactions are driven by `ConnectionPool::with_transaction`.
    pub fn rollback(&self) -> Result<()> {
        Err(Self::unmanaged("rollback"))
    }

    /// Rejected: autocommit is fixed by the transaction helper.
    pub fn autocommit(&self, _enabled: bool) -> Result<()> {
        Err(Self::unmanaged("autocommit"))
    }

    fn unmanaged(operation: &str) -> StoreError {
        StoreError::TransactionOperation(format!(
            "{} is not allowed on a connection handle, use with_transaction",
            operation
        ))
    }

    // ========================================================================
    // Transaction primitives, driven only by the pool
    // ========================================================================

    pub(crate) fn begin_transaction(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Active => {}
            ConnectionState::InTransaction => {
                return Err(StoreError::TransactionOperation(format!(
                    "connection {} already in a transaction",
                    self.id
                )));
            }
            ConnectionState::Closed => {
                return Err(StoreError::Driver(format!("connection {} is closed", self.id)));
            }
        }
        // The driver may block here until another transaction finishes; the
        // state lock stays free so pool scans are not held up.
        self.with_driver(|driver| driver.begin())?;
        *self.state.lock()? = ConnectionState::InTransaction;
        Ok(())
    }

    pub(crate) fn commit_transaction(&self) -> Result<()> {
        self.finish_transaction(true)
    }

    pub(crate) fn rollback_transaction(&self) -> Result<()> {
        self.finish_transaction(false)
    }

    fn finish_transaction(&self, commit: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        if *state != ConnectionState::InTransaction {
            return Err(StoreError::TransactionOperation(format!(
                "connection {} has no active transaction",
                self.id
            )));
        }
        let result = if commit {
            self.with_driver(|driver| driver.commit())
        } else {
            self.with_driver(|driver| driver.rollback())
        };
        // A failed COMMIT leaves the driver transaction open for the rollback.
        if result.is_ok() || !commit {
            *state = ConnectionState::Active;
        }
        result
    }

    /// Close the physical connection. Not allowed inside a transaction.
    pub(crate) fn close(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        match *state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::InTransaction => {
                return Err(StoreError::TransactionOperation(format!(
                    "connection {} cannot be closed inside a transaction",
                    self.id
                )));
            }
            ConnectionState::Active => {}
        }
        *state = ConnectionState::Closed;
        let driver = self.driver.lock()?.take();
        if let Some(mut driver) = driver {
            driver.close()?;
        }
        event!(Level::DEBUG, connection = self.id, "connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDatabase, Select};

    fn connection() -> Connection {
        let db = MemoryDatabase::new();
        db.create_table("notes").unwrap();
        Connection::new(1, Box::new(db.open()))
    }

    #[test]
    fn test_hold_is_exclusive() {
        let conn = connection();
        assert!(conn.hold().unwrap());
        assert!(!conn.hold().unwrap());
        conn.release().unwrap();
        assert!(conn.hold().unwrap());
    }

    #[test]
    fn test_direct_transaction_control_rejected() {
        let conn = connection();
        assert!(matches!(conn.commit(), Err(StoreError::TransactionOperation(_))));
        assert!(matches!(conn.rollback(), Err(StoreError::TransactionOperation(_))));
        assert!(matches!(conn.autocommit(false), Err(StoreError::TransactionOperation(_))));
    }

    #[test]
    fn test_close_rejected_inside_transaction() {
        let conn = connection();
        conn.begin_transaction().unwrap();
        assert!(matches!(conn.close(), Err(StoreError::TransactionOperation(_))));
        conn.rollback_transaction().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_active());
        assert!(conn.execute(&Statement::Select(Select::from("notes"))).is_err());
    }

    #[test]
    fn test_transaction_state() {
        let conn = connection();
        assert!(conn.commit_transaction().is_err());
        conn.begin_transaction().unwrap();
        assert!(conn.is_in_transaction());
        assert!(conn.begin_transaction().is_err());
        conn.commit_transaction().unwrap();
        assert!(!conn.is_in_transaction());
    }
}
