use super::{Connection, config::ConnectionConfig};
use crate::cache::EntityCache;
use crate::core::{Result, StoreError};
use crate::driver::Connector;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{Level, event};

/// Connection pool and thread-bound transaction binder
///
/// Hands out exclusively-owned connections. A thread inside
/// `with_transaction` is bound to one connection: every `acquire` on that
/// thread returns it, and releasing it is a no-op until the outermost
/// transaction finishes.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    connections: Mutex<Vec<Arc<Connection>>>,
    /// Connection bound to each thread with an open transaction.
    bindings: Mutex<HashMap<ThreadId, Arc<Connection>>>,
    cache: Arc<EntityCache>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        cache: Arc<EntityCache>,
    ) -> Result<Self> {
        config.validate().map_err(StoreError::Configuration)?;

        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                connections: Mutex::new(Vec::new()),
                bindings: Mutex::new(HashMap::new()),
                cache,
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        };

        // Pre-create minimum connections
        pool.ensure_min_connections()?;

        Ok(pool)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.inner.cache
    }

    /// Get a connection: the one bound to this thread's transaction, or an
    /// idle one, or a new one while under `max_connections`. Waits up to
    /// `connect_timeout` otherwise.
    pub fn acquire(&self) -> Result<PooledConnection> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::PoolExhausted("pool is shut down".into()));
        }

        if let Some(bound) = self.inner.bound_connection()? {
            return Ok(PooledConnection {
                connection: bound,
                pool: Arc::clone(&self.inner),
            });
        }

        let start = Instant::now();
        loop {
            if let Some(connection) = self.try_claim()? {
                return Ok(PooledConnection {
                    connection,
                    pool: Arc::clone(&self.inner),
                });
            }

            if start.elapsed() > self.inner.config.connect_timeout {
                event!(
                    Level::WARN,
                    max_connections = self.inner.config.max_connections,
                    "connection pool timeout"
                );
                return Err(StoreError::PoolExhausted(format!(
                    "no connection available within {:?}",
                    self.inner.config.connect_timeout
                )));
            }

            // Wait a bit before retrying
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Scan for an idle connection, or open a new one if under the limit.
    fn try_claim(&self) -> Result<Option<Arc<Connection>>> {
        let mut connections = self.inner.connections.lock()?;
        connections.retain(|c| c.is_active());

        for connection in connections.iter() {
            if connection.hold()? {
                event!(Level::TRACE, connection = connection.id(), "connection claimed");
                return Ok(Some(Arc::clone(connection)));
            }
        }

        if connections.len() >= self.inner.config.max_connections {
            return Ok(None);
        }

        let connection = self.inner.open_connection()?;
        connection.hold()?;
        connections.push(Arc::clone(&connection));
        Ok(Some(connection))
    }

    fn ensure_min_connections(&self) -> Result<()> {
        let mut connections = self.inner.connections.lock()?;
        while connections.len() < self.inner.config.min_connections {
            connections.push(self.inner.open_connection()?);
        }
        Ok(())
    }

    /// Run `f` inside a transaction bound to the calling thread.
    ///
    /// Nested calls on the same thread join the outer transaction; only the
    /// outermost call commits. Any error (or panic) inside the outermost
    /// call rolls back and flushes the entity cache before propagating.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if self.in_transaction()? {
            event!(Level::TRACE, "nested transaction joins bound connection");
            return f();
        }

        let handle = self.acquire()?;
        handle.connection.begin_transaction()?;
        let mut scope = TransactionScope {
            pool: self.inner.as_ref(),
            thread: thread::current().id(),
            connection: Arc::clone(&handle.connection),
            open: true,
        };
        self.inner
            .bindings
            .lock()?
            .insert(scope.thread, Arc::clone(&handle.connection));
        event!(Level::DEBUG, connection = handle.id(), "transaction begun");

        let outcome = match f() {
            Ok(value) => scope.commit().map(|_| value),
            Err(err) => {
                scope.rollback(&err);
                Err(err)
            }
        };
        drop(scope);
        drop(handle);
        outcome
    }

    /// Whether the calling thread is inside `with_transaction`.
    pub fn in_transaction(&self) -> Result<bool> {
        Ok(self.inner.bound_connection()?.is_some())
    }

    /// Close a connection and drop it from the pool. Rejected while it
    /// carries the calling thread's transaction.
    pub fn close(&self, handle: PooledConnection) -> Result<()> {
        if handle.connection.is_in_transaction() {
            return Err(StoreError::TransactionOperation(
                "cannot close a connection inside a transaction".into(),
            ));
        }
        handle.connection.close()?;
        self.inner
            .connections
            .lock()?
            .retain(|c| !Arc::ptr_eq(c, &handle.connection));
        Ok(())
    }

    pub fn stats(&self) -> Result<PoolStats> {
        let connections = self.inner.connections.lock()?;
        let total = connections.len();
        let idle = connections.iter().filter(|c| !c.is_owned()).count();
        let transactions = self.inner.bindings.lock()?.len();

        Ok(PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            open_transactions: transactions,
            max_connections: self.inner.config.max_connections,
        })
    }

    /// Close every idle connection and refuse new acquisitions. Connections
    /// still in use are closed when they are released.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let mut connections = self.inner.connections.lock()?;
        for connection in connections.iter() {
            if connection.hold()? {
                connection.close()?;
            }
        }
        connections.retain(|c| c.is_active());
        event!(Level::DEBUG, remaining = connections.len(), "connection pool shut down");
        Ok(())
    }
}

impl PoolInner {
    fn open_connection(&self) -> Result<Arc<Connection>> {
        let driver = self.connector.connect(&self.config)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event!(Level::DEBUG, connection = id, database = %self.config.database, "connection opened");
        Ok(Arc::new(Connection::new(id, driver)))
    }

    fn bound_connection(&self) -> Result<Option<Arc<Connection>>> {
        Ok(self.bindings.lock()?.get(&thread::current().id()).cloned())
    }

    /// Return a connection unless the calling thread is inside a transaction.
    fn release(&self, connection: &Arc<Connection>) -> Result<()> {
        if self.bound_connection()?.is_some() {
            return Ok(());
        }
        if self.shut_down.load(Ordering::SeqCst) {
            connection.close()?;
            self.connections
                .lock()?
                .retain(|c| !Arc::ptr_eq(c, connection));
        }
        connection.release()
    }
}

/// Finishes the outermost transaction exactly once, including on panic.
struct TransactionScope<'a> {
    pool: &'a PoolInner,
    thread: ThreadId,
    connection: Arc<Connection>,
    open: bool,
}

impl TransactionScope<'_> {
    fn commit(&mut self) -> Result<()> {
        self.open = false;
        match self.connection.commit_transaction() {
            Ok(()) => {
                event!(Level::DEBUG, connection = self.connection.id(), "transaction committed");
                Ok(())
            }
            Err(err) => {
                self.rollback(&err);
                Err(err)
            }
        }
    }

    fn rollback(&mut self, cause: &StoreError) {
        self.open = false;
        event!(
            Level::DEBUG,
            connection = self.connection.id(),
            error = %cause,
            "transaction rolled back"
        );
        if let Err(err) = self.connection.rollback_transaction() {
            event!(Level::WARN, connection = self.connection.id(), error = %err, "rollback failed");
        }
        self.pool.cache.flush();
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if self.open {
            self.rollback(&StoreError::TransactionOperation(
                "transaction body panicked".into(),
            ));
        }
        if let Ok(mut bindings) = self.pool.bindings.lock() {
            bindings.remove(&self.thread);
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub open_transactions: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} idle, {} in transaction, max {}",
            self.active_connections,
            self.total_connections,
            self.idle_connections,
            self.open_transactions,
            self.max_connections
        )
    }
}

/// RAII guard for pooled connections
///
/// Returns the connection to the pool when dropped (a no-op while the
/// thread's transaction is open).
pub struct PooledConnection {
    connection: Arc<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Explicitly return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Err(err) = self.pool.release(&self.connection) {
            event!(Level::WARN, connection = self.connection.id(), error = %err, "connection release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::driver::{MemoryDatabase, Statement};
    use crate::core::Value;

    fn pool(config: ConnectionConfig) -> (ConnectionPool, MemoryDatabase) {
        let db = MemoryDatabase::new();
        db.create_table("notes").unwrap();
        let cache = Arc::new(EntityCache::new(&CacheConfig::default()));
        let pool = ConnectionPool::new(config, Arc::new(db.clone()), cache).unwrap();
        (pool, db)
    }

    fn insert_note(conn: &Connection) {
        conn.execute(&Statement::Insert {
            table: "notes".into(),
            values: vec![("title".into(), Value::Text("n".into()))],
        })
        .unwrap();
    }

    #[test]
    fn test_pool_creation() {
        let (pool, _) = pool(ConnectionConfig::default().min_connections(2).max_connections(5));
        let stats = pool.stats().unwrap();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.idle_connections, 2);
    }

    #[test]
    fn test_connection_return_to_pool() {
        let (pool, _) = pool(ConnectionConfig::default().max_connections(5));
        {
            let _conn = pool.acquire().unwrap();
            let stats = pool.stats().unwrap();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.idle_connections, 0);
        }
        let stats = pool.stats().unwrap();
        assert_eq!(stats.idle_connections, 1);

        // The idle connection is reused.
        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), 1);
    }

    #[test]
    fn test_max_connections_limit() {
        let (pool, _) = pool(
            ConnectionConfig::default()
                .max_connections(2)
                .connect_timeout(Duration::from_millis(50)),
        );
        let _conn1 = pool.acquire().unwrap();
        let _conn2 = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(StoreError::PoolExhausted(_))));
    }

    #[test]
    fn test_transaction_binds_one_connection() {
        let (pool, db) = pool(ConnectionConfig::default().max_connections(3));
        pool.with_transaction(|| {
            let first = pool.acquire()?;
            let first_id = first.id();
            insert_note(&first);
            first.release();

            let second = pool.acquire()?;
            assert_eq!(second.id(), first_id);
            assert!(pool.in_transaction()?);
            assert_eq!(pool.stats()?.open_transactions, 1);
            Ok(())
        })
        .unwrap();

        assert!(!pool.in_transaction().unwrap());
        assert_eq!(db.rows("notes").unwrap().len(), 1);
        assert_eq!(pool.stats().unwrap().idle_connections, 1);
    }

    #[test]
    fn test_error_rolls_back_and_unbinds() {
        let (pool, db) = pool(ConnectionConfig::default());
        let result: Result<()> = pool.with_transaction(|| {
            insert_note(&*pool.acquire()?);
            Err(StoreError::InvalidArgument("abort".into()))
        });
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert!(db.rows("notes").unwrap().is_empty());
        assert!(!pool.in_transaction().unwrap());
        assert_eq!(pool.stats().unwrap().active_connections, 0);
    }

    #[test]
    fn test_nested_transaction_commits_once() {
        let (pool, db) = pool(ConnectionConfig::default());
        let result: Result<()> = pool.with_transaction(|| {
            pool.with_transaction(|| {
                insert_note(&*pool.acquire()?);
                Ok(())
            })?;
            // Still inside the outer transaction.
            assert!(pool.in_transaction()?);
            Err(StoreError::InvalidArgument("outer fails".into()))
        });
        assert!(result.is_err());
        assert!(db.rows("notes").unwrap().is_empty());
    }

    #[test]
    fn test_panic_rolls_back() {
        let (pool, db) = pool(ConnectionConfig::default());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = pool.with_transaction(|| {
                insert_note(&*pool.acquire()?);
                panic!("boom");
            });
        }));
        assert!(outcome.is_err());
        assert!(db.rows("notes").unwrap().is_empty());
        assert!(!pool.in_transaction().unwrap());
    }

    #[test]
    fn test_close_rejected_inside_transaction() {
        let (pool, _) = pool(ConnectionConfig::default());
        pool.with_transaction(|| {
            let handle = pool.acquire()?;
            assert!(matches!(
                pool.close(handle),
                Err(StoreError::TransactionOperation(_))
            ));
            Ok(())
        })
        .unwrap();

        let handle = pool.acquire().unwrap();
        pool.close(handle).unwrap();
        assert_eq!(pool.stats().unwrap().total_connections, 0);
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let (pool, _) = pool(ConnectionConfig::default().min_connections(2));
        pool.shutdown().unwrap();
        assert_eq!(pool.stats().unwrap().total_connections, 0);
        assert!(matches!(pool.acquire(), Err(StoreError::PoolExhausted(_))));
    }

    #[test]
    fn test_other_threads_get_other_connections() {
        let (pool, _) = pool(ConnectionConfig::default().max_connections(4));
        pool.with_transaction(|| {
            let mine = pool.acquire()?.id();
            let pool2 = pool.clone();
            let theirs = thread::spawn(move || pool2.acquire().map(|c| c.id()))
                .join()
                .unwrap()?;
            assert_ne!(mine, theirs);
            Ok(())
        })
        .unwrap();
    }
}
