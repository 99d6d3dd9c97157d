// ============================================================================
// Versioned Entity Store
// ============================================================================
//
// `Store` is the context object every operation runs against. It owns the
// connection pool (and through it the entity cache), the schema registry,
// the logical id allocator and the current-actor slot.
//
// Every logical record is a chain of physical rows in its type's table.
// Exactly one row per logical id carries `is_current`; a write retires that
// row and appends a new one inside one transaction, after checking under a
// locking read that nobody else appended first.
//
// ============================================================================

mod fetch;
mod integrity;
mod write;

use crate::allocator::{CounterAllocator, IdAllocator};
use crate::cache::EntityCache;
use crate::config::StoreConfig;
use crate::connection::ConnectionPool;
use crate::core::{LogicalId, Result, StoreError};
use crate::driver::Connector;
use crate::entity::Entity;
use crate::query::Query;
use crate::schema::{EntitySchema, SchemaRegistry};
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

pub struct Store {
    pool: ConnectionPool,
    registry: Arc<SchemaRegistry>,
    allocator: Arc<dyn IdAllocator>,
    actor: RwLock<Option<LogicalId>>,
    config: StoreConfig,
}

impl Store {
    /// Validate the configuration, start the pool and build the store.
    pub fn open(
        config: StoreConfig,
        registry: SchemaRegistry,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(EntityCache::new(&config.cache));
        let pool = ConnectionPool::new(config.connection.clone(), connector, cache)?;
        let allocator = Arc::new(CounterAllocator::new(config.id_counter_table.clone()));

        event!(
            Level::DEBUG,
            types = registry.types().count(),
            database = %config.connection.database,
            "store opened"
        );

        Ok(Self {
            pool,
            registry: Arc::new(registry),
            allocator,
            actor: RwLock::new(None),
            config,
        })
    }

    /// Replace the logical id allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn IdAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Drain the pool and flush the cache.
    pub fn shutdown(&self) -> Result<()> {
        self.pool.shutdown()?;
        self.cache().flush();
        event!(Level::DEBUG, "store shut down");
        Ok(())
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &EntityCache {
        self.pool.cache()
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema(&self, entity_type: &str) -> Result<Arc<EntitySchema>> {
        self.registry.get(entity_type)
    }

    /// Run `f` in a transaction bound to the calling thread.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.pool.with_transaction(f)
    }

    /// New unsaved entity with a freshly allocated logical id.
    pub fn create(&self, entity_type: &str) -> Result<Entity> {
        let schema = self.schema(entity_type)?;
        let id = self.allocator.allocate(&self.pool)?;
        event!(Level::TRACE, entity = entity_type, logical_id = %id, "logical id allocated");
        Ok(Entity::new(schema, id))
    }

    /// Start a predicate query over `entity_type`.
    pub fn query(&self, entity_type: &str) -> Query<'_> {
        Query::new(self, entity_type)
    }

    // ========================================================================
    // Actor context
    // ========================================================================

    pub fn current_actor(&self) -> Result<Option<LogicalId>> {
        Ok(*self.actor.read()?)
    }

    /// Install (or clear) the writer stamped on every insert.
    pub fn set_current_actor(&self, actor: Option<&Entity>) -> Result<()> {
        let id = match actor {
            None => None,
            Some(entity) => {
                self.check_actor(entity)?;
                entity.logical_id()
            }
        };
        *self.actor.write()? = id;
        Ok(())
    }

    fn check_actor(&self, entity: &Entity) -> Result<()> {
        let expected = self.registry.actor_type().ok_or_else(|| {
            StoreError::Configuration("no actor type registered".into())
        })?;
        if entity.entity_type() != expected {
            return Err(StoreError::Configuration(format!(
                "actor must be a {}, got {}",
                expected,
                entity.entity_type()
            )));
        }
        if !entity.is_inserted() || entity.logical_id().is_none() {
            return Err(StoreError::InvalidState(format!(
                "actor {} has never been saved",
                entity
            )));
        }
        Ok(())
    }

    /// Create the first actor, stamped as its own writer, and install it as
    /// the current actor.
    pub fn bootstrap_actor<F>(&self, init: F) -> Result<Entity>
    where
        F: FnOnce(&mut Entity) -> Result<()>,
    {
        let actor_type = self
            .registry
            .actor_type()
            .ok_or_else(|| StoreError::Configuration("no actor type registered".into()))?
            .to_string();
        let mut actor = self.create(&actor_type)?;
        init(&mut actor)?;
        let own_id = actor
            .logical_id()
            .ok_or_else(|| StoreError::InvalidState("actor has no logical id".into()))?;
        self.insert_stamped(&mut actor, false, own_id)?;
        self.set_current_actor(Some(&actor))?;
        event!(Level::DEBUG, actor = %own_id, "actor bootstrapped");
        Ok(actor)
    }
}
