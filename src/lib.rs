// ============================================================================
// Rowchain Library
// ============================================================================
//
// Append-only versioned object store over relational tables. Every logical
// record is a chain of immutable rows; writes append a new version under an
// optimistic check, deletes append a tombstone, and any past state can be
// read back as of a point in time.
//
// ============================================================================

//! # Example
//!
//! ```
//! use rowchain::{EntitySchema, FieldDef, MemoryDatabase, SchemaRegistry, Store, StoreConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = MemoryDatabase::new();
//! db.create_table("members")?;
//! db.create_table("notes")?;
//! db.create_counter("oids", 0)?;
//!
//! let registry = SchemaRegistry::builder()
//!     .register(
//!         EntitySchema::builder("Member", "members")
//!             .field(FieldDef::text_max("name", 40))
//!             .build()?,
//!     )
//!     .register(
//!         EntitySchema::builder("Note", "notes")
//!             .field(FieldDef::text_max("body", 200))
//!             .build()?,
//!     )
//!     .actor_type("Member")
//!     .build()?;
//!
//! let store = Store::open(StoreConfig::default(), registry, Arc::new(db))?;
//! store.bootstrap_actor(|member| member.set_text("name", "admin"))?;
//!
//! let mut note = store.create("Note")?;
//! note.set_text("body", "first draft")?;
//! store.save(&mut note)?;
//!
//! note.set_text("body", "second draft")?;
//! store.save(&mut note)?;
//!
//! let id = note.logical_id().ok_or("unsaved")?;
//! assert_eq!(store.history("Note", id)?.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod cache;
pub mod config;
pub mod connection;
pub mod core;
pub mod driver;
pub mod entity;
pub mod query;
pub mod result;
pub mod schema;
pub mod store;

pub use allocator::{CounterAllocator, IdAllocator};
pub use cache::EntityCache;
pub use config::{CacheConfig, StoreConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionPool, PoolStats, PooledConnection};
pub use crate::core::{LogicalId, PhysicalId, Result, StoreError, Value};
pub use driver::{Clock, Connector, Driver, ManualClock, MemoryDatabase, SystemClock};
pub use entity::{Entity, FieldValue, GetOptions, InsertOptions, RowMeta};
pub use query::{Pick, Predicate, Query};
pub use result::QueryResult;
pub use schema::{EntitySchema, FieldDef, FieldKind, SchemaRegistry, TextRule};
pub use store::Store;
