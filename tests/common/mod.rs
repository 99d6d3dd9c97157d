//! Shared fixture for integration tests
//!
//! Three entity types over one in-memory database:
//! - `Member` (the actor type) with a maintained `projects` back-reference
//!   and a manual `starred` list
//! - `Project` with `members` and `tickets` lists
//! - `Ticket` with a `project` reference, tags, a path and a strict reviewer
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rowchain::{
    Connector, Entity, EntitySchema, FieldDef, ManualClock, MemoryDatabase, SchemaRegistry,
    Store, StoreConfig,
};
use std::sync::Arc;

pub struct Fixture {
    pub db: MemoryDatabase,
    pub clock: Arc<ManualClock>,
    pub store: Store,
    pub admin: Entity,
}

impl Fixture {
    /// Move the clock forward one minute and return the new time.
    pub fn tick(&self) -> DateTime<Utc> {
        self.clock.advance(Duration::minutes(1))
    }

    pub fn member(&self, name: &str) -> Entity {
        let mut member = self.store.create("Member").unwrap();
        member.set_text("name", name).unwrap();
        self.store.save(&mut member).unwrap();
        member
    }

    pub fn project(&self, name: &str) -> Entity {
        let mut project = self.store.create("Project").unwrap();
        project.set_text("name", name).unwrap();
        self.store.save(&mut project).unwrap();
        project
    }

    pub fn ticket(&self, title: &str, labels: &str) -> Entity {
        let mut ticket = self.store.create("Ticket").unwrap();
        ticket.set_text("title", title).unwrap();
        ticket.set_text("labels", labels).unwrap();
        self.store.save(&mut ticket).unwrap();
        ticket
    }

    /// Reload the current version of `entity`, bypassing the cache.
    pub fn reload(&self, entity: &Entity) -> Entity {
        self.store
            .get(
                entity.entity_type(),
                entity.logical_id().unwrap(),
                rowchain::GetOptions::current().uncached(),
            )
            .unwrap()
            .unwrap()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn registry() -> SchemaRegistry {
    let member = EntitySchema::builder("Member", "members")
        .field(FieldDef::text_max("name", 40))
        .field(FieldDef::reference_list("projects", "Project").empty_allowed())
        .field(
            FieldDef::reference_list("starred", "Project")
                .empty_allowed()
                .manual(),
        )
        .build()
        .unwrap();

    let project = EntitySchema::builder("Project", "projects")
        .field(FieldDef::text_max("name", 60).normalizer(|s| s.trim().to_string()))
        .field(FieldDef::selector("status", ["open", "closed"]).default_text("open"))
        .field(FieldDef::reference_list("members", "Member").empty_allowed())
        .field(FieldDef::reference_list("tickets", "Ticket").empty_allowed())
        .build()
        .unwrap();

    let ticket = EntitySchema::builder("Ticket", "tickets")
        .field(FieldDef::text_max("title", 80))
        .field(FieldDef::boolean("done", false))
        .field(FieldDef::tag_set("labels").empty_allowed())
        .field(FieldDef::text_list("path", "/", 120).empty_allowed())
        .field(FieldDef::reference("project", "Project").empty_allowed())
        .field(
            FieldDef::reference("reviewer", "Member")
                .empty_allowed()
                .strict(),
        )
        .build()
        .unwrap();

    SchemaRegistry::builder()
        .register(member)
        .register(project)
        .register(ticket)
        .actor_type("Member")
        .build()
        .unwrap()
}

pub fn fixture() -> Fixture {
    fixture_with(StoreConfig::default())
}

pub fn fixture_with(config: StoreConfig) -> Fixture {
    fixture_on(config, |db| Arc::new(db) as Arc<dyn Connector>)
}

/// Like `fixture_with`, but the pool connects through whatever `connect`
/// builds around the database.
pub fn fixture_on<F>(config: StoreConfig, connect: F) -> Fixture
where
    F: FnOnce(MemoryDatabase) -> Arc<dyn Connector>,
{
    let clock = Arc::new(ManualClock::new(start_time()));
    let db = MemoryDatabase::with_clock(clock.clone());
    for table in ["members", "projects", "tickets"] {
        db.create_table(table).unwrap();
    }
    db.create_counter("oids", 0).unwrap();

    let store = Store::open(config, registry(), connect(db.clone())).unwrap();
    let admin = store
        .bootstrap_actor(|member| member.set_text("name", "admin"))
        .unwrap();

    Fixture {
        db,
        clock,
        store,
        admin,
    }
}
