use super::Store;
use crate::core::{LogicalId, PhysicalId, Result, StoreError, Value};
use crate::driver::{Condition, Statement};
use crate::entity::{Entity, FieldValue, GetOptions, InsertOptions};
use crate::schema::{FieldKind, reserved};
use std::sync::Arc;
use tracing::{Level, event};

impl Store {
    /// Append a brand-new record's first version, stamped with the current
    /// actor. Existing records go through `save`.
    pub fn insert(&self, entity: &mut Entity, opts: InsertOptions) -> Result<()> {
        if entity.is_inserted() {
            return Err(StoreError::InvalidState(format!(
                "{} is already stored, use save",
                entity
            )));
        }
        let writer = self.require_actor()?;
        self.insert_stamped(entity, opts.removed, writer)
    }

    fn require_actor(&self) -> Result<LogicalId> {
        self.current_actor()?.ok_or_else(|| {
            StoreError::Configuration("no current actor; writes need a writer to stamp".into())
        })
    }

    /// Validate and append one version row, then reload the snapshot from it.
    pub(crate) fn insert_stamped(
        &self,
        entity: &mut Entity,
        removed: bool,
        writer: LogicalId,
    ) -> Result<()> {
        let schema = Arc::clone(entity.schema());
        let logical_id = entity.logical_id().ok_or_else(|| {
            StoreError::validation(schema.name(), reserved::LOGICAL_ID, "missing logical id")
        })?;
        if let Some(def) = entity.missing_required().first() {
            return Err(StoreError::validation(schema.name(), def.name(), "may not be empty"));
        }
        if !removed {
            self.check_strict_references(entity)?;
        }

        let mut values = vec![
            (reserved::LOGICAL_ID.to_string(), Value::Integer(logical_id.0)),
            (reserved::LAST_WRITER.to_string(), Value::Integer(writer.0)),
            (reserved::IS_CURRENT.to_string(), Value::Boolean(true)),
            (reserved::IS_DELETED.to_string(), Value::Boolean(removed)),
        ];
        values.extend(entity.encoded_fields());

        let physical_id = {
            let conn = self.pool.acquire()?;
            conn.execute(&Statement::Insert {
                table: schema.table().to_string(),
                values,
            })?;
            PhysicalId(conn.last_insert_id()?)
        };
        event!(
            Level::DEBUG,
            entity = schema.name(),
            logical_id = %logical_id,
            physical_id = %physical_id,
            removed,
            "version inserted"
        );

        let fresh = self.fetch_physical(&schema, physical_id)?.ok_or_else(|| {
            StoreError::Driver(format!("inserted row {} could not be read back", physical_id))
        })?;
        entity.refresh_from(fresh);
        Ok(())
    }

    /// Strict references must resolve to a live record of the target type.
    fn check_strict_references(&self, entity: &Entity) -> Result<()> {
        for def in entity.schema().fields().iter().filter(|def| def.is_strict()) {
            let (target, ids) = match (def.kind(), entity.get(def.name())?) {
                (FieldKind::Reference { target }, FieldValue::Ref(id)) => {
                    (target, id.iter().copied().collect::<Vec<_>>())
                }
                (FieldKind::ReferenceList { target }, FieldValue::RefList(ids)) => {
                    (target, ids.clone())
                }
                _ => continue,
            };
            let target_schema = self.schema(target)?;
            for id in ids {
                if self
                    .fetch_one(&target_schema, id, GetOptions::current().uncached())?
                    .is_none()
                {
                    return Err(StoreError::validation(
                        entity.entity_type(),
                        def.name(),
                        format!("{} {} does not exist", target, id),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Persist pending changes as a new version.
    ///
    /// A snapshot that is already persisted is left alone. One that was
    /// never stored gets its first version. Otherwise the write succeeds only
    /// if the version it was loaded from is still the current one.
    pub fn save(&self, entity: &mut Entity) -> Result<()> {
        if !entity.is_updatable() {
            return Err(StoreError::InvalidState(format!(
                "{} is a historical or deleted snapshot",
                entity
            )));
        }
        if entity.is_persisted() {
            return Ok(());
        }
        self.cache().flush();
        if !entity.is_inserted() {
            return self.insert(entity, InsertOptions::default());
        }
        self.write_version(entity, false)
    }

    /// Soft delete: append a tombstone version. Only an unmodified current
    /// snapshot can be removed.
    pub fn remove(&self, entity: &mut Entity) -> Result<()> {
        if !entity.is_persisted() || !entity.is_updatable() || entity.logical_id().is_none() {
            return Err(StoreError::InvalidState(format!(
                "{} must be an unmodified current snapshot to be removed",
                entity
            )));
        }
        self.cache().flush();
        self.write_version(entity, true)
    }

    fn write_version(&self, entity: &mut Entity, removed: bool) -> Result<()> {
        let schema = Arc::clone(entity.schema());
        let logical_id = entity
            .logical_id()
            .ok_or_else(|| StoreError::InvalidState(format!("{} has no logical id", entity)))?;
        let expected = entity.loaded_from();
        let writer = self.require_actor()?;

        let mut pending = entity.clone();
        self.transaction(|| {
            let opts = GetOptions::current().with_deleted().uncached().locking();
            let current = self.fetch_one(&schema, logical_id, opts)?.ok_or_else(|| {
                StoreError::NotFound(format!("{} {} has no stored version", schema.name(), logical_id))
            })?;
            self.cache().flush();

            if current.physical_id() != expected {
                event!(
                    Level::WARN,
                    entity = schema.name(),
                    logical_id = %logical_id,
                    expected = ?expected.map(|id| id.0),
                    found = ?current.physical_id().map(|id| id.0),
                    "version conflict"
                );
                return Err(StoreError::Concurrency {
                    entity: schema.name().to_string(),
                    logical_id,
                });
            }

            let retired = current
                .physical_id()
                .ok_or_else(|| StoreError::Driver("current row has no physical id".into()))?;
            {
                let conn = self.pool.acquire()?;
                conn.execute(&Statement::Update {
                    table: schema.table().to_string(),
                    assignments: vec![(reserved::IS_CURRENT.to_string(), Value::Boolean(false))],
                    condition: Condition::eq(reserved::PHYSICAL_ID, retired.0),
                })?;
            }
            self.insert_stamped(&mut pending, removed, writer)
        })?;

        self.cache().flush();
        *entity = pending;
        Ok(())
    }

    /// The unique live record matching `filters`, or a new one holding those
    /// values, decided inside one transaction.
    pub fn query_or_create(
        &self,
        entity_type: &str,
        filters: &[(&str, FieldValue)],
    ) -> Result<Entity> {
        self.transaction(|| {
            let query = filters
                .iter()
                .fold(self.query(entity_type), |query, (field, value)| {
                    query.filter(field, value.clone())
                });
            if let Some(found) = query.unique()? {
                return Ok(found);
            }

            let mut entity = self.create(entity_type)?;
            for (field, value) in filters {
                entity.set(field, value.clone())?;
            }
            self.save(&mut entity)?;
            event!(Level::DEBUG, entity = %entity, "created by query_or_create");
            Ok(entity)
        })
    }
}
