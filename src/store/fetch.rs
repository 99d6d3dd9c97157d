use super::Store;
use crate::core::{LogicalId, PhysicalId, Result, StoreError, Value};
use crate::driver::{Condition, Select, Statement};
use crate::entity::{Entity, GetOptions};
use crate::schema::{EntitySchema, FieldKind, reserved};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{Level, event};

/// How far past its own creation a history snapshot reads related records.
/// Covers targets written moments later by the same logical operation.
const HISTORY_READ_GRACE_SECS: i64 = 2;

impl Store {
    // ========================================================================
    // Row plumbing
    // ========================================================================

    /// Full-row select over a type's table.
    pub(crate) fn row_select(schema: &EntitySchema) -> Select {
        Select::from(schema.table()).columns(schema.columns())
    }

    /// Full-row select restricted to current, non-deleted versions.
    pub(crate) fn live_select(schema: &EntitySchema) -> Select {
        Self::row_select(schema)
            .filter(Condition::eq(reserved::IS_CURRENT, true))
            .filter(Condition::eq(reserved::IS_DELETED, false))
    }

    pub(crate) fn select_entities(
        &self,
        schema: &Arc<EntitySchema>,
        select: Select,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<Entity>> {
        let result = {
            let conn = self.pool.acquire()?;
            conn.execute(&Statement::Select(select))?
        };
        result
            .into_records()
            .iter()
            .map(|record| Entity::from_record(Arc::clone(schema), record, as_of))
            .collect()
    }

    /// Distinct logical ids from a select projecting `logical_id`, first
    /// occurrence order.
    pub(crate) fn select_logical_ids(&self, select: Select) -> Result<Vec<LogicalId>> {
        let result = {
            let conn = self.pool.acquire()?;
            conn.execute(&Statement::Select(select.columns([reserved::LOGICAL_ID])))?
        };
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for row in &result.rows {
            let id = row
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| StoreError::Driver("logical_id column is not an integer".into()))?;
            if seen.insert(id) {
                ids.push(LogicalId(id));
            }
        }
        Ok(ids)
    }

    pub(crate) fn fetch_physical(
        &self,
        schema: &Arc<EntitySchema>,
        id: PhysicalId,
    ) -> Result<Option<Entity>> {
        let select = Self::row_select(schema)
            .filter(Condition::eq(reserved::PHYSICAL_ID, id.0))
            .limit(1);
        Ok(self.select_entities(schema, select, None)?.into_iter().next())
    }

    fn cache_usable(&self, opts: &GetOptions) -> Result<bool> {
        Ok(opts.cacheable() && !self.pool.in_transaction()?)
    }

    // ========================================================================
    // Single and batched fetch
    // ========================================================================

    /// Fetch one logical record.
    ///
    /// Without `as_of` this is the current version (tombstones only with
    /// `include_deleted`). With `as_of` it is the latest version created at or
    /// before that instant; if that version is a tombstone the record did not
    /// exist then, unless `include_deleted` asks for it.
    pub fn get(
        &self,
        entity_type: &str,
        id: LogicalId,
        opts: GetOptions,
    ) -> Result<Option<Entity>> {
        let schema = self.schema(entity_type)?;
        self.fetch_one(&schema, id, opts)
    }

    pub(crate) fn fetch_one(
        &self,
        schema: &Arc<EntitySchema>,
        id: LogicalId,
        opts: GetOptions,
    ) -> Result<Option<Entity>> {
        let cacheable = self.cache_usable(&opts)?;
        if cacheable && let Some(hit) = self.cache().get(schema.name(), id) {
            event!(Level::TRACE, entity = schema.name(), logical_id = %id, "cache hit");
            return Ok(Some(hit));
        }
        let generation = self.cache().generation();

        let base = Self::row_select(schema).filter(Condition::eq(reserved::LOGICAL_ID, id.0));
        let select = match opts.as_of {
            Some(at) => base
                .filter(Condition::AtMost(reserved::CREATED_AT.into(), Value::Timestamp(at)))
                .order_by(reserved::CREATED_AT, true)
                .order_by(reserved::PHYSICAL_ID, true),
            None => {
                let current = base.filter(Condition::eq(reserved::IS_CURRENT, true));
                let current = if opts.include_deleted {
                    current
                } else {
                    current.filter(Condition::eq(reserved::IS_DELETED, false))
                };
                current.order_by(reserved::PHYSICAL_ID, true)
            }
        }
        .limit(1)
        .for_update(opts.for_update);

        let found = self
            .select_entities(schema, select, opts.as_of)?
            .into_iter()
            .next()
            .filter(|entity| opts.include_deleted || !entity.is_deleted());

        if cacheable && let Some(entity) = &found {
            self.cache().put(entity, generation);
        }
        Ok(found)
    }

    /// Fetch several records of one type, in input order, duplicates
    /// collapsed. Ids with no matching version are skipped.
    pub fn get_many(
        &self,
        entity_type: &str,
        ids: &[LogicalId],
        opts: GetOptions,
    ) -> Result<Vec<Entity>> {
        let schema = self.schema(entity_type)?;
        let mut seen = HashSet::new();
        let wanted: Vec<LogicalId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        if opts.as_of.is_some() {
            let mut found = Vec::with_capacity(wanted.len());
            for id in wanted {
                if let Some(entity) = self.fetch_one(&schema, id, opts)? {
                    found.push(entity);
                }
            }
            return Ok(found);
        }

        let cacheable = self.cache_usable(&opts)?;
        let generation = self.cache().generation();
        let mut found: HashMap<LogicalId, Entity> = HashMap::new();
        let mut misses = Vec::new();
        for id in &wanted {
            match cacheable.then(|| self.cache().get(schema.name(), *id)).flatten() {
                Some(hit) => {
                    found.insert(*id, hit);
                }
                None => misses.push(*id),
            }
        }

        if !misses.is_empty() {
            let keys = misses.iter().map(|id| Value::Integer(id.0)).collect();
            let select = Self::row_select(&schema)
                .filter(Condition::In(reserved::LOGICAL_ID.into(), keys))
                .filter(Condition::eq(reserved::IS_CURRENT, true));
            let select = if opts.include_deleted {
                select
            } else {
                select.filter(Condition::eq(reserved::IS_DELETED, false))
            };
            for entity in self.select_entities(&schema, select.for_update(opts.for_update), None)? {
                if cacheable {
                    self.cache().put(&entity, generation);
                }
                if let Some(id) = entity.logical_id() {
                    found.insert(id, entity);
                }
            }
        }

        event!(
            Level::TRACE,
            entity = entity_type,
            requested = wanted.len(),
            fetched = misses.len(),
            "batch fetch"
        );
        Ok(wanted.into_iter().filter_map(|id| found.remove(&id)).collect())
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Every version of a record, newest first, each marked as read shortly
    /// after its own creation time.
    pub fn history(&self, entity_type: &str, id: LogicalId) -> Result<Vec<Entity>> {
        let schema = self.schema(entity_type)?;
        let select = Self::row_select(&schema)
            .filter(Condition::eq(reserved::LOGICAL_ID, id.0))
            .order_by(reserved::PHYSICAL_ID, true);
        let versions: Vec<Entity> = self
            .select_entities(&schema, select, None)?
            .into_iter()
            .map(|entity| match entity.created_at() {
                Some(at) => entity.at_time(at + Duration::seconds(HISTORY_READ_GRACE_SECS)),
                None => entity,
            })
            .collect();
        if versions.is_empty() {
            return Err(StoreError::NotFound(format!(
                "no versions of {} {}",
                entity_type, id
            )));
        }
        Ok(versions)
    }

    /// Histories of every record of `entity_type` with at least one version
    /// created in `[from, to]`, ordered by each record's first version.
    pub fn retrospective_range(
        &self,
        entity_type: &str,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Vec<Entity>>> {
        let schema = self.schema(entity_type)?;
        let mut select = Select::from(schema.table())
            .filter(Condition::AtLeast(reserved::CREATED_AT.into(), Value::Timestamp(from)));
        if let Some(to) = to {
            select = select.filter(Condition::AtMost(reserved::CREATED_AT.into(), Value::Timestamp(to)));
        }
        let ids = self.select_logical_ids(select.order_by(reserved::PHYSICAL_ID, false))?;

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            groups.push(self.history(entity_type, id)?);
        }
        groups.sort_by_key(|versions| versions.last().and_then(Entity::physical_id));
        Ok(groups)
    }

    /// The actor that wrote this version.
    pub fn last_writer(&self, entity: &Entity) -> Result<Option<Entity>> {
        let actor_type = self
            .registry
            .actor_type()
            .ok_or_else(|| StoreError::Configuration("no actor type registered".into()))?;
        match entity.last_writer_id() {
            None => Ok(None),
            Some(id) => self.get(actor_type, id, GetOptions::current().with_deleted()),
        }
    }

    // ========================================================================
    // Reference resolution
    // ========================================================================

    /// Historical snapshots resolve references at their own instant.
    fn snapshot_options(entity: &Entity) -> GetOptions {
        entity.as_of().map(GetOptions::at).unwrap_or_default()
    }

    /// Resolve a single reference field.
    pub fn referenced(&self, entity: &Entity, field: &str) -> Result<Option<Entity>> {
        let def = entity.schema().field(field)?;
        let FieldKind::Reference { target } = def.kind() else {
            return Err(StoreError::InvalidArgument(format!(
                "{}.{} is not a reference field",
                entity.entity_type(),
                field
            )));
        };
        match entity.reference_id(field)? {
            None => Ok(None),
            Some(id) => self.get(target, id, Self::snapshot_options(entity)),
        }
    }

    /// Resolve a reference-list field, in stored order. Dangling ids are
    /// skipped.
    pub fn referenced_list(&self, entity: &Entity, field: &str) -> Result<Vec<Entity>> {
        let def = entity.schema().field(field)?;
        let FieldKind::ReferenceList { target } = def.kind() else {
            return Err(StoreError::InvalidArgument(format!(
                "{}.{} is not a reference list field",
                entity.entity_type(),
                field
            )));
        };
        self.get_many(target, entity.reference_ids(field)?, Self::snapshot_options(entity))
    }

    /// Batch-load every record referenced by `entities` so later lookups hit
    /// the cache. Returns how many records were loaded.
    pub fn preload(&self, entities: &[Entity]) -> Result<usize> {
        let mut wanted: BTreeMap<String, Vec<LogicalId>> = BTreeMap::new();
        for entity in entities {
            for def in entity.schema().fields() {
                match def.kind() {
                    FieldKind::Reference { target } => {
                        if let Some(id) = entity.reference_id(def.name())? {
                            wanted.entry(target.clone()).or_default().push(id);
                        }
                    }
                    FieldKind::ReferenceList { target } => {
                        wanted
                            .entry(target.clone())
                            .or_default()
                            .extend_from_slice(entity.reference_ids(def.name())?);
                    }
                    _ => {}
                }
            }
        }

        let mut loaded = 0;
        for (target, ids) in wanted {
            loaded += self.get_many(&target, &ids, GetOptions::current())?.len();
        }
        Ok(loaded)
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// Every current, non-deleted record of a type.
    pub fn all(&self, entity_type: &str) -> Result<Vec<Entity>> {
        let schema = self.schema(entity_type)?;
        let select = Self::live_select(&schema).order_by(reserved::PHYSICAL_ID, false);
        self.select_entities(&schema, select, None)
    }

    /// Live records that satisfy `predicate`.
    pub fn choose<F>(&self, entity_type: &str, predicate: F) -> Result<Vec<Entity>>
    where
        F: Fn(&Entity) -> bool,
    {
        Ok(self.all(entity_type)?.into_iter().filter(|e| predicate(e)).collect())
    }

    fn text_column(schema: &EntitySchema, field: &str) -> Result<String> {
        let def = schema.field(field)?;
        match def.kind() {
            FieldKind::Text { .. } => Ok(def.storage_column().to_string()),
            other => Err(StoreError::InvalidArgument(format!(
                "{}.{} is a {} field, expected text",
                schema.name(),
                field,
                other.type_tag()
            ))),
        }
    }

    /// Live records ordered by a text field, ties by age.
    pub fn sorted_by(&self, entity_type: &str, field: &str) -> Result<Vec<Entity>> {
        let schema = self.schema(entity_type)?;
        let column = Self::text_column(&schema, field)?;
        let select = Self::live_select(&schema)
            .order_by(column, false)
            .order_by(reserved::PHYSICAL_ID, false);
        self.select_entities(&schema, select, None)
    }

    /// Live records whose text `field` matches `pattern`.
    pub fn regex_match(&self, entity_type: &str, field: &str, pattern: &str) -> Result<Vec<Entity>> {
        let schema = self.schema(entity_type)?;
        Self::text_column(&schema, field)?;
        let re = Regex::new(pattern)
            .map_err(|e| StoreError::InvalidArgument(format!("bad pattern '{}': {}", pattern, e)))?;

        let mut matched = Vec::new();
        for entity in self.all(entity_type)? {
            if re.is_match(entity.text(field)?) {
                matched.push(entity);
            }
        }
        event!(
            Level::DEBUG,
            entity = entity_type,
            field,
            pattern,
            matched = matched.len(),
            "regex match"
        );
        Ok(matched)
    }

    pub fn regex_match_ids(
        &self,
        entity_type: &str,
        field: &str,
        pattern: &str,
    ) -> Result<Vec<LogicalId>> {
        Ok(self
            .regex_match(entity_type, field, pattern)?
            .iter()
            .filter_map(Entity::logical_id)
            .collect())
    }
}
