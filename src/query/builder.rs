use super::{Predicate, all_match, conjunction};
use crate::core::{LogicalId, Result, StoreError, Value};
use crate::driver::{Condition, Select, Statement};
use crate::entity::{Entity, FieldValue, GetOptions};
use crate::schema::{EntitySchema, reserved};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

/// Which matching version `select` keeps per logical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    First,
    Last,
}

/// Predicate query over one entity type.
///
/// Filters are collected lazily; the first bad filter is reported by the
/// terminal call.
pub struct Query<'s> {
    store: &'s Store,
    entity_type: String,
    filters: Vec<(String, FieldValue)>,
    include_deleted: bool,
    pick: Option<Pick>,
    as_of: Option<DateTime<Utc>>,
}

/// Resolved query, ready to run.
struct Plan {
    schema: Arc<EntitySchema>,
    predicates: Vec<Predicate>,
}

impl Plan {
    fn is_exact(&self) -> bool {
        !self.predicates.iter().any(Predicate::is_approximate)
    }
}

impl<'s> Query<'s> {
    pub(crate) fn new(store: &'s Store, entity_type: &str) -> Self {
        Self {
            store,
            entity_type: entity_type.to_string(),
            filters: Vec::new(),
            include_deleted: false,
            pick: None,
            as_of: None,
        }
    }

    pub fn filter(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    /// Also match records whose current version is a tombstone.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Match any version, current or not, and keep the earliest or latest
    /// matching one per logical id.
    pub fn select(mut self, pick: Pick) -> Self {
        self.pick = Some(pick);
        self
    }

    /// Match against each record as it stood at `at`.
    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    fn plan(&self) -> Result<Plan> {
        if self.pick.is_some() && self.as_of.is_some() {
            return Err(StoreError::InvalidArgument(
                "select and as_of cannot be combined".into(),
            ));
        }
        let schema = self.store.schema(&self.entity_type)?;
        let predicates = self
            .filters
            .iter()
            .map(|(field, value)| Predicate::new(&schema, field, value.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Plan { schema, predicates })
    }

    fn current_select(&self, plan: &Plan) -> Select {
        let select = Select::from(plan.schema.table())
            .filter(conjunction(&plan.predicates))
            .filter(Condition::eq(reserved::IS_CURRENT, true));
        if self.include_deleted {
            select
        } else {
            select.filter(Condition::eq(reserved::IS_DELETED, false))
        }
    }

    // ========================================================================
    // Terminals
    // ========================================================================

    /// Every match, oldest record first.
    pub fn all(self) -> Result<Vec<Entity>> {
        let plan = self.plan()?;
        let found = match (self.pick, self.as_of) {
            (Some(pick), _) => self.run_pick(&plan, pick)?,
            (None, Some(at)) => self.run_as_of(&plan, at)?,
            (None, None) => self.run_current(&plan)?,
        };
        event!(
            Level::TRACE,
            entity = %self.entity_type,
            predicates = plan.predicates.len(),
            matched = found.len(),
            "query"
        );
        Ok(found)
    }

    /// At most one match; more than one is `NotUnique`.
    pub fn unique(self) -> Result<Option<Entity>> {
        if self.pick.is_some() {
            return Err(StoreError::InvalidArgument(
                "unique cannot be combined with select".into(),
            ));
        }
        let mut found = self.all()?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(StoreError::NotUnique(n)),
        }
    }

    pub fn count(self) -> Result<usize> {
        if self.pick.is_some() {
            return Err(StoreError::InvalidArgument(
                "count cannot be combined with select".into(),
            ));
        }
        let plan = self.plan()?;
        if self.as_of.is_some() || !plan.is_exact() {
            return Ok(self.all()?.len());
        }

        let select = self.current_select(&plan).count();
        let result = {
            let conn = self.store.pool().acquire()?;
            conn.execute(&Statement::Select(select))?
        };
        let count = result
            .scalar()
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::Driver("count returned no integer".into()))?;
        usize::try_from(count).map_err(|_| StoreError::Driver(format!("negative count {}", count)))
    }

    /// Logical ids of the matches.
    pub fn ids(self) -> Result<Vec<LogicalId>> {
        let plan = self.plan()?;
        if self.pick.is_none() && self.as_of.is_none() && plan.is_exact() {
            let select = self.current_select(&plan).order_by(reserved::PHYSICAL_ID, false);
            return self.store.select_logical_ids(select);
        }
        Ok(self.all()?.iter().filter_map(Entity::logical_id).collect())
    }

    // ========================================================================
    // Modes
    // ========================================================================

    fn recheck(plan: &Plan, entities: Vec<Entity>) -> Result<Vec<Entity>> {
        if plan.is_exact() {
            return Ok(entities);
        }
        let mut kept = Vec::with_capacity(entities.len());
        for entity in entities {
            if all_match(&plan.predicates, &entity)? {
                kept.push(entity);
            }
        }
        Ok(kept)
    }

    fn run_current(&self, plan: &Plan) -> Result<Vec<Entity>> {
        let select = self
            .current_select(plan)
            .columns(plan.schema.columns())
            .order_by(reserved::PHYSICAL_ID, false);
        let rows = self.store.select_entities(&plan.schema, select, None)?;
        Self::recheck(plan, rows)
    }

    fn run_pick(&self, plan: &Plan, pick: Pick) -> Result<Vec<Entity>> {
        let select = Store::row_select(&plan.schema)
            .filter(conjunction(&plan.predicates))
            .order_by(reserved::PHYSICAL_ID, false);
        let versions = self.store.select_entities(&plan.schema, select, None)?;
        let versions = Self::recheck(plan, versions)?;

        // Versions arrive oldest first.
        let mut order = Vec::new();
        let mut chosen: HashMap<LogicalId, Entity> = HashMap::new();
        for version in versions {
            let Some(id) = version.logical_id() else { continue };
            match chosen.get(&id) {
                None => {
                    order.push(id);
                    chosen.insert(id, version);
                }
                Some(_) if pick == Pick::Last => {
                    chosen.insert(id, version);
                }
                Some(_) => {}
            }
        }
        Ok(order.into_iter().filter_map(|id| chosen.remove(&id)).collect())
    }

    fn run_as_of(&self, plan: &Plan, at: DateTime<Utc>) -> Result<Vec<Entity>> {
        let candidates = Select::from(plan.schema.table())
            .filter(conjunction(&plan.predicates))
            .filter(Condition::AtMost(reserved::CREATED_AT.into(), Value::Timestamp(at)))
            .order_by(reserved::PHYSICAL_ID, false);
        let ids = self.store.select_logical_ids(candidates)?;

        let mut opts = GetOptions::at(at);
        opts.include_deleted = self.include_deleted;

        let mut found = Vec::new();
        for id in ids {
            // The candidate row matched, but it may have been superseded
            // before `at`; judge the version that was latest then.
            let Some(snapshot) = self.store.get(&self.entity_type, id, opts)? else {
                continue;
            };
            if all_match(&plan.predicates, &snapshot)? {
                found.push(snapshot);
            }
        }
        Ok(found)
    }
}
