// ============================================================================
// Entity Snapshots
// ============================================================================
//
// An `Entity` is one in-memory version of a logical record. It is either
// loaded from a stored row (and then carries that row's bookkeeping in
// `RowMeta`), or pending: unsaved, or mutated since it was loaded.
//
// The first field write on a loaded snapshot strips the row bookkeeping and
// clears `persisted`; that is what lets `save` tell "unchanged" from
// "must write a new version".
//
// ============================================================================

pub mod field_value;
pub mod options;

pub use field_value::FieldValue;
pub use options::{GetOptions, InsertOptions};

use crate::core::{LogicalId, PhysicalId, Result, StoreError, Value};
use crate::result::Record;
use crate::schema::{reserved, EntitySchema, FieldDef, FieldKind};
use chrono::{DateTime, Utc};
use field_value::{coerce, decode, encode};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

/// Bookkeeping columns of the stored row a snapshot was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMeta {
    pub physical_id: PhysicalId,
    pub created_at: DateTime<Utc>,
    pub last_writer: Option<LogicalId>,
    pub is_current: bool,
    pub is_deleted: bool,
}

#[derive(Clone)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    logical_id: Option<LogicalId>,
    values: BTreeMap<String, FieldValue>,
    meta: Option<RowMeta>,
    persisted: bool,
    loaded_from: Option<PhysicalId>,
    as_of: Option<DateTime<Utc>>,
}

impl Entity {
    /// Fresh, unsaved entity with declared defaults applied.
    pub(crate) fn new(schema: Arc<EntitySchema>, logical_id: LogicalId) -> Self {
        let values = schema
            .fields()
            .iter()
            .map(|def| {
                let value = def
                    .default_value()
                    .cloned()
                    .map(FieldValue::from)
                    .unwrap_or_else(|| FieldValue::empty_for(def.kind()));
                (def.name().to_string(), value)
            })
            .collect();

        Self {
            schema,
            logical_id: Some(logical_id),
            values,
            meta: None,
            persisted: false,
            loaded_from: None,
            as_of: None,
        }
    }

    /// Decode a stored row selected with `EntitySchema::columns()`.
    pub(crate) fn from_record(
        schema: Arc<EntitySchema>,
        record: &Record,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let column = |name: &str| {
            record.get(name).ok_or_else(|| {
                StoreError::Driver(format!(
                    "column '{}' missing from {} row",
                    name,
                    schema.table()
                ))
            })
        };
        let int = |name: &str| -> Result<i64> {
            column(name)?.as_i64().ok_or_else(|| {
                StoreError::Driver(format!("column '{}' of {} is not an integer", name, schema.table()))
            })
        };
        let flag = |name: &str| -> Result<bool> {
            column(name)?.as_bool().ok_or_else(|| {
                StoreError::Driver(format!("column '{}' of {} is not a boolean", name, schema.table()))
            })
        };

        let physical_id = PhysicalId(int(reserved::PHYSICAL_ID)?);
        let logical_id = LogicalId(int(reserved::LOGICAL_ID)?);
        let created_at = column(reserved::CREATED_AT)?.as_timestamp().ok_or_else(|| {
            StoreError::Driver(format!("row {} of {} has no creation time", physical_id, schema.table()))
        })?;
        let last_writer = match column(reserved::LAST_WRITER)? {
            Value::Null => None,
            v => Some(LogicalId(v.as_i64().ok_or_else(|| {
                StoreError::Driver(format!("row {} of {} has a malformed writer", physical_id, schema.table()))
            })?)),
        };
        let meta = RowMeta {
            physical_id,
            created_at,
            last_writer,
            is_current: flag(reserved::IS_CURRENT)?,
            is_deleted: flag(reserved::IS_DELETED)?,
        };

        let mut values = BTreeMap::new();
        for def in schema.fields() {
            let value = match record.get(def.storage_column()) {
                Some(raw) => decode(def, schema.name(), raw)?,
                None => decode(def, schema.name(), &Value::Null)?,
            };
            values.insert(def.name().to_string(), value);
        }

        Ok(Self {
            schema,
            logical_id: Some(logical_id),
            values,
            meta: Some(meta),
            persisted: true,
            loaded_from: Some(physical_id),
            as_of,
        })
    }

    // ========================================================================
    // Identity and bookkeeping
    // ========================================================================

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn entity_type(&self) -> &str {
        self.schema.name()
    }

    pub fn logical_id(&self) -> Option<LogicalId> {
        self.logical_id
    }

    /// Stored row of this snapshot; `None` while pending.
    pub fn meta(&self) -> Option<&RowMeta> {
        self.meta.as_ref()
    }

    pub fn physical_id(&self) -> Option<PhysicalId> {
        self.meta.as_ref().map(|m| m.physical_id)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.meta.as_ref().map(|m| m.created_at)
    }

    pub fn last_writer_id(&self) -> Option<LogicalId> {
        self.meta.as_ref().and_then(|m| m.last_writer)
    }

    pub fn is_current(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.is_current)
    }

    pub fn is_deleted(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.is_deleted)
    }

    /// True when this snapshot mirrors a stored row with no pending writes.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// True once any version of this logical record has been stored.
    pub fn is_inserted(&self) -> bool {
        self.loaded_from.is_some()
    }

    /// Physical row this snapshot (or its pending edit) was loaded from.
    pub fn loaded_from(&self) -> Option<PhysicalId> {
        self.loaded_from
    }

    /// Point in time this snapshot was read at, if it is a historical view.
    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }

    /// A pending entity is always updatable; a loaded one only if it is the
    /// live current version.
    pub fn is_updatable(&self) -> bool {
        match &self.meta {
            Some(meta) => meta.is_current && !meta.is_deleted,
            None => true,
        }
    }

    // ========================================================================
    // Generic field access
    // ========================================================================

    pub fn get(&self, field: &str) -> Result<&FieldValue> {
        self.schema.field(field)?;
        self.values.get(field).ok_or_else(|| StoreError::UnknownField {
            entity: self.schema.name().to_string(),
            field: field.to_string(),
        })
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    /// Validate and write one field. Reference fields written here are not
    /// propagated to their targets; use the store's reference assignment for
    /// that.
    pub fn set(&mut self, field: &str, value: impl Into<FieldValue>) -> Result<()> {
        let def = self.schema.field(field)?;
        if !self.is_updatable() {
            return Err(StoreError::InvalidState(format!(
                "{} {} is not updatable",
                self.schema.name(),
                self.describe_id()
            )));
        }
        let value = coerce(def, self.schema.name(), value.into())?;
        self.prepare_to_update();
        self.values.insert(field.to_string(), value);
        Ok(())
    }

    fn prepare_to_update(&mut self) {
        if !self.persisted {
            return;
        }
        event!(
            Level::TRACE,
            entity = self.schema.name(),
            logical_id = ?self.logical_id,
            "snapshot becomes pending"
        );
        self.meta = None;
        self.persisted = false;
        self.as_of = None;
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    fn kind_mismatch(&self, field: &str, wanted: &str) -> StoreError {
        StoreError::InvalidArgument(format!(
            "{}.{} is not a {} field",
            self.schema.name(),
            field,
            wanted
        ))
    }

    pub fn boolean(&self, field: &str) -> Result<bool> {
        self.get(field)?
            .as_bool()
            .ok_or_else(|| self.kind_mismatch(field, "boolean"))
    }

    pub fn text(&self, field: &str) -> Result<&str> {
        self.get(field)?
            .as_text()
            .ok_or_else(|| self.kind_mismatch(field, "text"))
    }

    /// Items of a text-list or tag-set field.
    pub fn list(&self, field: &str) -> Result<&[String]> {
        self.get(field)?
            .as_list()
            .ok_or_else(|| self.kind_mismatch(field, "list"))
    }

    pub fn reference_id(&self, field: &str) -> Result<Option<LogicalId>> {
        self.get(field)?
            .as_reference()
            .ok_or_else(|| self.kind_mismatch(field, "reference"))
    }

    pub fn reference_ids(&self, field: &str) -> Result<&[LogicalId]> {
        self.get(field)?
            .as_reference_list()
            .ok_or_else(|| self.kind_mismatch(field, "reference-list"))
    }

    pub fn set_bool(&mut self, field: &str, value: bool) -> Result<()> {
        self.set(field, FieldValue::Bool(value))
    }

    pub fn set_text(&mut self, field: &str, value: impl Into<String>) -> Result<()> {
        self.set(field, FieldValue::Text(value.into()))
    }

    pub fn set_list<I, S>(&mut self, field: &str, items: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set(field, FieldValue::List(items.into_iter().map(Into::into).collect()))
    }

    /// Raw reference write; does not notify the target.
    pub fn set_reference_id(&mut self, field: &str, id: Option<LogicalId>) -> Result<()> {
        self.set(field, FieldValue::Ref(id))
    }

    /// Raw reference-list write; does not notify the targets.
    pub fn set_reference_ids(&mut self, field: &str, ids: Vec<LogicalId>) -> Result<()> {
        self.set(field, FieldValue::RefList(ids))
    }

    // ========================================================================
    // Storage
    // ========================================================================

    /// User-field columns and encoded values, in declaration order.
    pub(crate) fn encoded_fields(&self) -> Vec<(String, Value)> {
        self.schema
            .fields()
            .iter()
            .map(|def| {
                let value = self
                    .values
                    .get(def.name())
                    .cloned()
                    .unwrap_or_else(|| FieldValue::empty_for(def.kind()));
                (def.storage_column().to_string(), encode(def, &value))
            })
            .collect()
    }

    /// Fields that may not be empty but are.
    pub(crate) fn missing_required(&self) -> Vec<&FieldDef> {
        self.schema
            .fields()
            .iter()
            .filter(|def| !def.is_empty_allowed() && !matches!(def.kind(), FieldKind::Bool))
            .filter(|def| self.values.get(def.name()).is_none_or(FieldValue::is_empty))
            .collect()
    }

    /// Mark this snapshot as read at `at`.
    pub(crate) fn at_time(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    /// Replace this snapshot with a freshly loaded one of the same record.
    pub(crate) fn refresh_from(&mut self, fresh: Entity) {
        *self = fresh;
    }

    fn describe_id(&self) -> String {
        match (self.logical_id, self.physical_id()) {
            (Some(l), Some(p)) => format!("{} ({})", l, p),
            (Some(l), None) => l.to_string(),
            _ => "(no id)".to_string(),
        }
    }
}

/// Two snapshots are equal when they are the same stored row.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name() == other.schema.name()
            && self.persisted
            && other.persisted
            && self.logical_id == other.logical_id
            && self.physical_id() == other.physical_id()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type", &self.schema.name())
            .field("logical_id", &self.logical_id)
            .field("meta", &self.meta)
            .field("persisted", &self.persisted)
            .field("values", &self.values)
            .finish()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.schema.name(), self.describe_id())
    }
}
