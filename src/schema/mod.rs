// ============================================================================
// Schema Metadata
// ============================================================================
//
// Static, already-resolved description of every entity type: its table, its
// user fields in declaration order and the reserved bookkeeping columns that
// every versioned table carries. Built once, shared read-only through `Arc`.
//
// ============================================================================

pub mod field;

pub use field::{FieldDef, FieldDefault, FieldKind, TextRule, REFERENCE_LIST_SEPARATOR, TAG_SEPARATOR};

use crate::core::{Result, StoreError};
use crate::entity::field_value::coerce;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Reserved bookkeeping columns present on every versioned table.
pub mod reserved {
    pub const PHYSICAL_ID: &str = "id";
    pub const LOGICAL_ID: &str = "logical_id";
    pub const CREATED_AT: &str = "created_at";
    pub const LAST_WRITER: &str = "last_writer";
    pub const IS_CURRENT: &str = "is_current";
    pub const IS_DELETED: &str = "is_deleted";

    pub const ALL: [&str; 6] = [
        PHYSICAL_ID,
        LOGICAL_ID,
        CREATED_AT,
        LAST_WRITER,
        IS_CURRENT,
        IS_DELETED,
    ];

    pub fn is_reserved(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// One entity type: table name plus ordered user fields.
#[derive(Debug)]
pub struct EntitySchema {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    by_name: HashMap<String, usize>,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>, table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&FieldDef> {
        self.by_name
            .get(name)
            .map(|idx| &self.fields[*idx])
            .ok_or_else(|| StoreError::UnknownField {
                entity: self.name.clone(),
                field: name.to_string(),
            })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Field stored under `column`, if any.
    pub fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// All columns in select order: reserved first, then user fields.
    pub fn columns(&self) -> Vec<String> {
        reserved::ALL
            .iter()
            .map(|c| c.to_string())
            .chain(self.fields.iter().map(|f| f.column.clone()))
            .collect()
    }

    /// Reference fields of this type that point at `target`.
    pub fn reference_fields_to<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a FieldDef> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.kind.target() == Some(target))
    }
}

pub struct SchemaBuilder {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
}

impl SchemaBuilder {
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    /// Validate every declaration and freeze the schema.
    pub fn build(self) -> Result<EntitySchema> {
        if self.name.is_empty() || self.table.is_empty() {
            return Err(StoreError::Configuration(
                "entity name and table name are required".into(),
            ));
        }

        let mut by_name = HashMap::new();
        let mut columns = HashSet::new();
        for (idx, def) in self.fields.iter().enumerate() {
            if reserved::is_reserved(&def.name) || reserved::is_reserved(&def.column) {
                return Err(StoreError::Configuration(format!(
                    "field {}.{} is reserved",
                    self.name, def.name
                )));
            }
            def.check_declaration(&self.name)?;
            if by_name.insert(def.name.clone(), idx).is_some() {
                return Err(StoreError::Configuration(format!(
                    "field {}.{} declared twice",
                    self.name, def.name
                )));
            }
            if !columns.insert(def.column.clone()) {
                return Err(StoreError::Configuration(format!(
                    "column {}.{} used by more than one field",
                    self.table, def.column
                )));
            }
            if let Some(default) = &def.default {
                coerce(def, &self.name, default.clone().into()).map_err(|e| {
                    StoreError::Configuration(format!(
                        "default of {}.{} is invalid: {}",
                        self.name, def.name, e
                    ))
                })?;
            }
        }

        Ok(EntitySchema {
            name: self.name,
            table: self.table,
            fields: self.fields,
            by_name,
        })
    }
}

/// Every entity type known to a store, plus which type acts as the writer.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: HashMap<String, Arc<EntitySchema>>,
    actor_type: Option<String>,
}

impl SchemaRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<Arc<EntitySchema>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::Configuration(format!("unknown entity type '{}'", name)))
    }

    pub fn actor_type(&self) -> Option<&str> {
        self.actor_type.as_deref()
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.types.values()
    }

    /// Table names of every registered type.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.types.values().map(|s| s.table.clone()).collect();
        tables.sort();
        tables
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    schemas: Vec<EntitySchema>,
    actor_type: Option<String>,
}

impl RegistryBuilder {
    pub fn register(mut self, schema: EntitySchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Entity type whose instances stamp `last_writer`.
    pub fn actor_type(mut self, name: impl Into<String>) -> Self {
        self.actor_type = Some(name.into());
        self
    }

    pub fn build(self) -> Result<SchemaRegistry> {
        let mut types = HashMap::new();
        let mut tables = HashSet::new();
        for schema in self.schemas {
            if !tables.insert(schema.table.clone()) {
                return Err(StoreError::Configuration(format!(
                    "table '{}' mapped by more than one entity type",
                    schema.table
                )));
            }
            let name = schema.name.clone();
            if types.insert(name.clone(), Arc::new(schema)).is_some() {
                return Err(StoreError::Configuration(format!(
                    "entity type '{}' registered twice",
                    name
                )));
            }
        }

        for schema in types.values() {
            for def in &schema.fields {
                if let Some(target) = def.kind.target()
                    && !types.contains_key(target)
                {
                    return Err(StoreError::Configuration(format!(
                        "{}.{} references unknown entity type '{}'",
                        schema.name, def.name, target
                    )));
                }
            }
        }

        if let Some(actor) = &self.actor_type
            && !types.contains_key(actor)
        {
            return Err(StoreError::Configuration(format!(
                "actor type '{}' is not registered",
                actor
            )));
        }

        Ok(SchemaRegistry {
            types,
            actor_type: self.actor_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> SchemaBuilder {
        EntitySchema::builder("Ticket", "tickets")
            .field(FieldDef::boolean("open", true))
            .field(FieldDef::text_max("title", 32))
            .field(FieldDef::text_max("body", 1024).column("string4").empty_allowed())
    }

    #[test]
    fn test_columns_put_reserved_first() {
        let schema = ticket().build().unwrap();
        let columns = schema.columns();
        assert_eq!(&columns[..6], &reserved::ALL.map(String::from));
        assert_eq!(&columns[6..], &["open", "title", "string4"]);
        assert_eq!(schema.field_by_column("string4").unwrap().name(), "body");
    }

    #[test]
    fn test_reserved_names_rejected() {
        for name in reserved::ALL {
            let result = ticket().field(FieldDef::text_max(name, 10)).build();
            assert!(matches!(result, Err(StoreError::Configuration(_))), "{}", name);
        }
        let result = ticket()
            .field(FieldDef::text_max("legit", 10).column("is_current"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_fields_and_columns_rejected() {
        assert!(ticket().field(FieldDef::text_max("title", 8)).build().is_err());
        assert!(ticket()
            .field(FieldDef::text_max("other", 8).column("title"))
            .build()
            .is_err());
    }

    #[test]
    fn test_invalid_default_rejected() {
        let result = ticket()
            .field(FieldDef::selector("status", ["OPEN", "CLOSED"]).default_text("LOST"))
            .build();
        assert!(matches!(result, Err(StoreError::Configuration(_))));

        let ok = ticket()
            .field(FieldDef::selector("status", ["OPEN", "CLOSED"]).default_text("OPEN"))
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_unknown_field_lookup() {
        let schema = ticket().build().unwrap();
        assert!(matches!(
            schema.field("nope"),
            Err(StoreError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_registry_checks_reference_targets() {
        let ticket = EntitySchema::builder("Ticket", "tickets")
            .field(FieldDef::reference("project", "Project"))
            .build()
            .unwrap();
        let result = SchemaRegistry::builder().register(ticket).build();
        assert!(matches!(result, Err(StoreError::Configuration(_))));
    }

    #[test]
    fn test_registry_checks_actor_type() {
        let schema = ticket().build().unwrap();
        let result = SchemaRegistry::builder()
            .register(schema)
            .actor_type("Member")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_reference_fields_to() {
        let project = EntitySchema::builder("Project", "projects")
            .field(FieldDef::reference_list("tickets", "Ticket").empty_allowed())
            .field(FieldDef::reference("lead", "Member").empty_allowed())
            .build()
            .unwrap();
        let names: Vec<&str> = project.reference_fields_to("Ticket").map(|f| f.name()).collect();
        assert_eq!(names, vec!["tickets"]);
    }

    #[test]
    fn test_field_lookup_and_descriptions() {
        let schema = ticket()
            .field(FieldDef::text_max("owner", 40).empty_allowed().describe("who picked it up"))
            .build()
            .unwrap();
        assert!(schema.has_field("owner"));
        assert!(!schema.has_field("string4"));
        assert!(schema.field_by_column("body").is_none());
        assert_eq!(schema.field("owner").unwrap().description(), Some("who picked it up"));
        assert_eq!(schema.field("title").unwrap().description(), None);
    }

    #[test]
    fn test_registry_lists_tables() {
        let project = EntitySchema::builder("Project", "projects")
            .field(FieldDef::reference_list("tickets", "Ticket").empty_allowed())
            .build()
            .unwrap();
        let registry = SchemaRegistry::builder()
            .register(ticket().build().unwrap())
            .register(project)
            .build()
            .unwrap();
        assert_eq!(registry.tables(), vec!["projects", "tickets"]);
        assert_eq!(registry.types().count(), 2);
    }
}
