// ============================================================================
// Predicate Translation
// ============================================================================
//
// A predicate pairs a field with the value it must hold. Each one becomes a
// storage condition, encoded the way the field's type is stored, plus an
// exact in-memory check. The storage condition may be coarser than the
// in-memory one (full-text containment for tag sets), never finer.
//
// ============================================================================

pub mod builder;

pub use builder::{Pick, Query};

use crate::core::{Result, StoreError};
use crate::driver::Condition;
use crate::entity::field_value::encode;
use crate::entity::{Entity, FieldValue};
use crate::schema::{EntitySchema, FieldDef, FieldKind};

/// One `{field, expected value}` filter, canonicalized for its field type.
#[derive(Debug, Clone)]
pub struct Predicate {
    def: FieldDef,
    expected: FieldValue,
}

impl Predicate {
    /// Resolve `field` on `schema` and bring `value` into the field's
    /// canonical form.
    pub fn new(schema: &EntitySchema, field: &str, value: FieldValue) -> Result<Self> {
        let def = schema.field(field)?.clone();
        let expected = canonical(&def, schema.name(), value)?;
        Ok(Self { def, expected })
    }

    pub fn field(&self) -> &str {
        self.def.name()
    }

    pub fn expected(&self) -> &FieldValue {
        &self.expected
    }

    /// Storage-level condition.
    pub fn condition(&self) -> Condition {
        let column = self.def.storage_column().to_string();
        if self.expected.is_empty() {
            return Condition::NullOrEmpty(column);
        }
        match (self.def.kind(), &self.expected) {
            (FieldKind::TagSet, FieldValue::List(tags)) => Condition::FullText(column, tags.clone()),
            _ => Condition::Eq(column, encode(&self.def, &self.expected)),
        }
    }

    /// Whether `condition()` can match rows this predicate rejects.
    pub fn is_approximate(&self) -> bool {
        matches!(self.def.kind(), FieldKind::TagSet) && !self.expected.is_empty()
    }

    /// Exact check against a loaded snapshot.
    pub fn matches(&self, entity: &Entity) -> Result<bool> {
        let actual = entity.get(self.def.name())?;
        match (&self.expected, actual) {
            (FieldValue::List(wanted), FieldValue::List(held))
                if matches!(self.def.kind(), FieldKind::TagSet) =>
            {
                if wanted.is_empty() {
                    return Ok(held.is_empty());
                }
                Ok(wanted.iter().all(|tag| held.contains(tag)))
            }
            (expected, actual) => Ok(expected == actual),
        }
    }
}

/// Condition for a whole predicate set.
pub(crate) fn conjunction(predicates: &[Predicate]) -> Condition {
    predicates
        .iter()
        .fold(Condition::Always, |acc, p| acc.and(p.condition()))
}

/// Every predicate holds for `entity`.
pub(crate) fn all_match(predicates: &[Predicate], entity: &Entity) -> Result<bool> {
    for predicate in predicates {
        if !predicate.matches(entity)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Like write coercion, without the validation rules: a value no entity
/// could hold simply matches nothing.
fn canonical(def: &FieldDef, entity: &str, value: FieldValue) -> Result<FieldValue> {
    let mismatch = |got: &FieldValue| {
        Err(StoreError::InvalidArgument(format!(
            "{}.{} is a {} field, cannot compare with {:?}",
            entity,
            def.name(),
            def.kind().type_tag(),
            got
        )))
    };

    match (def.kind(), value) {
        (FieldKind::Bool, FieldValue::Bool(b)) => Ok(FieldValue::Bool(b)),
        (FieldKind::Text { .. }, FieldValue::Text(s)) if s.is_empty() => Ok(FieldValue::Text(s)),
        (FieldKind::Text { .. }, FieldValue::Text(s)) => Ok(FieldValue::Text(def.normalize(&s))),
        (FieldKind::TextList { .. }, FieldValue::List(items)) => Ok(FieldValue::List(items)),
        (FieldKind::TextList { separator, .. }, FieldValue::Text(s)) => Ok(FieldValue::List(
            if s.is_empty() {
                Vec::new()
            } else {
                s.split(separator.as_str()).map(String::from).collect()
            },
        )),
        (FieldKind::TagSet, FieldValue::List(tags)) => Ok(FieldValue::List(tags)),
        (FieldKind::TagSet, FieldValue::Text(s)) => Ok(FieldValue::List(
            s.split_whitespace().map(String::from).collect(),
        )),
        (FieldKind::Reference { .. }, FieldValue::Ref(id)) => Ok(FieldValue::Ref(id)),
        (FieldKind::ReferenceList { .. }, FieldValue::RefList(ids)) => Ok(FieldValue::RefList(ids)),
        (FieldKind::ReferenceList { .. }, FieldValue::Ref(id)) => {
            Ok(FieldValue::RefList(id.into_iter().collect()))
        }
        (_, other) => mismatch(&other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LogicalId, Value};
    use crate::schema::TextRule;

    fn schema() -> EntitySchema {
        EntitySchema::builder("Ticket", "tickets")
            .field(FieldDef::text_max("title", 80).normalizer(|s| s.trim().to_string()))
            .field(FieldDef::boolean("open", true))
            .field(FieldDef::tag_set("labels").empty_allowed())
            .field(FieldDef::text_list("path", "/", 200).empty_allowed())
            .field(FieldDef::reference("project", "Project").empty_allowed())
            .field(FieldDef::reference_list("watchers", "Member").empty_allowed())
            .field(FieldDef::text("kind", TextRule::MaxLength(10)).column("ticket_kind"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_text_predicate_is_normalized() {
        let p = Predicate::new(&schema(), "title", "  crash  ".into()).unwrap();
        assert_eq!(
            p.condition(),
            Condition::Eq("title".into(), Value::Text("crash".into()))
        );
        assert!(!p.is_approximate());
    }

    #[test]
    fn test_empty_values_match_null_or_empty() {
        let p = Predicate::new(&schema(), "project", FieldValue::Ref(None)).unwrap();
        assert_eq!(p.condition(), Condition::NullOrEmpty("project".into()));
        let p = Predicate::new(&schema(), "title", "".into()).unwrap();
        assert_eq!(p.condition(), Condition::NullOrEmpty("title".into()));
    }

    #[test]
    fn test_lists_compare_joined_form() {
        let p = Predicate::new(&schema(), "path", vec!["a", "b"].into()).unwrap();
        assert_eq!(
            p.condition(),
            Condition::Eq("path".into(), Value::Text("a/b".into()))
        );
        let p = Predicate::new(
            &schema(),
            "watchers",
            vec![LogicalId(3), LogicalId(9)].into(),
        )
        .unwrap();
        assert_eq!(
            p.condition(),
            Condition::Eq("watchers".into(), Value::Text("3,9".into()))
        );
    }

    #[test]
    fn test_tags_use_full_text_and_are_approximate() {
        let p = Predicate::new(&schema(), "labels", "ui urgent".into()).unwrap();
        assert_eq!(
            p.condition(),
            Condition::FullText("labels".into(), vec!["ui".into(), "urgent".into()])
        );
        assert!(p.is_approximate());
    }

    #[test]
    fn test_aliased_column_is_used() {
        let p = Predicate::new(&schema(), "kind", "bug".into()).unwrap();
        assert_eq!(
            p.condition(),
            Condition::Eq("ticket_kind".into(), Value::Text("bug".into()))
        );
    }

    #[test]
    fn test_type_mismatch_is_invalid_argument() {
        let err = Predicate::new(&schema(), "open", "yes".into()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        let err = Predicate::new(&schema(), "missing", true.into()).unwrap_err();
        assert!(matches!(err, StoreError::UnknownField { .. }));
    }

    #[test]
    fn test_conjunction_is_flat() {
        let s = schema();
        let predicates = vec![
            Predicate::new(&s, "open", true.into()).unwrap(),
            Predicate::new(&s, "title", "crash".into()).unwrap(),
        ];
        match conjunction(&predicates) {
            Condition::And(parts) => assert_eq!(parts.len(), 2),
            other => panic!("expected And, got {:?}", other),
        }
        assert_eq!(conjunction(&[]), Condition::Always);
    }
}
