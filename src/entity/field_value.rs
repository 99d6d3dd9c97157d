use crate::core::{LogicalId, Result, StoreError, Value};
use crate::schema::{FieldDef, FieldDefault, FieldKind, TextRule, REFERENCE_LIST_SEPARATOR, TAG_SEPARATOR};
use std::fmt;

/// Typed value of a user field.
///
/// `List` serves both text-lists and tag-sets; the field's declaration
/// decides how it is joined for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Text(String),
    List(Vec<String>),
    Ref(Option<LogicalId>),
    RefList(Vec<LogicalId>),
}

impl FieldValue {
    /// The "no value" form for a field kind.
    pub fn empty_for(kind: &FieldKind) -> Self {
        match kind {
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::Text { .. } => FieldValue::Text(String::new()),
            FieldKind::TextList { .. } | FieldKind::TagSet => FieldValue::List(Vec::new()),
            FieldKind::Reference { .. } => FieldValue::Ref(None),
            FieldKind::ReferenceList { .. } => FieldValue::RefList(Vec::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Bool(_) => false,
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::List(v) => v.is_empty(),
            FieldValue::Ref(r) => r.is_none(),
            FieldValue::RefList(v) => v.is_empty(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<Option<LogicalId>> {
        match self {
            FieldValue::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_reference_list(&self) -> Option<&[LogicalId]> {
        match self {
            FieldValue::RefList(v) => Some(v),
            _ => None,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "bool",
            FieldValue::Text(_) => "text",
            FieldValue::List(_) => "list",
            FieldValue::Ref(_) => "reference",
            FieldValue::RefList(_) => "reference list",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::List(v) => write!(f, "[{}]", v.join(", ")),
            FieldValue::Ref(Some(id)) => write!(f, "->{}", id),
            FieldValue::Ref(None) => write!(f, "->nil"),
            FieldValue::RefList(v) => {
                let ids: Vec<String> = v.iter().map(|id| id.to_string()).collect();
                write!(f, "->[{}]", ids.join(", "))
            }
        }
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        FieldValue::List(v)
    }
}

impl From<Vec<&str>> for FieldValue {
    fn from(v: Vec<&str>) -> Self {
        FieldValue::List(v.into_iter().map(String::from).collect())
    }
}

impl From<LogicalId> for FieldValue {
    fn from(id: LogicalId) -> Self {
        FieldValue::Ref(Some(id))
    }
}

impl From<Option<LogicalId>> for FieldValue {
    fn from(id: Option<LogicalId>) -> Self {
        FieldValue::Ref(id)
    }
}

impl From<Vec<LogicalId>> for FieldValue {
    fn from(ids: Vec<LogicalId>) -> Self {
        FieldValue::RefList(ids)
    }
}

impl From<FieldDefault> for FieldValue {
    fn from(default: FieldDefault) -> Self {
        match default {
            FieldDefault::Bool(b) => FieldValue::Bool(b),
            FieldDefault::Text(s) => FieldValue::Text(s),
            FieldDefault::List(v) => FieldValue::List(v),
        }
    }
}

/// Validate `value` against `def` and return its canonical stored form.
pub(crate) fn coerce(def: &FieldDef, entity: &str, value: FieldValue) -> Result<FieldValue> {
    let invalid = |msg: String| Err(StoreError::validation(entity, def.name(), msg));
    let check_empty = || -> Result<()> {
        if def.is_empty_allowed() {
            Ok(())
        } else {
            Err(StoreError::validation(entity, def.name(), "cannot be empty"))
        }
    };

    match def.kind() {
        FieldKind::Bool => match value {
            FieldValue::Bool(b) => Ok(FieldValue::Bool(b)),
            other => invalid(format!("boolean field accepts only bool, not {}", other.variant_name())),
        },

        FieldKind::Text { rule } => {
            let raw = match value {
                FieldValue::Text(raw) => raw,
                other => {
                    return invalid(format!("text field accepts only text, not {}", other.variant_name()));
                }
            };
            if raw.is_empty() {
                check_empty()?;
                return Ok(FieldValue::Text(String::new()));
            }
            let normalized = def.normalize(&raw);
            match rule {
                TextRule::Selector(options) => {
                    if !options.iter().any(|o| *o == normalized) {
                        return invalid(format!("value '{}' not included in selector", normalized));
                    }
                }
                TextRule::MaxLength(max) => {
                    if normalized.chars().count() > *max {
                        return invalid("length limit overrun".into());
                    }
                }
                TextRule::Predicate(check) => {
                    if !check(&normalized) {
                        return invalid("validator rejected value".into());
                    }
                }
            }
            Ok(FieldValue::Text(normalized))
        }

        FieldKind::TextList { separator, max_length } => {
            let items = match value {
                FieldValue::List(items) => items,
                FieldValue::Text(s) if s.is_empty() => Vec::new(),
                FieldValue::Text(s) => s.split(separator.as_str()).map(String::from).collect(),
                other => {
                    return invalid(format!("text-list accepts list or text, not {}", other.variant_name()));
                }
            };
            if items.is_empty() {
                check_empty()?;
                return Ok(FieldValue::List(Vec::new()));
            }
            if items.join(separator.as_str()).chars().count() > *max_length {
                return invalid("value too long".into());
            }
            Ok(FieldValue::List(items))
        }

        FieldKind::TagSet => {
            let tags = match value {
                FieldValue::List(items) => items,
                FieldValue::Text(s) => s.split_whitespace().map(String::from).collect(),
                other => {
                    return invalid(format!("tag-set accepts list or text, not {}", other.variant_name()));
                }
            };
            if tags.is_empty() {
                check_empty()?;
                return Ok(FieldValue::List(Vec::new()));
            }
            if let Some(bad) = tags.iter().find(|t| t.is_empty() || t.chars().any(char::is_whitespace)) {
                return invalid(format!("tag '{}' must be a single non-empty token", bad));
            }
            Ok(FieldValue::List(tags))
        }

        FieldKind::Reference { .. } => match value {
            FieldValue::Ref(None) => {
                check_empty()?;
                Ok(FieldValue::Ref(None))
            }
            FieldValue::Ref(Some(id)) => Ok(FieldValue::Ref(Some(id))),
            other => invalid(format!("reference accepts a logical id, not {}", other.variant_name())),
        },

        FieldKind::ReferenceList { .. } => {
            let ids = match value {
                FieldValue::RefList(ids) => ids,
                FieldValue::Ref(Some(id)) => vec![id],
                FieldValue::Ref(None) => Vec::new(),
                other => {
                    return invalid(format!("reference list accepts logical ids, not {}", other.variant_name()));
                }
            };
            if ids.is_empty() {
                check_empty()?;
            }
            Ok(FieldValue::RefList(ids))
        }
    }
}

/// Encode a canonical field value for storage.
pub(crate) fn encode(def: &FieldDef, value: &FieldValue) -> Value {
    match (def.kind(), value) {
        (_, FieldValue::Bool(b)) => Value::Boolean(*b),
        (_, FieldValue::Text(s)) => Value::Text(s.clone()),
        (FieldKind::TextList { separator, .. }, FieldValue::List(items)) => {
            Value::Text(items.join(separator.as_str()))
        }
        (_, FieldValue::List(items)) => Value::Text(items.join(TAG_SEPARATOR)),
        (_, FieldValue::Ref(Some(id))) => Value::Integer(id.0),
        (_, FieldValue::Ref(None)) => Value::Null,
        (_, FieldValue::RefList(ids)) => Value::Text(join_ids(ids)),
    }
}

pub(crate) fn join_ids(ids: &[LogicalId]) -> String {
    ids.iter()
        .map(|id| id.0.to_string())
        .collect::<Vec<_>>()
        .join(REFERENCE_LIST_SEPARATOR)
}

/// Decode a stored value back into its typed form.
pub(crate) fn decode(def: &FieldDef, entity: &str, raw: &Value) -> Result<FieldValue> {
    let corrupt = || {
        StoreError::Driver(format!(
            "invalid stored value {} for {}.{} ({})",
            raw,
            entity,
            def.name(),
            def.kind().type_tag()
        ))
    };

    match def.kind() {
        FieldKind::Bool => raw.as_bool().map(FieldValue::Bool).ok_or_else(corrupt),
        FieldKind::Text { .. } => match raw {
            Value::Null => Ok(FieldValue::Text(String::new())),
            Value::Text(s) => Ok(FieldValue::Text(s.clone())),
            _ => Err(corrupt()),
        },
        FieldKind::TextList { separator, .. } => match raw {
            v if v.is_null_or_empty() => Ok(FieldValue::List(Vec::new())),
            Value::Text(s) => Ok(FieldValue::List(
                s.split(separator.as_str()).map(String::from).collect(),
            )),
            _ => Err(corrupt()),
        },
        FieldKind::TagSet => match raw {
            Value::Null => Ok(FieldValue::List(Vec::new())),
            Value::Text(s) => Ok(FieldValue::List(
                s.split_whitespace().map(String::from).collect(),
            )),
            _ => Err(corrupt()),
        },
        FieldKind::Reference { .. } => match raw {
            v if v.is_null_or_empty() => Ok(FieldValue::Ref(None)),
            v => v
                .as_i64()
                .map(|id| FieldValue::Ref(Some(LogicalId(id))))
                .ok_or_else(corrupt),
        },
        FieldKind::ReferenceList { .. } => match raw {
            v if v.is_null_or_empty() => Ok(FieldValue::RefList(Vec::new())),
            Value::Text(s) => s
                .split(REFERENCE_LIST_SEPARATOR)
                .map(|part| part.trim().parse::<i64>().map(LogicalId))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(FieldValue::RefList)
                .map_err(|_| corrupt()),
            _ => Err(corrupt()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;

    #[test]
    fn test_text_length_counts_characters() {
        let def = FieldDef::text_max("title", 4);
        assert!(coerce(&def, "T", "日本語です".into()).is_err());
        assert_eq!(
            coerce(&def, "T", "日本語で".into()).unwrap(),
            FieldValue::Text("日本語で".into())
        );
    }

    #[test]
    fn test_text_normalizer_runs_before_selector() {
        let def = FieldDef::selector("status", ["OPEN", "CLOSED"]).normalizer(|s| s.to_uppercase());
        assert_eq!(coerce(&def, "T", "open".into()).unwrap(), FieldValue::Text("OPEN".into()));
        assert!(coerce(&def, "T", "gone".into()).is_err());
    }

    #[test]
    fn test_text_predicate_rule() {
        let def = FieldDef::text("code", TextRule::Predicate(std::sync::Arc::new(|s: &str| {
            s.chars().all(|c| c.is_ascii_digit())
        })));
        assert!(coerce(&def, "T", "1234".into()).is_ok());
        assert!(coerce(&def, "T", "12a4".into()).is_err());
    }

    #[test]
    fn test_empty_requires_empty_allowed() {
        let strict = FieldDef::text_max("title", 10);
        let err = coerce(&strict, "Ticket", "".into()).unwrap_err();
        assert!(matches!(err, StoreError::Validation { ref field, .. } if field == "title"));

        let loose = FieldDef::text_max("title", 10).empty_allowed();
        assert_eq!(coerce(&loose, "Ticket", "".into()).unwrap(), FieldValue::Text(String::new()));

        let refs = FieldDef::reference_list("watchers", "Member");
        assert!(coerce(&refs, "Ticket", FieldValue::RefList(vec![])).is_err());
    }

    #[test]
    fn test_text_list_accepts_joined_text() {
        let def = FieldDef::text_list("labels", "\t", 16);
        assert_eq!(
            coerce(&def, "T", "a\tb".into()).unwrap(),
            FieldValue::List(vec!["a".into(), "b".into()])
        );
        let too_long = vec!["0123456789", "0123456789"];
        assert!(coerce(&def, "T", too_long.into()).is_err());
    }

    #[test]
    fn test_tag_tokens_must_be_single_words() {
        let def = FieldDef::tag_set("tags");
        assert!(coerce(&def, "T", vec!["ok", "not ok"].into()).is_err());
        assert_eq!(
            coerce(&def, "T", "rust  db".into()).unwrap(),
            FieldValue::List(vec!["rust".into(), "db".into()])
        );
    }

    #[test]
    fn test_wrong_variant_rejected() {
        let def = FieldDef::boolean("open", true);
        assert!(coerce(&def, "T", "true".into()).is_err());
        let def = FieldDef::reference("project", "Project");
        assert!(coerce(&def, "T", "12".into()).is_err());
    }

    #[test]
    fn test_storage_encoding() {
        let labels = FieldDef::text_list("labels", ",", 64);
        let value = FieldValue::List(vec!["x".into(), "y".into()]);
        assert_eq!(encode(&labels, &value), Value::Text("x,y".into()));
        assert_eq!(decode(&labels, "T", &Value::Text("x,y".into())).unwrap(), value);
        assert_eq!(decode(&labels, "T", &Value::Null).unwrap(), FieldValue::List(vec![]));

        let tags = FieldDef::tag_set("tags");
        assert_eq!(encode(&tags, &value), Value::Text("x y".into()));

        let watchers = FieldDef::reference_list("watchers", "Member");
        let ids = FieldValue::RefList(vec![LogicalId(3), LogicalId(9)]);
        assert_eq!(encode(&watchers, &ids), Value::Text("3,9".into()));
        assert_eq!(decode(&watchers, "T", &Value::Text("3,9".into())).unwrap(), ids);

        let project = FieldDef::reference("project", "Project");
        assert_eq!(encode(&project, &FieldValue::Ref(None)), Value::Null);
        assert_eq!(
            decode(&project, "T", &Value::Integer(5)).unwrap(),
            FieldValue::Ref(Some(LogicalId(5)))
        );
    }

    #[test]
    fn test_corrupt_stored_value() {
        let flag = FieldDef::boolean("open", true);
        assert!(matches!(
            decode(&flag, "T", &Value::Text("maybe".into())),
            Err(StoreError::Driver(_))
        ));
    }
}
