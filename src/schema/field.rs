// ============================================================================
// Field Declarations
// ============================================================================
//
// A field is a named, typed slot on an entity type together with the rule
// that validates values written into it. Declarations are checked once, when
// the owning `EntitySchema` is built; a bad declaration is a configuration
// error, never a runtime surprise.
//
// ============================================================================

use crate::core::{Result, StoreError};
use std::fmt;
use std::sync::Arc;

pub type Normalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;
pub type TextPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Separator used to store tag sets; matches full-text index tokenization.
pub const TAG_SEPARATOR: &str = " ";
/// Separator used to store reference lists.
pub const REFERENCE_LIST_SEPARATOR: &str = ",";

/// The single validation rule of a text field.
#[derive(Clone)]
pub enum TextRule {
    /// Value must be one of the listed options.
    Selector(Vec<String>),
    /// Value must be at most this many characters.
    MaxLength(usize),
    /// Value must satisfy a caller-supplied predicate.
    Predicate(TextPredicate),
}

impl fmt::Debug for TextRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector(options) => f.debug_tuple("Selector").field(options).finish(),
            Self::MaxLength(len) => f.debug_tuple("MaxLength").field(len).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Type tag of a field plus its type-specific settings.
#[derive(Clone, Debug)]
pub enum FieldKind {
    Bool,
    Text { rule: TextRule },
    TextList { separator: String, max_length: usize },
    TagSet,
    Reference { target: String },
    ReferenceList { target: String },
}

impl FieldKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Bool => "boolean",
            Self::Text { .. } => "text",
            Self::TextList { .. } => "text-list",
            Self::TagSet => "tag-set",
            Self::Reference { .. } => "reference",
            Self::ReferenceList { .. } => "reference-list",
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. } | Self::ReferenceList { .. })
    }

    /// Target entity type for reference kinds.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Reference { target } | Self::ReferenceList { target } => Some(target),
            _ => None,
        }
    }
}

/// Default applied to a freshly constructed entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    Bool(bool),
    Text(String),
    List(Vec<String>),
}

/// Declaration of one user field.
#[derive(Clone)]
pub struct FieldDef {
    pub(crate) name: String,
    pub(crate) column: String,
    pub(crate) kind: FieldKind,
    pub(crate) empty_allowed: bool,
    pub(crate) default: Option<FieldDefault>,
    pub(crate) normalizer: Option<Normalizer>,
    pub(crate) strict: bool,
    pub(crate) manual: bool,
    pub(crate) description: Option<String>,
}

impl fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("kind", &self.kind)
            .field("empty_allowed", &self.empty_allowed)
            .field("default", &self.default)
            .field("strict", &self.strict)
            .field("manual", &self.manual)
            .finish()
    }
}

impl FieldDef {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            empty_allowed: false,
            default: None,
            normalizer: None,
            strict: false,
            manual: false,
            description: None,
        }
    }

    /// Boolean field. Booleans always carry a default.
    pub fn boolean(name: impl Into<String>, default: bool) -> Self {
        let mut def = Self::new(name, FieldKind::Bool);
        def.default = Some(FieldDefault::Bool(default));
        def
    }

    pub fn text(name: impl Into<String>, rule: TextRule) -> Self {
        Self::new(name, FieldKind::Text { rule })
    }

    /// Text field limited to `max_length` characters.
    pub fn text_max(name: impl Into<String>, max_length: usize) -> Self {
        Self::text(name, TextRule::MaxLength(max_length))
    }

    /// Text field restricted to an enumerated set of options.
    pub fn selector<I, S>(name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::text(
            name,
            TextRule::Selector(options.into_iter().map(Into::into).collect()),
        )
    }

    pub fn text_list(
        name: impl Into<String>,
        separator: impl Into<String>,
        max_length: usize,
    ) -> Self {
        Self::new(
            name,
            FieldKind::TextList {
                separator: separator.into(),
                max_length,
            },
        )
    }

    pub fn tag_set(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::TagSet)
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::Reference {
                target: target.into(),
            },
        )
    }

    pub fn reference_list(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ReferenceList {
                target: target.into(),
            },
        )
    }

    /// Store the field under a different column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn empty_allowed(mut self) -> Self {
        self.empty_allowed = true;
        self
    }

    pub fn default_text(mut self, value: impl Into<String>) -> Self {
        self.default = Some(FieldDefault::Text(value.into()));
        self
    }

    pub fn default_list<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default = Some(FieldDefault::List(
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn normalizer<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.normalizer = Some(Arc::new(f));
        self
    }

    /// Referenced ids must resolve to an existing entity when written.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Exclude the field from automatic back-reference maintenance.
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_column(&self) -> &str {
        &self.column
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_empty_allowed(&self) -> bool {
        self.empty_allowed
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn default_value(&self) -> Option<&FieldDefault> {
        self.default.as_ref()
    }

    /// Apply the normalizer, if any.
    pub fn normalize(&self, raw: &str) -> String {
        match &self.normalizer {
            Some(f) => f(raw),
            None => raw.to_string(),
        }
    }

    /// Check option combinations for this kind.
    pub(crate) fn check_declaration(&self, entity: &str) -> Result<()> {
        let fail = |msg: String| {
            Err(StoreError::Configuration(format!(
                "{}.{}: {}",
                entity, self.name, msg
            )))
        };

        if self.column.is_empty() {
            return fail("storage column cannot be empty".into());
        }
        if self.normalizer.is_some() && !matches!(self.kind, FieldKind::Text { .. }) {
            return fail(format!("normalizer not allowed on {} field", self.kind.type_tag()));
        }
        if (self.strict || self.manual) && !self.kind.is_reference() {
            return fail(format!(
                "strict/manual only valid on reference fields, not {}",
                self.kind.type_tag()
            ));
        }

        match &self.kind {
            FieldKind::Bool => {
                if self.empty_allowed {
                    return fail("boolean field cannot be empty-allowed".into());
                }
                if !matches!(self.default, Some(FieldDefault::Bool(_))) {
                    return fail("boolean field requires a boolean default".into());
                }
            }
            FieldKind::Text { rule } => {
                match rule {
                    TextRule::Selector(options) if options.is_empty() => {
                        return fail("selector needs one or more options".into());
                    }
                    TextRule::MaxLength(0) => {
                        return fail("length needs an integer larger than zero".into());
                    }
                    _ => {}
                }
                if matches!(self.default, Some(FieldDefault::Bool(_)) | Some(FieldDefault::List(_))) {
                    return fail("text field default must be text".into());
                }
            }
            FieldKind::TextList { separator, max_length } => {
                if separator.is_empty() {
                    return fail("separator needs one or more characters".into());
                }
                if *max_length == 0 {
                    return fail("length needs an integer larger than zero".into());
                }
                if matches!(self.default, Some(FieldDefault::Bool(_))) {
                    return fail("text-list default must be a list or text".into());
                }
            }
            FieldKind::TagSet => {
                if matches!(self.default, Some(FieldDefault::Bool(_))) {
                    return fail("tag-set default must be a list or text".into());
                }
            }
            FieldKind::Reference { target } | FieldKind::ReferenceList { target } => {
                if target.is_empty() {
                    return fail("reference field requires a target entity type".into());
                }
                if self.default.is_some() {
                    return fail("reference fields do not take defaults".into());
                }
            }
        }
        Ok(())
    }
}
