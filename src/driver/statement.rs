// ============================================================================
// Structured Statements
// ============================================================================
//
// The core never builds SQL strings by hand. It issues one of a handful of
// statement shapes, which a SQL driver renders with `to_sql()` and the
// in-memory backend evaluates directly.
//
// ============================================================================

use crate::core::Value;

/// Row filter of a `SELECT` or `UPDATE`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always,
    Eq(String, Value),
    /// Column is NULL or the empty string.
    NullOrEmpty(String),
    /// Full-text containment of every token (boolean-mode `+tok` AND search).
    FullText(String, Vec<String>),
    AtMost(String, Value),
    AtLeast(String, Value),
    In(String, Vec<Value>),
    And(Vec<Condition>),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    /// Conjunction that keeps the tree flat.
    pub fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::Always, c) | (c, Condition::Always) => c,
            (Condition::And(mut left), Condition::And(right)) => {
                left.extend(right);
                Condition::And(left)
            }
            (Condition::And(mut left), c) => {
                left.push(c);
                Condition::And(left)
            }
            (c, Condition::And(mut right)) => {
                right.insert(0, c);
                Condition::And(right)
            }
            (a, b) => Condition::And(vec![a, b]),
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Condition::Always => sql.push_str("1 = 1"),
            Condition::Eq(column, value) => {
                sql.push_str(&format!("{} = ?", quote(column)));
                params.push(value.clone());
            }
            Condition::NullOrEmpty(column) => {
                let c = quote(column);
                sql.push_str(&format!("({} IS NULL OR {} = '')", c, c));
            }
            Condition::FullText(column, tokens) => {
                // Each token is a required quoted phrase, so boolean-mode
                // operators inside a tag stay literal. Tokens with nothing
                // searchable in them cannot narrow the match.
                let search: Vec<String> = tokens
                    .iter()
                    .map(|t| t.replace('"', " "))
                    .filter(|t| t.chars().any(char::is_alphanumeric))
                    .map(|t| format!("+\"{}\"", t.trim()))
                    .collect();
                if search.is_empty() {
                    sql.push_str("1 = 1");
                    return;
                }
                sql.push_str(&format!("MATCH({}) AGAINST(? IN BOOLEAN MODE)", quote(column)));
                params.push(Value::Text(search.join(" ")));
            }
            Condition::AtMost(column, value) => {
                sql.push_str(&format!("{} <= ?", quote(column)));
                params.push(value.clone());
            }
            Condition::AtLeast(column, value) => {
                sql.push_str(&format!("{} >= ?", quote(column)));
                params.push(value.clone());
            }
            Condition::In(_, values) if values.is_empty() => sql.push_str("1 = 0"),
            Condition::In(column, values) => {
                let marks = vec!["?"; values.len()].join(", ");
                sql.push_str(&format!("{} IN ({})", quote(column), marks));
                params.extend(values.iter().cloned());
            }
            Condition::And(parts) if parts.is_empty() => sql.push_str("1 = 1"),
            Condition::And(parts) => {
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" AND ");
                    }
                    part.render(sql, params);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Columns(Vec<String>),
    Count,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub projection: Projection,
    pub condition: Condition,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub for_update: bool,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            projection: Projection::Columns(Vec::new()),
            condition: Condition::Always,
            order_by: Vec::new(),
            limit: None,
            for_update: false,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Projection::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn count(mut self) -> Self {
        self.projection = Projection::Count;
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.condition = std::mem::replace(&mut self.condition, Condition::Always).and(condition);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn for_update(mut self, lock: bool) -> Self {
        self.for_update = lock;
        self
    }
}

/// Every statement shape the store issues.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert {
        table: String,
        values: Vec<(String, Value)>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Value)>,
        condition: Condition,
    },
    /// Bump the single-row counter table; the new value is read back with
    /// `Driver::last_insert_id`.
    AllocateId { table: String },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Select(select) => &select.table,
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::AllocateId { table } => table,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select(_))
    }

    /// Render MySQL-dialect SQL with `?` placeholders.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut params = Vec::new();

        match self {
            Statement::Select(select) => {
                sql.push_str("SELECT ");
                match &select.projection {
                    Projection::Count => sql.push_str("COUNT(*)"),
                    Projection::Columns(columns) if columns.is_empty() => sql.push('*'),
                    Projection::Columns(columns) => {
                        let list: Vec<String> = columns.iter().map(|c| quote(c)).collect();
                        sql.push_str(&list.join(", "));
                    }
                }
                sql.push_str(&format!(" FROM {}", quote(&select.table)));
                if select.condition != Condition::Always {
                    sql.push_str(" WHERE ");
                    select.condition.render(&mut sql, &mut params);
                }
                if !select.order_by.is_empty() {
                    let order: Vec<String> = select
                        .order_by
                        .iter()
                        .map(|o| format!("{}{}", quote(&o.column), if o.descending { " DESC" } else { "" }))
                        .collect();
                    sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
                }
                if let Some(limit) = select.limit {
                    sql.push_str(&format!(" LIMIT {}", limit));
                }
                if select.for_update {
                    sql.push_str(" FOR UPDATE");
                }
            }
            Statement::Insert { table, values } => {
                let columns: Vec<String> = values.iter().map(|(c, _)| quote(c)).collect();
                let marks = vec!["?"; values.len()].join(", ");
                sql.push_str(&format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote(table),
                    columns.join(", "),
                    marks
                ));
                params.extend(values.iter().map(|(_, v)| v.clone()));
            }
            Statement::Update {
                table,
                assignments,
                condition,
            } => {
                let sets: Vec<String> = assignments.iter().map(|(c, _)| format!("{} = ?", quote(c))).collect();
                params.extend(assignments.iter().map(|(_, v)| v.clone()));
                sql.push_str(&format!("UPDATE {} SET {} WHERE ", quote(table), sets.join(", ")));
                condition.render(&mut sql, &mut params);
            }
            Statement::AllocateId { table } => {
                sql.push_str(&format!("UPDATE {} SET id = LAST_INSERT_ID(id + 1)", quote(table)));
            }
        }

        (sql, params)
    }
}

fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}
