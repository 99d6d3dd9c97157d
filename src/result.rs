use crate::core::Value;
use std::collections::HashMap;

pub type Row = Vec<Value>;

/// Column-keyed view of one result row.
pub type Record = HashMap<String, Value>;

/// Rows returned by a driver for one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            affected_rows: 0,
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            affected_rows: count,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at `row` for column `name`, if both exist.
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.column_index(name)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// First column of the first row; used for `COUNT(*)` style results.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }

    pub fn into_records(self) -> Vec<Record> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_keyed_by_column() {
        let result = QueryResult::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Integer(1), Value::Text("alpha".into())],
                vec![Value::Integer(2), Value::Text("beta".into())],
            ],
        );
        assert_eq!(result.get(1, "name"), Some(&Value::Text("beta".into())));
        assert_eq!(result.get(0, "missing"), None);

        let records = result.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], Value::Integer(1));
    }

    #[test]
    fn test_scalar() {
        let result = QueryResult::new(vec!["count".into()], vec![vec![Value::Integer(3)]]);
        assert_eq!(result.scalar(), Some(&Value::Integer(3)));
        assert!(QueryResult::empty().scalar().is_none());
    }
}
