// ============================================================================
// In-Memory Backend
// ============================================================================
//
// Reference implementation of the storage boundary. Tables are vectors of
// column maps with an auto-increment `id` and a `created_at` stamped from a
// `Clock`.
//
// Transactions are serialized: `begin` claims a process-wide gate which is
// held until commit or rollback, and statements outside a transaction wait
// for the gate to be free. A locking read therefore always sees the latest
// committed row. Each transaction keeps an undo log (the same command shape
// as a change journal) that rollback replays in reverse.
//
// Full-text conditions tokenize on non-alphanumeric characters and compare
// case-insensitively, like a relational full-text index would. Callers that
// need exact membership must re-check.
//
// ============================================================================

use super::clock::{Clock, SystemClock};
use super::statement::{Condition, Projection, Select, Statement};
use super::{Connector, Driver};
use crate::connection::config::ConnectionConfig;
use crate::core::{Result, StoreError, Value};
use crate::result::{QueryResult, Record};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{Level, event};

type StoredRow = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

#[derive(Debug, Default)]
struct Table {
    rows: Vec<StoredRow>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct DatabaseState {
    tables: HashMap<String, Table>,
    counters: HashMap<String, i64>,
}

/// One reversible write recorded inside a transaction.
#[derive(Debug)]
enum Undo {
    Inserted { table: String, id: i64 },
    Updated { table: String, id: i64, previous: StoredRow },
    Counter { table: String, previous: i64 },
}

struct Shared {
    state: Mutex<DatabaseState>,
    /// Connection id currently inside a transaction.
    gate: Mutex<Option<u64>>,
    gate_released: Condvar,
    clock: Arc<dyn Clock>,
    next_connection: AtomicU64,
}

/// Shared in-memory database; every connection opened from it sees the same
/// tables.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DatabaseState::default()),
                gate: Mutex::new(None),
                gate_released: Condvar::new(),
                clock,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn create_table(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        if state.tables.contains_key(name) {
            return Err(StoreError::Driver(format!("table '{}' already exists", name)));
        }
        state.tables.insert(name.to_string(), Table::default());
        Ok(())
    }

    /// Create a single-row id counter starting at `start`.
    pub fn create_counter(&self, name: &str, start: i64) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        if state.counters.contains_key(name) {
            return Err(StoreError::Driver(format!("counter '{}' already exists", name)));
        }
        state.counters.insert(name.to_string(), start);
        Ok(())
    }

    /// Snapshot of every row in `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Result<Vec<Record>> {
        let state = self.shared.state.lock()?;
        let table = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::Driver(format!("table '{}' not found", table)))?;
        Ok(table
            .rows
            .iter()
            .map(|row| row.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .collect())
    }

    pub fn open(&self) -> MemoryConnection {
        let id = self
            .shared
            .next_connection
            .fetch_add(1, AtomicOrdering::SeqCst);
        event!(Level::TRACE, connection = id, "memory connection opened");
        MemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            in_transaction: false,
            undo: Vec::new(),
            last_insert_id: 0,
            closed: false,
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryDatabase {
    fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Driver>> {
        Ok(Box::new(self.open()))
    }
}

pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    in_transaction: bool,
    undo: Vec<Undo>,
    last_insert_id: i64,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Driver("connection is closed".into()));
        }
        Ok(())
    }

    /// Block until no other connection is inside a transaction.
    fn wait_for_gate(&self) -> Result<MutexGuard<'_, Option<u64>>> {
        let mut gate = self.shared.gate.lock()?;
        while matches!(*gate, Some(owner) if owner != self.id) {
            gate = self.shared.gate_released.wait(gate)?;
        }
        Ok(gate)
    }

    fn release_gate(&self) -> Result<()> {
        let mut gate = self.shared.gate.lock()?;
        if *gate == Some(self.id) {
            *gate = None;
            self.shared.gate_released.notify_all();
        }
        Ok(())
    }

    fn apply(&mut self, statement: &Statement) -> Result<QueryResult> {
        let mut state = self.shared.state.lock()?;
        match statement {
            Statement::Select(select) => run_select(&state, select),

            Statement::Insert { table, values } => {
                let now = self.shared.clock.now();
                let target = table_mut(&mut state, table)?;
                target.next_id += 1;
                let id = target.next_id;

                let mut row: StoredRow = values.iter().cloned().collect();
                row.insert("id".into(), Value::Integer(id));
                row.entry("created_at".into()).or_insert(Value::Timestamp(now));
                target.rows.push(row);

                self.last_insert_id = id;
                if self.in_transaction {
                    self.undo.push(Undo::Inserted {
                        table: table.clone(),
                        id,
                    });
                }
                Ok(QueryResult::affected(1))
            }

            Statement::Update {
                table,
                assignments,
                condition,
            } => {
                let target = table_mut(&mut state, table)?;
                let mut affected = 0;
                for row in target.rows.iter_mut() {
                    if !evaluate(condition, row)? {
                        continue;
                    }
                    let previous = row.clone();
                    for (column, value) in assignments {
                        row.insert(column.clone(), value.clone());
                    }
                    affected += 1;
                    if self.in_transaction {
                        let id = row_id(&previous)?;
                        self.undo.push(Undo::Updated {
                            table: table.clone(),
                            id,
                            previous,
                        });
                    }
                }
                Ok(QueryResult::affected(affected))
            }

            Statement::AllocateId { table } => {
                let counter = state
                    .counters
                    .get_mut(table)
                    .ok_or_else(|| StoreError::Driver(format!("counter '{}' not found", table)))?;
                let previous = *counter;
                *counter += 1;
                self.last_insert_id = *counter;
                if self.in_transaction {
                    self.undo.push(Undo::Counter {
                        table: table.clone(),
                        previous,
                    });
                }
                Ok(QueryResult::affected(1))
            }
        }
    }

    fn undo_all(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        while let Some(change) = self.undo.pop() {
            match change {
                Undo::Inserted { table, id } => {
                    let target = table_mut(&mut state, &table)?;
                    target
                        .rows
                        .retain(|row| row.get("id") != Some(&Value::Integer(id)));
                }
                Undo::Updated { table, id, previous } => {
                    let target = table_mut(&mut state, &table)?;
                    if let Some(row) = target
                        .rows
                        .iter_mut()
                        .find(|row| row.get("id") == Some(&Value::Integer(id)))
                    {
                        *row = previous;
                    }
                }
                Undo::Counter { table, previous } => {
                    state.counters.insert(table, previous);
                }
            }
        }
        Ok(())
    }
}

impl Driver for MemoryConnection {
    fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.ensure_open()?;
        event!(Level::TRACE, connection = self.id, sql = %statement.to_sql().0, "execute");
        if self.in_transaction {
            return self.apply(statement);
        }
        let shared = Arc::clone(&self.shared);
        let mut gate = shared.gate.lock()?;
        while matches!(*gate, Some(owner) if owner != self.id) {
            gate = shared.gate_released.wait(gate)?;
        }
        let result = self.apply(statement);
        drop(gate);
        result
    }

    fn last_insert_id(&self) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.last_insert_id)
    }

    fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(StoreError::Driver("transaction already active".into()));
        }
        {
            let mut gate = self.wait_for_gate()?;
            *gate = Some(self.id);
        }
        self.in_transaction = true;
        event!(Level::TRACE, connection = self.id, "memory transaction begun");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(StoreError::Driver("no active transaction".into()));
        }
        self.undo.clear();
        self.in_transaction = false;
        self.release_gate()
    }

    fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(StoreError::Driver("no active transaction".into()));
        }
        let undone = self.undo_all();
        self.in_transaction = false;
        self.release_gate()?;
        undone
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.in_transaction {
            self.rollback()?;
        }
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn table_mut<'a>(state: &'a mut DatabaseState, name: &str) -> Result<&'a mut Table> {
    state
        .tables
        .get_mut(name)
        .ok_or_else(|| StoreError::Driver(format!("table '{}' not found", name)))
}

fn row_id(row: &StoredRow) -> Result<i64> {
    row.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::Driver("row without id".into()))
}

fn run_select(state: &DatabaseState, select: &Select) -> Result<QueryResult> {
    let table = state
        .tables
        .get(&select.table)
        .ok_or_else(|| StoreError::Driver(format!("table '{}' not found", select.table)))?;

    let mut matched = Vec::new();
    for row in &table.rows {
        if evaluate(&select.condition, row)? {
            matched.push(row);
        }
    }

    if !select.order_by.is_empty() {
        matched.sort_by(|a, b| {
            for order in &select.order_by {
                let left = a.get(&order.column).unwrap_or(&NULL);
                let right = b.get(&order.column).unwrap_or(&NULL);
                let ord = left.compare(right).unwrap_or(Ordering::Equal);
                let ord = if order.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    if let Some(limit) = select.limit {
        matched.truncate(limit);
    }

    match &select.projection {
        Projection::Count => Ok(QueryResult::new(
            vec!["count".into()],
            vec![vec![Value::Integer(matched.len() as i64)]],
        )),
        Projection::Columns(columns) => {
            let columns: Vec<String> = if columns.is_empty() {
                matched
                    .first()
                    .map(|row| row.keys().cloned().collect())
                    .unwrap_or_default()
            } else {
                columns.clone()
            };
            let rows = matched
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                        .collect()
                })
                .collect();
            Ok(QueryResult::new(columns, rows))
        }
    }
}

fn evaluate(condition: &Condition, row: &StoredRow) -> Result<bool> {
    let cell = |column: &str| row.get(column).cloned().unwrap_or(Value::Null);

    Ok(match condition {
        Condition::Always => true,
        Condition::Eq(column, expected) => {
            let actual = cell(column);
            !actual.is_null() && actual.compare(expected)? == Ordering::Equal
        }
        Condition::NullOrEmpty(column) => cell(column).is_null_or_empty(),
        Condition::FullText(column, tokens) => {
            let indexed = tokenize(cell(column).as_str().unwrap_or(""));
            tokens
                .iter()
                .flat_map(|t| tokenize(t))
                .all(|t| indexed.contains(&t))
        }
        Condition::AtMost(column, bound) => {
            let actual = cell(column);
            !actual.is_null() && actual.compare(bound)? != Ordering::Greater
        }
        Condition::AtLeast(column, bound) => {
            let actual = cell(column);
            !actual.is_null() && actual.compare(bound)? != Ordering::Less
        }
        Condition::In(column, values) => {
            let actual = cell(column);
            values.iter().any(|v| *v == actual)
        }
        Condition::And(parts) => {
            for part in parts {
                if !evaluate(part, row)? {
                    return Ok(false);
                }
            }
            true
        }
    })
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
