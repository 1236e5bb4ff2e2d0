//! In-memory store used by the unit tests.
//!
//! Interprets the structured statements directly. Writes made inside a
//! transaction are journaled and only reach the shared tables on commit;
//! reads always see committed data. Temporary tables are session-local.

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use crate::database::{
    filter::{CompareOp, Filter},
    statement::{Query, QueryOrder, Statement},
    store::{BulkLoad, Connector, Session, StoreError},
    value::{Record, SqlValue},
};

pub(crate) type Row = HashMap<String, SqlValue>;

#[derive(Debug, Clone, Default)]
struct Table {
    identity: Option<String>,
    next_id: i32,
    rows: Vec<Row>,
}

impl Table {
    /// Draws the next identity for `row` when it has none. Like a sequence,
    /// drawn values are not returned on rollback.
    fn assign_identity(&mut self, row: &mut Row) {
        if let Some(identity) = &self.identity {
            let missing = row.get(identity).map_or(true, SqlValue::is_null);
            if missing {
                self.next_id += 1;
                row.insert(identity.clone(), SqlValue::Integer(self.next_id));
            }
        }
    }

    fn append(&mut self, mut row: Row) {
        self.assign_identity(&mut row);
        self.rows.push(row);
    }
}

/// Operations the store can be told to fail on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FailPoint {
    /// Any operation of this kind: a statement kind, `BEGIN`, `COMMIT`,
    /// `ROLLBACK`, `LOCK`, `COPY`, `SELECT` or `COUNT`.
    Kind(&'static str),
    /// A bulk load carrying `value` in `column`.
    LoadContaining { column: String, value: SqlValue },
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    fail_points: Vec<FailPoint>,
    log: Vec<String>,
    connections_opened: usize,
    live_temp_tables: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates `name`, generating integer values for `identity` when a row omits it.
    pub fn with_table(self, name: &str, identity: Option<&str>) -> Self {
        self.lock().tables.insert(
            name.to_string(),
            Table { identity: identity.map(str::to_string), ..Table::default() },
        );
        self
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.lock().fail_points.push(point);
    }

    pub fn seed(&self, table: &str, rows: Vec<Vec<(&str, SqlValue)>>) {
        let mut state = self.lock();
        if let Some(table) = state.tables.get_mut(table) {
            for row in rows {
                table.append(row.into_iter().map(|(c, v)| (c.to_string(), v)).collect());
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn count_in_log(&self, entry: &str) -> usize {
        self.lock().log.iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    pub fn live_temp_tables(&self) -> usize {
        self.lock().live_temp_tables
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn open(&self) -> Result<Box<dyn Session>, StoreError> {
        self.lock().connections_opened += 1;
        Ok(Box::new(MemorySession {
            store: self.clone(),
            journal: None,
            temp: HashMap::new(),
            created_in_tx: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum Change {
    Append { table: String, rows: Vec<Row> },
    Assign { table: String, assignments: Vec<(String, SqlValue)>, filter: Filter },
    MergeByKey { table: String, key: String, columns: Vec<String>, rows: Vec<Row> },
    Delete { table: String, filter: Filter },
}

struct MemorySession {
    store: MemoryStore,
    journal: Option<Vec<Change>>,
    temp: HashMap<String, Vec<Row>>,
    created_in_tx: Vec<String>,
}

impl MemorySession {
    /// Logs `kind` and fails when a matching fail point is registered.
    fn record(&self, kind: &str) -> Result<(), StoreError> {
        let mut state = self.store.lock();
        state.log.push(kind.to_string());
        if state.fail_points.iter().any(|p| matches!(p, FailPoint::Kind(k) if *k == kind)) {
            return Err(StoreError::Rejected(format!("injected failure on {kind}")));
        }
        Ok(())
    }

    fn apply(&mut self, change: Change) -> Result<(), StoreError> {
        match &mut self.journal {
            Some(journal) => {
                journal.push(change);
                Ok(())
            }
            None => apply_change(&mut self.store.lock(), change),
        }
    }

    /// Appends `values` to `table` with identities already drawn, returning the stored rows.
    fn insert_rows(
        &mut self,
        table: &str,
        columns: &[String],
        values: &[Vec<SqlValue>],
    ) -> Result<Vec<Row>, StoreError> {
        let mut rows: Vec<Row> = values
            .iter()
            .map(|values| columns.iter().cloned().zip(values.iter().cloned()).collect())
            .collect();
        {
            let mut state = self.store.lock();
            let target = state.tables.get_mut(table).ok_or_else(|| missing_table(table))?;
            rows.iter_mut().for_each(|row| target.assign_identity(row));
        }

        self.apply(Change::Append { table: table.to_string(), rows: rows.clone() })?;
        Ok(rows)
    }

    fn matching(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let state = self.store.lock();
        let table = state.tables.get(table).ok_or_else(|| missing_table(table))?;
        Ok(table.rows.iter().filter(|row| evaluate(filter, row)).count() as u64)
    }

    fn drop_temp_tables(&mut self, names: Vec<String>) {
        let mut dropped = 0;
        for name in names {
            if self.temp.remove(&name).is_some() {
                dropped += 1;
            }
        }
        self.store.lock().live_temp_tables -= dropped;
    }
}

fn missing_table(table: &str) -> StoreError {
    StoreError::Rejected(format!("relation \"{table}\" does not exist"))
}

fn apply_change(state: &mut State, change: Change) -> Result<(), StoreError> {
    match change {
        Change::Append { table, rows } => {
            let target = state.tables.get_mut(&table).ok_or_else(|| missing_table(&table))?;
            rows.into_iter().for_each(|row| target.append(row));
        }
        Change::Assign { table, assignments, filter } => {
            let target = state.tables.get_mut(&table).ok_or_else(|| missing_table(&table))?;
            for row in target.rows.iter_mut().filter(|row| evaluate(&filter, row)) {
                for (column, value) in &assignments {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Change::MergeByKey { table, key, columns, rows } => {
            let target = state.tables.get_mut(&table).ok_or_else(|| missing_table(&table))?;
            for source in rows {
                let source_key = source.get(&key).cloned().unwrap_or(SqlValue::Null);
                for row in target.rows.iter_mut().filter(|row| {
                    row.get(&key).is_some_and(|k| !k.is_null() && *k == source_key)
                }) {
                    for column in &columns {
                        row.insert(column.clone(), source.get(column).cloned().unwrap_or(SqlValue::Null));
                    }
                }
            }
        }
        Change::Delete { table, filter } => {
            let target = state.tables.get_mut(&table).ok_or_else(|| missing_table(&table))?;
            target.rows.retain(|row| !evaluate(&filter, row));
        }
    }
    Ok(())
}

fn compare(left: &SqlValue, right: &SqlValue) -> Option<Ordering> {
    match (left, right) {
        (SqlValue::Bool(a), SqlValue::Bool(b)) => a.partial_cmp(b),
        (SqlValue::SmallInt(a), SqlValue::SmallInt(b)) => a.partial_cmp(b),
        (SqlValue::Integer(a), SqlValue::Integer(b)) => a.partial_cmp(b),
        (SqlValue::BigInt(a), SqlValue::BigInt(b)) => a.partial_cmp(b),
        (SqlValue::Real(a), SqlValue::Real(b)) => a.partial_cmp(b),
        (SqlValue::Double(a), SqlValue::Double(b)) => a.partial_cmp(b),
        (SqlValue::Decimal(a), SqlValue::Decimal(b)) => a.partial_cmp(b),
        (SqlValue::Text(a), SqlValue::Text(b)) => a.partial_cmp(b),
        (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => a.partial_cmp(b),
        (SqlValue::TimestampTz(a), SqlValue::TimestampTz(b)) => a.partial_cmp(b),
        (SqlValue::Date(a), SqlValue::Date(b)) => a.partial_cmp(b),
        (SqlValue::Time(a), SqlValue::Time(b)) => a.partial_cmp(b),
        _ => None,
    }
}

/// `LIKE` with `%` wildcards only.
fn like(text: &str, pattern: &str) -> bool {
    match pattern.split_once('%') {
        None => text == pattern,
        Some((prefix, rest)) => {
            let Some(remaining) = text.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            remaining.char_indices().map(|(i, _)| i).chain([remaining.len()]).any(|i| like(&remaining[i..], rest))
        }
    }
}

fn evaluate(filter: &Filter, row: &Row) -> bool {
    let value_of = |column: &str| row.get(column).cloned().unwrap_or(SqlValue::Null);

    match filter {
        Filter::Compare { column, op, value } => {
            let current = value_of(column);
            if let (CompareOp::Like, SqlValue::Text(text), SqlValue::Text(pattern)) = (op, &current, value) {
                return like(text, pattern);
            }
            match compare(&current, value) {
                Some(ordering) => match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Ge => ordering != Ordering::Less,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Le => ordering != Ordering::Greater,
                    CompareOp::Like => false,
                },
                None => false,
            }
        }
        Filter::IsNull(column) => value_of(column).is_null(),
        Filter::IsNotNull(column) => !value_of(column).is_null(),
        Filter::And(left, right) => evaluate(left, row) && evaluate(right, row),
        Filter::Or(left, right) => evaluate(left, row) || evaluate(right, row),
    }
}

/// Nulls sort last ascending and first descending, as in PostgreSQL.
fn order_rows(rows: &mut [Row], column: &str, order: QueryOrder) {
    rows.sort_by(|a, b| {
        let left = a.get(column).cloned().unwrap_or(SqlValue::Null);
        let right = b.get(column).cloned().unwrap_or(SqlValue::Null);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => compare(&left, &right).unwrap_or(Ordering::Equal),
        };
        match order {
            QueryOrder::Ascending => ordering,
            QueryOrder::Descending => ordering.reverse(),
        }
    });
}

#[async_trait]
impl Session for MemorySession {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.record("BEGIN")?;
        self.journal = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let journal = self.journal.take().unwrap_or_default();
        self.created_in_tx.clear();
        self.record("COMMIT")?;

        let mut state = self.store.lock();
        for change in journal {
            apply_change(&mut state, change)?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.journal = None;
        let created = std::mem::take(&mut self.created_in_tx);
        self.drop_temp_tables(created);
        self.record("ROLLBACK")
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, StoreError> {
        self.record(statement.kind())?;

        match statement {
            Statement::CreateStaging { table, .. } => {
                if self.temp.contains_key(table) {
                    return Err(StoreError::Rejected(format!("relation \"{table}\" already exists")));
                }
                self.temp.insert(table.clone(), Vec::new());
                self.store.lock().live_temp_tables += 1;
                if self.journal.is_some() {
                    self.created_in_tx.push(table.clone());
                }
                Ok(0)
            }
            Statement::Merge { target, staging, key, columns } => {
                let rows = self.temp.get(staging).cloned().ok_or_else(|| missing_table(staging))?;
                let keys: Vec<SqlValue> = rows.iter().filter_map(|r| r.get(key).cloned()).collect();
                let matched = {
                    let state = self.store.lock();
                    let table = state.tables.get(target).ok_or_else(|| missing_table(target))?;
                    table
                        .rows
                        .iter()
                        .filter(|row| row.get(key).is_some_and(|k| !k.is_null() && keys.contains(k)))
                        .count() as u64
                };
                self.apply(Change::MergeByKey {
                    table: target.clone(),
                    key: key.clone(),
                    columns: columns.clone(),
                    rows,
                })?;
                Ok(matched)
            }
            Statement::DropTable { table } => {
                if !self.temp.contains_key(table) {
                    return Err(missing_table(table));
                }
                self.created_in_tx.retain(|t| t != table);
                self.drop_temp_tables(vec![table.clone()]);
                Ok(0)
            }
            Statement::Insert { table, columns, rows, .. } => {
                Ok(self.insert_rows(table, columns, rows)?.len() as u64)
            }
            Statement::Update { table, assignments, filter } => {
                let affected = self.matching(table, filter)?;
                self.apply(Change::Assign {
                    table: table.clone(),
                    assignments: assignments.clone(),
                    filter: filter.clone(),
                })?;
                Ok(affected)
            }
            Statement::Delete { table, filter } => {
                let affected = self.matching(table, filter)?;
                self.apply(Change::Delete { table: table.clone(), filter: filter.clone() })?;
                Ok(affected)
            }
        }
    }

    async fn insert_returning(&mut self, statement: &Statement) -> Result<Vec<SqlValue>, StoreError> {
        self.record(statement.kind())?;

        match statement {
            Statement::Insert { table, columns, rows, returning: Some(column) } => Ok(self
                .insert_rows(table, columns, rows)?
                .iter()
                .map(|row| row.get(column).cloned().unwrap_or(SqlValue::Null))
                .collect()),
            other => {
                Err(StoreError::Rejected(format!("{} statement returns no rows", other.kind())))
            }
        }
    }

    async fn bulk_load(&mut self, load: BulkLoad<'_>) -> Result<u64, StoreError> {
        if load.buffer.is_empty() {
            return Ok(0);
        }
        if load.table_lock {
            self.record("LOCK")?;
        }

        let names = load.buffer.column_names();
        let batch_size = load.batch_size.unwrap_or(load.buffer.len()).max(1);
        let mut written = 0;

        for batch in load.buffer.rows.chunks(batch_size) {
            self.record("COPY")?;

            let poisoned = self.store.lock().fail_points.iter().any(|point| match point {
                FailPoint::LoadContaining { column, value } => names
                    .iter()
                    .position(|name| name == column)
                    .is_some_and(|i| batch.iter().any(|row| row[i] == *value)),
                FailPoint::Kind(_) => false,
            });
            if poisoned {
                return Err(StoreError::Rejected("injected failure while copying rows".to_string()));
            }

            let rows: Vec<Row> = batch
                .iter()
                .map(|values| names.iter().map(|n| n.to_string()).zip(values.iter().cloned()).collect())
                .collect();
            written += rows.len() as u64;

            match self.temp.get_mut(load.table) {
                Some(temp) => temp.extend(rows),
                None => self.apply(Change::Append { table: load.table.to_string(), rows })?,
            }
        }

        Ok(written)
    }

    async fn query(&mut self, query: &Query) -> Result<Vec<Record>, StoreError> {
        self.record("SELECT")?;

        let mut rows: Vec<Row> = {
            let state = self.store.lock();
            let table = state.tables.get(&query.table).ok_or_else(|| missing_table(&query.table))?;
            table
                .rows
                .iter()
                .filter(|row| query.filter.as_ref().map_or(true, |f| evaluate(f, row)))
                .cloned()
                .collect()
        };

        if let Some(order) = &query.order {
            order_rows(&mut rows, &order.column, order.order);
        }

        let offset = query.offset.unwrap_or(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        let columns: Arc<[String]> = query.columns.clone().into();

        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                let values = columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(SqlValue::Null))
                    .collect();
                Record::new(columns.clone(), values)
            })
            .collect())
    }

    async fn count(&mut self, query: &Query) -> Result<u64, StoreError> {
        self.record("COUNT")?;

        let state = self.store.lock();
        let table = state.tables.get(&query.table).ok_or_else(|| missing_table(&query.table))?;
        Ok(table
            .rows
            .iter()
            .filter(|row| query.filter.as_ref().map_or(true, |f| evaluate(f, row)))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_wildcards() {
        assert!(like("widget", "wid%"));
        assert!(like("widget", "%get"));
        assert!(like("widget", "%dg%"));
        assert!(like("widget", "widget"));
        assert!(!like("widget", "gadget%"));
    }

    #[tokio::test]
    async fn test_writes_inside_transaction_wait_for_commit() {
        let store = MemoryStore::new().with_table("items", Some("id"));
        let mut session = store.open().await.unwrap();

        session.begin().await.unwrap();
        session
            .execute(&Statement::Insert {
                table: "items".to_string(),
                columns: vec!["name".to_string()],
                rows: vec![vec![SqlValue::from("a")]],
                returning: None,
            })
            .await
            .unwrap();
        assert!(store.rows("items").is_empty());

        session.commit().await.unwrap();
        let rows = store.rows("items");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&SqlValue::Integer(1)));
    }

    #[tokio::test]
    async fn test_insert_returning_yields_drawn_identities() {
        let store = MemoryStore::new().with_table("items", Some("id"));
        let mut session = store.open().await.unwrap();
        let insert = Statement::Insert {
            table: "items".to_string(),
            columns: vec!["name".to_string()],
            rows: vec![vec![SqlValue::from("a")], vec![SqlValue::from("b")]],
            returning: Some("id".to_string()),
        };

        session.begin().await.unwrap();
        let keys = session.insert_returning(&insert).await.unwrap();
        assert_eq!(keys, vec![SqlValue::Integer(1), SqlValue::Integer(2)]);
        session.rollback().await.unwrap();

        assert!(store.rows("items").is_empty());
        let keys = session.insert_returning(&insert).await.unwrap();
        assert_eq!(keys, vec![SqlValue::Integer(3), SqlValue::Integer(4)]);
        assert_eq!(store.rows("items").len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_journal_and_temp_tables() {
        let store = MemoryStore::new().with_table("items", Some("id"));
        let mut session = store.open().await.unwrap();

        session.begin().await.unwrap();
        session
            .execute(&Statement::CreateStaging { table: "staging".to_string(), columns: vec![] })
            .await
            .unwrap();
        assert_eq!(store.live_temp_tables(), 1);

        session.rollback().await.unwrap();
        assert_eq!(store.live_temp_tables(), 0);
        assert_eq!(store.log(), vec!["BEGIN", "CREATE", "ROLLBACK"]);
    }
}
