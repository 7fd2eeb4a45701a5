//! In-memory [`Store`] used by the test suite.
//!
//! Transactions stage whole tables and publish them on commit, so a failed or cancelled load
//! leaves the previously committed table untouched, the same as Postgres.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::schema::{Column, CopyOptions, SqlType, TableName, TableSchema};
use super::store::{Store, StoreTransaction};
use crate::error::{LoadError, LoadResult};
use crate::source::reader::{Cell, Row};

pub type MemoryRow = Vec<Option<String>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<Column>,
    pub rows: Vec<MemoryRow>,
}

#[derive(Default)]
struct State {
    schemas: BTreeSet<String>,
    tables: HashMap<TableName, MemoryTable>,
    /// (table, rows) for every append or copy, in call order
    writes: Vec<(TableName, usize)>,
    /// Tables published by each commit, in commit order
    commits: Vec<TableName>,
    rollbacks: usize,
    failing_tables: HashSet<String>,
    cancel_on_write: Option<(CancellationToken, usize)>,
    active: usize,
    max_active: usize,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    write_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every write so concurrent loads overlap
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub fn add_schema(&self, schema: &str) {
        self.state.lock().unwrap().schemas.insert(schema.to_string());
    }

    /// Create a committed table, as if provisioned ahead of the load
    pub fn provision(&self, table: &TableName, columns: &[(&str, SqlType)]) {
        let mut state = self.state.lock().unwrap();
        state.schemas.insert(table.schema.clone());
        state.tables.insert(
            table.clone(),
            MemoryTable {
                columns: columns
                    .iter()
                    .map(|(name, sql_type)| Column {
                        name: name.to_string(),
                        sql_type: *sql_type,
                    })
                    .collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Every write to a table with this (unqualified) name fails
    pub fn fail_writes_to(&self, table: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_tables
            .insert(table.to_string());
    }

    /// Cancel `token` once `after_writes` writes have been made
    pub fn cancel_on_write(&self, token: CancellationToken, after_writes: usize) {
        self.state.lock().unwrap().cancel_on_write = Some((token, after_writes));
    }

    pub fn table(&self, table: &TableName) -> Option<MemoryTable> {
        self.state.lock().unwrap().tables.get(table).cloned()
    }

    pub fn row_count(&self, table: &TableName) -> Option<usize> {
        self.table(table).map(|t| t.rows.len())
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.state.lock().unwrap().schemas.contains(schema)
    }

    /// Row counts of each write made to `table`, committed or not
    pub fn writes_to(&self, table: &TableName) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(name, _)| name == table)
            .map(|(_, rows)| *rows)
            .collect()
    }

    pub fn commit_log(&self) -> Vec<TableName> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn rollback_count(&self) -> usize {
        self.state.lock().unwrap().rollbacks
    }

    pub fn max_concurrent_transactions(&self) -> usize {
        self.state.lock().unwrap().max_active
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_schema(&self, schema: &str) -> LoadResult<()> {
        self.add_schema(schema);
        Ok(())
    }

    async fn schema_exists(&self, schema: &str) -> LoadResult<bool> {
        Ok(self.has_schema(schema))
    }

    async fn begin(&self) -> LoadResult<Box<dyn StoreTransaction>> {
        {
            let mut state = self.state.lock().unwrap();
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
        }
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            write_delay: self.write_delay,
            staged: HashMap::new(),
            touched: Vec::new(),
            committed: false,
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    write_delay: Option<Duration>,
    staged: HashMap<TableName, MemoryTable>,
    touched: Vec<TableName>,
    committed: bool,
}

impl MemoryTransaction {
    fn staged_table(&mut self, table: &TableName) -> LoadResult<&mut MemoryTable> {
        if !self.staged.contains_key(table) {
            let committed = self.state.lock().unwrap().tables.get(table).cloned();
            let Some(committed) = committed else {
                return Err(store_error(format!("relation {} does not exist", table)));
            };
            self.staged.insert(table.clone(), committed);
            self.touched.push(table.clone());
        }
        Ok(self.staged.get_mut(table).unwrap())
    }

    /// Apply the configured delay and failure rules, then log the write
    async fn record_write(&self, table: &TableName, rows: usize) -> LoadResult<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.failing_tables.contains(&table.table) {
            return Err(store_error(format!("injected write failure for {}", table)));
        }
        state.writes.push((table.clone(), rows));
        let writes = state.writes.len();
        if let Some((token, after)) = &state.cancel_on_write
            && writes >= *after
        {
            token.cancel();
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn replace_table(&mut self, table: &TableName, schema: &TableSchema) -> LoadResult<()> {
        if !self.state.lock().unwrap().schemas.contains(&table.schema) {
            return Err(store_error(format!("schema {} does not exist", table.schema)));
        }
        if !self.staged.contains_key(table) {
            self.touched.push(table.clone());
        }
        self.staged.insert(
            table.clone(),
            MemoryTable {
                columns: schema.columns.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append_rows(
        &mut self,
        table: &TableName,
        _schema: &TableSchema,
        rows: &[Row],
    ) -> LoadResult<u64> {
        self.record_write(table, rows.len()).await?;
        let target = self.staged_table(table)?;
        for row in rows {
            if row.len() != target.columns.len() {
                return Err(store_error(format!(
                    "row has {} values, {} has {} columns",
                    row.len(),
                    table,
                    target.columns.len()
                )));
            }
            target.rows.push(row.iter().map(cell_text).collect());
        }
        Ok(rows.len() as u64)
    }

    async fn text_columns(&mut self, table: &TableName) -> LoadResult<Vec<String>> {
        let columns = match self.staged.get(table) {
            Some(staged) => staged.columns.clone(),
            None => self
                .state
                .lock()
                .unwrap()
                .tables
                .get(table)
                .map(|t| t.columns.clone())
                .unwrap_or_default(),
        };
        Ok(columns
            .into_iter()
            .filter(|c| c.sql_type == SqlType::Text)
            .map(|c| c.name)
            .collect())
    }

    async fn copy_from(
        &mut self,
        table: &TableName,
        options: &CopyOptions,
        source_path: &Path,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> LoadResult<u64> {
        let mut payload = Vec::new();
        source
            .read_to_end(&mut payload)
            .await
            .map_err(|e| LoadError::io(source_path, e))?;

        let encoding = match options.encoding {
            None | Some("UTF8") => encoding_rs::UTF_8,
            Some("WIN1252") => encoding_rs::WINDOWS_1252,
            Some(other) => return Err(store_error(format!("unsupported encoding {}", other))),
        };
        let (text, _, had_errors) = encoding.decode(&payload);
        if had_errors {
            return Err(store_error(format!("invalid byte sequence for encoding {}", encoding.name())));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(options.header)
            .from_reader(text.as_bytes());
        let mut rows = Vec::new();
        {
            let target = self.staged_table(table)?;
            for record in reader.records() {
                let record = record?;
                if record.len() != target.columns.len() {
                    return Err(store_error(format!(
                        "COPY row has {} values, {} has {} columns",
                        record.len(),
                        table,
                        target.columns.len()
                    )));
                }
                let row: MemoryRow = record
                    .iter()
                    .zip(&target.columns)
                    .map(|(value, column)| {
                        if value.is_empty() && !options.force_not_null.contains(&column.name) {
                            None
                        } else {
                            Some(value.to_string())
                        }
                    })
                    .collect();
                rows.push(row);
            }
        }

        let copied = rows.len();
        self.record_write(table, copied).await?;
        self.staged_table(table)?.rows.extend(rows);
        Ok(copied as u64)
    }

    async fn commit(mut self: Box<Self>) -> LoadResult<()> {
        let mut state = self.state.lock().unwrap();
        for name in &self.touched {
            if let Some(table) = self.staged.remove(name) {
                state.tables.insert(name.clone(), table);
                state.commits.push(name.clone());
            }
        }
        drop(state);
        self.committed = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LoadResult<()> {
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.active -= 1;
            if !self.committed {
                state.rollbacks += 1;
            }
        }
    }
}

fn cell_text(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Text(value) => Some(value.clone()),
        Cell::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
        Cell::Absent => None,
    }
}

fn store_error(message: String) -> LoadError {
    LoadError::Store(sqlx::Error::Protocol(message))
}
