//! The destination store: everything the loader does against the database goes through
//! [`Store`] and [`StoreTransaction`].

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, Postgres};
use sqlx::query::Query;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::schema::{
    CopyOptions, SqlType, TableName, TableSchema, copy_from_stdin_sql, create_schema_sql,
    create_table_sql, drop_table_sql, insert_sql,
};
use crate::config::{COPY_BUFFER_SIZE, MAX_ACQUIRE_RETRIES, MAX_BIND_PARAMS};
use crate::error::{LoadError, LoadResult};
use crate::source::reader::{Cell, Row};

/// Batch-level operations against the destination
#[async_trait]
pub trait Store: Send + Sync {
    /// Create `schema` when it does not exist yet
    async fn ensure_schema(&self, schema: &str) -> LoadResult<()>;

    async fn schema_exists(&self, schema: &str) -> LoadResult<bool>;

    /// Open a transaction; nothing written through it is visible until commit
    async fn begin(&self) -> LoadResult<Box<dyn StoreTransaction>>;
}

/// One open transaction. Dropping it without commit discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Drop `table` if present and create it empty with `schema`
    async fn replace_table(&mut self, table: &TableName, schema: &TableSchema) -> LoadResult<()>;

    /// Insert rows, returning how many were written
    async fn append_rows(
        &mut self,
        table: &TableName,
        schema: &TableSchema,
        rows: &[Row],
    ) -> LoadResult<u64>;

    /// Text-typed columns of an existing table, in ordinal order
    async fn text_columns(&mut self, table: &TableName) -> LoadResult<Vec<String>>;

    /// Stream a CSV payload through `COPY ... FROM STDIN`, returning the rows copied
    async fn copy_from(
        &mut self,
        table: &TableName,
        options: &CopyOptions,
        source_path: &Path,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> LoadResult<u64>;

    async fn commit(self: Box<Self>) -> LoadResult<()>;

    async fn rollback(self: Box<Self>) -> LoadResult<()>;
}

/// Rows per INSERT statement so that `rows * columns` stays within the bind parameter limit
pub fn rows_per_statement(column_count: usize, batch_rows: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / column_count.max(1);
    batch_rows.min(by_params).max(1)
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
    insert_batch_rows: usize,
}

impl PgStore {
    pub fn new(pool: PgPool, statement_timeout: Duration, insert_batch_rows: usize) -> Self {
        Self {
            pool,
            statement_timeout,
            insert_batch_rows,
        }
    }

    /// Begin a transaction, backing off while the pool is exhausted or the server unreachable
    async fn begin_with_retry(&self) -> LoadResult<sqlx::Transaction<'static, Postgres>> {
        let mut attempt = 0;
        loop {
            match self.pool.begin().await {
                Ok(tx) => return Ok(tx),
                Err(e) if is_retryable_error(&e) && attempt + 1 < MAX_ACQUIRE_RETRIES => {
                    let delay_ms = 100 * 2u64.pow(attempt);
                    warn!(attempt, delay_ms, error = %e, "failed to begin transaction, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ensure_schema(&self, schema: &str) -> LoadResult<()> {
        let sql = create_schema_sql(schema);
        with_timeout("create schema", self.statement_timeout, sqlx::query(&sql).execute(&self.pool))
            .await?;
        Ok(())
    }

    async fn schema_exists(&self, schema: &str) -> LoadResult<bool> {
        let query = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(schema);
        with_timeout("schema lookup", self.statement_timeout, query.fetch_one(&self.pool)).await
    }

    async fn begin(&self) -> LoadResult<Box<dyn StoreTransaction>> {
        let tx = self.begin_with_retry().await?;
        Ok(Box::new(PgStoreTransaction {
            tx,
            statement_timeout: self.statement_timeout,
            insert_batch_rows: self.insert_batch_rows,
        }))
    }
}

pub struct PgStoreTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    statement_timeout: Duration,
    insert_batch_rows: usize,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn replace_table(&mut self, table: &TableName, schema: &TableSchema) -> LoadResult<()> {
        let drop = drop_table_sql(table);
        with_timeout("drop table", self.statement_timeout, sqlx::query(&drop).execute(&mut *self.tx))
            .await?;

        let create = create_table_sql(table, schema);
        debug!(table = %table, "{}", create);
        with_timeout(
            "create table",
            self.statement_timeout,
            sqlx::query(&create).execute(&mut *self.tx),
        )
        .await?;
        Ok(())
    }

    async fn append_rows(
        &mut self,
        table: &TableName,
        schema: &TableSchema,
        rows: &[Row],
    ) -> LoadResult<u64> {
        let per_statement = rows_per_statement(schema.columns.len(), self.insert_batch_rows);
        let mut written = 0u64;

        for batch in rows.chunks(per_statement) {
            let sql = insert_sql(table, schema, batch.len());
            let mut query = sqlx::query(&sql);
            for row in batch {
                query = bind_row(query, row, schema);
            }
            let result =
                with_timeout("insert", self.statement_timeout, query.execute(&mut *self.tx)).await?;
            written += result.rows_affected();
        }

        Ok(written)
    }

    async fn text_columns(&mut self, table: &TableName) -> LoadResult<Vec<String>> {
        let query = sqlx::query_scalar::<_, String>(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             AND data_type IN ('text', 'character varying', 'character') \
             ORDER BY ordinal_position",
        )
        .bind(&table.schema)
        .bind(&table.table);
        with_timeout("column lookup", self.statement_timeout, query.fetch_all(&mut *self.tx)).await
    }

    async fn copy_from(
        &mut self,
        table: &TableName,
        options: &CopyOptions,
        source_path: &Path,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> LoadResult<u64> {
        let sql = copy_from_stdin_sql(table, options);
        debug!(table = %table, "{}", sql);

        let statement_timeout = self.statement_timeout;
        let copy = async {
            let mut copy = self.tx.copy_in_raw(&sql).await?;
            let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                let read = match source.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(read) => read,
                    Err(e) => {
                        copy.abort(format!("failed to read {}", source_path.display()))
                            .await
                            .ok();
                        return Err(LoadError::io(source_path, e));
                    }
                };
                copy.send(&buffer[..read]).await?;
            }
            Ok(copy.finish().await?)
        };

        with_timeout("copy", statement_timeout, copy).await
    }

    async fn commit(self: Box<Self>) -> LoadResult<()> {
        let Self {
            tx,
            statement_timeout,
            ..
        } = *self;
        with_timeout("commit", statement_timeout, tx.commit()).await
    }

    async fn rollback(self: Box<Self>) -> LoadResult<()> {
        let Self {
            tx,
            statement_timeout,
            ..
        } = *self;
        with_timeout("rollback", statement_timeout, tx.rollback()).await
    }
}

/// Run a statement future under `timeout`, mapping elapsed time to [`LoadError::Timeout`]
async fn with_timeout<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> LoadResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<LoadError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(LoadError::Timeout { operation, timeout }),
    }
}

fn bind_row<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    row: &'q [Cell],
    schema: &TableSchema,
) -> Query<'q, Postgres, PgArguments> {
    for (cell, column) in row.iter().zip(&schema.columns) {
        query = match (cell, column.sql_type) {
            (Cell::Text(value), _) => query.bind(value.as_str()),
            (Cell::Timestamp(ts), _) => query.bind(*ts),
            (Cell::Absent, SqlType::Timestamp) => query.bind(None::<chrono::NaiveDateTime>),
            (Cell::Absent, SqlType::Text) => query.bind(None::<String>),
        };
    }
    query
}

/// Transient failures worth another attempt
fn is_retryable_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        other => {
            let msg = other.to_string();
            msg.contains("server unavailable")
                || msg.contains("Connection reset")
                || msg.contains("broken pipe")
        }
    }
}
