//! High-level runner API for the Olist loader.
//!
//! This module wires the catalog, resolver, store, and coordinator together. It is the API the
//! CLI uses; tests drive [`execute_plan`] directly with an in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{LoadJobConfig, LoadMode};
use crate::coordination::{BatchReport, Coordinator};
use crate::db::store::{PgStore, Store};
use crate::db::{self, PoolArgsBuilder};
use crate::error::LoadError;
use crate::source::reader::DelimitedConfig;
use crate::source::{ChunkReader, FileCatalog, LoadPlan, ReadOptions, resolve};

/// Arguments for running a load batch against Postgres
#[derive(Debug)]
pub struct LoadArgs {
    /// `postgres://...`; read from `DATABASE_URL` by the CLI
    pub database_url: String,
    /// Timeout for establishing the database connection
    pub connect_timeout: Duration,
    pub config: LoadJobConfig,
    pub plan: LoadPlan,
    /// Where to write the JSON batch report, if anywhere
    pub report_path: Option<PathBuf>,
    pub cancel: CancellationToken,
}

/// The first rows of one planned file
#[derive(Debug, Clone)]
pub struct FilePreview {
    pub file_name: String,
    pub table: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Unparseable timestamp cells among the previewed rows
    pub issue_count: u64,
    /// Set instead of rows when the file cannot be read
    pub error: Option<String>,
}

/// The built-in Olist catalog, or a JSON catalog file when one is given
pub async fn load_catalog(path: Option<&Path>) -> Result<FileCatalog> {
    match path {
        Some(path) => FileCatalog::from_json_file(path).await,
        None => Ok(FileCatalog::olist()?),
    }
}

/// Resolve the files of a batch; a missing source directory is fatal
pub fn plan_batch(config: &LoadJobConfig, catalog: &FileCatalog) -> Result<LoadPlan> {
    if !config.source_directory.is_dir() {
        return Err(LoadError::MissingDirectory(config.source_directory.clone()).into());
    }

    let plan = resolve(&config.source_directory, catalog, config.mode);
    info!(
        directory = %config.source_directory.display(),
        files = plan.files.len(),
        skipped = plan.skipped.len(),
        "resolved load plan"
    );
    Ok(plan)
}

/// Read the first `rows` rows of each planned file, parsing timestamp columns
pub fn preview_plan(plan: &LoadPlan, config: &LoadJobConfig, rows: usize) -> Vec<FilePreview> {
    plan.files
        .iter()
        .map(|file| {
            let mut preview = FilePreview {
                file_name: file.descriptor.source_file_name.clone(),
                table: file.descriptor.destination_table.clone(),
                header: Vec::new(),
                rows: Vec::new(),
                issue_count: 0,
                error: None,
            };
            let options = ReadOptions {
                chunk_size: rows.max(1),
                encoding: config.encoding,
                timestamp_columns: file.descriptor.timestamp_columns.clone(),
                delimited: DelimitedConfig::csv(),
            };

            let first_chunk = ChunkReader::open(&file.path, options).and_then(|mut reader| {
                preview.header = reader.header().to_vec();
                reader.next_chunk()
            });
            match first_chunk {
                Ok(Some(chunk)) => {
                    preview.issue_count = chunk.issue_count;
                    preview.rows = chunk
                        .rows
                        .iter()
                        .take(rows)
                        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
                        .collect();
                }
                Ok(None) => {}
                Err(e) => preview.error = Some(e.to_string()),
            }
            preview
        })
        .collect()
}

/// Prepare the destination schema and run the plan through the coordinator
pub async fn execute_plan(
    store: Arc<dyn Store>,
    config: LoadJobConfig,
    plan: LoadPlan,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    match config.mode {
        LoadMode::AutoCreate => {
            store
                .ensure_schema(&config.schema)
                .await
                .with_context(|| format!("Failed to create schema '{}'", config.schema))?;
        }
        LoadMode::FixedSchema => {
            let exists = store
                .schema_exists(&config.schema)
                .await
                .context("Failed to look up destination schema")?;
            if !exists {
                bail!(
                    "Schema '{}' does not exist. Fixed-schema loads need pre-provisioned tables.",
                    config.schema
                );
            }
        }
    }

    let coordinator = Coordinator::new(store, config, cancel);
    Ok(coordinator.run(plan).await)
}

/// Run a load batch with the specified arguments
///
/// Connects to Postgres, loads the plan, and persists the report when asked to. Per-file
/// failures are reported, not returned; only batch-level problems are errors.
pub async fn run_load(args: LoadArgs) -> Result<BatchReport> {
    let LoadArgs {
        database_url,
        connect_timeout,
        config,
        plan,
        report_path,
        cancel,
    } = args;

    let pool_args = PoolArgsBuilder::default()
        .database_url(database_url)
        .max_connections(config.worker_count as u32 + 1)
        .connect_timeout(connect_timeout)
        .build()?;
    let pool = db::pool::pool(pool_args).await?;
    let store = Arc::new(PgStore::new(
        pool.clone(),
        config.statement_timeout,
        config.insert_batch_rows,
    ));

    let report = execute_plan(store, config, plan, cancel).await;
    pool.close().await;
    let report = report?;

    if let Some(path) = report_path {
        report.write_json(&path).await?;
        info!(path = %path.display(), "wrote batch report");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadJobConfigBuilder;
    use tempfile::TempDir;

    fn config(dir: &Path, mode: LoadMode) -> LoadJobConfig {
        LoadJobConfigBuilder::default()
            .source_directory(dir)
            .mode(mode)
            .quiet(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let catalog = FileCatalog::olist().unwrap();
        let err = plan_batch(
            &config(Path::new("/no/such/olist/dir"), LoadMode::AutoCreate),
            &catalog,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoadError>(),
            Some(LoadError::MissingDirectory(_))
        ));
    }

    #[test]
    fn test_preview_parses_timestamps_and_limits_rows() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("olist_orders_dataset.csv"),
            "order_id,customer_id,order_status,order_purchase_timestamp,order_approved_at,\
             order_delivered_carrier_date,order_delivered_customer_date,\
             order_estimated_delivery_date\n\
             o1,c1,delivered,2017-10-02 10:56:33,,,,2017-10-18 00:00:00\n\
             o2,c2,shipped,not a date,,,,2017-11-01\n\
             o3,c3,created,2018-01-01 00:00:00,,,,2018-01-10\n",
        )
        .unwrap();

        let catalog = FileCatalog::olist().unwrap();
        let cfg = config(dir.path(), LoadMode::AutoCreate);
        let plan = plan_batch(&cfg, &catalog).unwrap();
        let previews = preview_plan(&plan, &cfg, 2);

        assert_eq!(previews.len(), 1);
        let orders = &previews[0];
        assert_eq!(orders.header[0], "order_id");
        assert_eq!(orders.rows.len(), 2);
        assert_eq!(orders.rows[0][3], "2017-10-02 10:56:33");
        assert_eq!(orders.rows[0][4], "NULL");
        assert_eq!(orders.rows[1][3], "NULL");
        assert_eq!(orders.issue_count, 1);
        assert!(orders.error.is_none());
    }

    #[test]
    fn test_preview_reports_unreadable_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.csv"), "").unwrap();

        let catalog = FileCatalog::olist().unwrap();
        let cfg = config(dir.path(), LoadMode::AutoCreate);
        let plan = plan_batch(&cfg, &catalog).unwrap();
        let previews = preview_plan(&plan, &cfg, 5);

        assert_eq!(previews[0].error.as_deref(), Some("file has no header row"));
    }

    #[tokio::test]
    async fn test_load_catalog_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"file_name": "sales.csv", "table": "sales", "dedup_key": "Sale ID"}]"#,
        )
        .unwrap();

        let catalog = load_catalog(Some(&path)).await.unwrap();
        assert_eq!(catalog.entries().len(), 1);
        assert_eq!(catalog.entries()[0].dedup_key.as_deref(), Some("sale_id"));

        let builtin = load_catalog(None).await.unwrap();
        assert_eq!(builtin.entries().len(), 9);
    }
}
