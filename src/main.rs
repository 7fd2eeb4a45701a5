use clap::{Parser, Subcommand};
use olist_loader::config::{
    CONNECT_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_INSERT_BATCH_ROWS, DEFAULT_PREVIEW_ROWS,
    DEFAULT_SCHEMA, LoadJobConfig, LoadJobConfigBuilder, LoadMode, STATEMENT_TIMEOUT,
    encoding_from_label,
};
use olist_loader::coordination::BatchReport;
use olist_loader::runner::{self, FilePreview, LoadArgs};
use olist_loader::source::LoadPlan;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit status when the batch ran but at least one file did not commit
const EXIT_COMPLETED_WITH_FAILURES: i32 = 2;

#[derive(Parser, Clone)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Load a directory of Olist CSV extracts into Postgres
    Load(LoadCommand),
}

#[derive(Clone, clap::Args)]
struct LoadCommand {
    /// Directory holding the CSV files
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Destination schema
    #[arg(short, long, default_value = DEFAULT_SCHEMA)]
    schema: String,

    /// auto-create (derive tables from headers) or fixed-schema (COPY into existing tables)
    #[arg(short, long, default_value = "auto-create")]
    mode: String,

    /// Rows per chunk
    #[arg(short, long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Source text encoding (utf-8, latin1, cp1252, ...)
    #[arg(short, long, default_value = "utf-8")]
    encoding: String,

    /// Number of files loaded concurrently
    #[arg(short, long, default_value = "1")]
    workers: usize,

    /// Rows per INSERT statement
    #[arg(long, default_value_t = DEFAULT_INSERT_BATCH_ROWS)]
    insert_batch_rows: usize,

    /// Per-statement timeout in seconds
    #[arg(long, default_value_t = STATEMENT_TIMEOUT.as_secs())]
    statement_timeout_secs: u64,

    /// Timeout in seconds for establishing the database connection
    #[arg(long, default_value_t = CONNECT_TIMEOUT.as_secs())]
    connect_timeout_secs: u64,

    /// JSON file of catalog entries replacing the built-in Olist catalog
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Print the first rows of each file before loading
    #[arg(long, num_args = 0..=1, default_missing_value = "5")]
    preview: Option<usize>,

    /// Resolve and print the load plan without touching the database
    #[arg(long)]
    dry_run: bool,

    /// Write the batch report as JSON to this path
    #[arg(long = "report")]
    report_path: Option<PathBuf>,

    /// Quiet mode - minimal output, only show summary
    #[arg(short, long)]
    quiet: bool,
}

impl LoadCommand {
    fn job_config(&self) -> anyhow::Result<LoadJobConfig> {
        Ok(LoadJobConfigBuilder::default()
            .source_directory(self.data_dir.clone())
            .schema(self.schema.clone())
            .mode(LoadMode::parse(&self.mode)?)
            .chunk_size(self.chunk_size)
            .encoding(encoding_from_label(&self.encoding)?)
            .worker_count(self.workers)
            .insert_batch_rows(self.insert_batch_rows)
            .statement_timeout(Duration::from_secs(self.statement_timeout_secs))
            .quiet(self.quiet)
            .build()?)
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Load(cmd) => {
            init_tracing(cmd.quiet);

            let config = cmd.job_config()?;
            let quiet = cmd.quiet;

            if !quiet {
                println!("Olist Loader");
                println!("============");
                println!("Source: {}", config.source_directory.display());
                println!("Schema: {}", config.schema);
                println!("Mode: {:?}", config.mode);
                println!("Workers: {}", config.worker_count);
                println!();
            }

            let catalog = runner::load_catalog(cmd.catalog.as_deref()).await?;
            let plan = runner::plan_batch(&config, &catalog)?;

            if let Some(rows) = cmd.preview {
                let rows = if rows == 0 { DEFAULT_PREVIEW_ROWS } else { rows };
                print_previews(&runner::preview_plan(&plan, &config, rows));
            }

            if cmd.dry_run {
                println!("DRY RUN MODE - No data will be loaded");
                println!();
                print_plan(&plan);
                println!();
                println!("To execute, run without --dry-run");
                return Ok(());
            }

            let connect_timeout = cmd.connect_timeout();
            let database_url = cmd.database_url.ok_or_else(|| {
                anyhow::anyhow!("No database configured. Set DATABASE_URL or pass --database-url.")
            })?;

            let cancel = CancellationToken::new();
            spawn_interrupt_handler(cancel.clone());

            let report = runner::run_load(LoadArgs {
                database_url,
                connect_timeout,
                config,
                plan,
                report_path: cmd.report_path.clone(),
                cancel,
            })
            .await?;

            print_summary(&report);
            if let Some(path) = cmd.report_path {
                println!("Report written to {}", path.display());
            }

            if !report.is_clean() {
                std::process::exit(EXIT_COMPLETED_WITH_FAILURES);
            }
        }
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let default_filter = if quiet {
        "olist_loader=warn,sqlx=off"
    } else {
        "olist_loader=info,sqlx=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// First Ctrl-C stops new files from starting and rolls back the ones in flight
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling load batch");
            cancel.cancel();
        }
    });
}

fn print_previews(previews: &[FilePreview]) {
    for preview in previews {
        println!("{} -> {}", preview.file_name, preview.table);
        if let Some(error) = &preview.error {
            println!("  unreadable: {}", error);
            println!();
            continue;
        }
        println!("  {}", preview.header.join(" | "));
        for row in &preview.rows {
            println!("  {}", row.join(" | "));
        }
        if preview.issue_count > 0 {
            println!("  ({} unparseable timestamp values)", preview.issue_count);
        }
        println!();
    }
}

fn print_plan(plan: &LoadPlan) {
    println!("Plan:");
    if plan.is_empty() {
        println!("  (no files to load)");
    }
    for (idx, file) in plan.files.iter().enumerate() {
        let deps: Vec<&str> = file
            .depends_on
            .iter()
            .map(|&dep| plan.files[dep].descriptor.destination_table.as_str())
            .collect();
        print!(
            "  {:>2}. {} -> {}",
            idx + 1,
            file.descriptor.source_file_name,
            file.descriptor.destination_table
        );
        if !deps.is_empty() {
            print!(" (after {})", deps.join(", "));
        }
        if let Some(key) = &file.descriptor.dedup_key {
            print!(" [dedup on {}]", key);
        }
        println!();
    }
    for skipped in &plan.skipped {
        println!("  skipped {}: {}", skipped.file_name, skipped.reason);
    }
}

fn print_summary(report: &BatchReport) {
    println!();
    println!("Load Summary");
    println!("============");
    println!("Job ID: {}", report.job_id);
    println!(
        "Files: {} loaded, {} failed, {} skipped",
        report.succeeded_count(),
        report.failed_count(),
        report.skipped.len()
    );
    println!("Rows loaded: {}", report.total_rows);
    println!("Duration: {:.2}s", report.duration().as_secs_f64());
    let secs = report.duration().as_secs_f64();
    if secs > 0.0 {
        println!("Throughput: {:.2} rows/sec", report.total_rows as f64 / secs);
    }

    for outcome in &report.outcomes {
        let status = if outcome.succeeded { "ok" } else { "FAILED" };
        print!(
            "  [{}] {} -> {}: {} rows",
            status, outcome.file.source_file_name, outcome.file.destination_table, outcome.rows_loaded
        );
        if outcome.duplicates_dropped > 0 {
            print!(", {} duplicates dropped", outcome.duplicates_dropped);
        }
        if outcome.issue_count > 0 {
            print!(", {} unparseable timestamps", outcome.issue_count);
        }
        println!();
        if let Some(error) = &outcome.error {
            println!("      {}: {}", error.kind, error.message);
        }
    }
}
