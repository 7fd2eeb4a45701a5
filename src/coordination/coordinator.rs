use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::report::{BatchReport, LoadOutcome};
use crate::config::LoadJobConfig;
use crate::db::Store;
use crate::error::LoadError;
use crate::loader::{LoadContext, load_file};
use crate::source::{LoadPlan, PlannedFile};
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// The Coordinator drives a load plan to a batch report.
///
/// Up to `worker_count` files load at once. A file starts only after every file it depends on
/// has settled, and a failed file never stops the others.
pub struct Coordinator {
    store: Arc<dyn Store>,
    config: Arc<LoadJobConfig>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, config: LoadJobConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            config: Arc::new(config),
            cancel,
        }
    }

    /// Load every planned file and report how each one went
    pub async fn run(&self, plan: LoadPlan) -> BatchReport {
        let start_time = Instant::now();
        let started_at = Utc::now();
        let job_id = Uuid::new_v4().to_string();
        info!(
            job_id = %job_id,
            files = plan.files.len(),
            skipped = plan.skipped.len(),
            mode = ?self.config.mode,
            workers = self.config.worker_count,
            "starting load batch"
        );

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let prog_jh = Self::setup_progress_tracking(&self.config, &plan, telemetry_rx);

        let ctx = LoadContext {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
            telemetry: Some(telemetry_tx),
        };
        let outcomes = self.schedule(&plan.files, ctx).await;

        // Every sender is gone once the scheduler returns, so the progress task ends
        if let Some(jh) = prog_jh {
            let _ = jh.await;
        }

        let report = BatchReport::new(
            job_id,
            started_at,
            self.config.mode,
            self.config.schema.clone(),
            start_time.elapsed(),
            outcomes,
            plan.skipped,
        );
        info!(
            job_id = %report.job_id,
            succeeded = report.succeeded_count(),
            failed = report.failed_count(),
            total_rows = report.total_rows,
            "load batch finished"
        );
        report
    }

    /// Start files as worker slots free up and their dependencies settle
    async fn schedule(&self, files: &[PlannedFile], ctx: LoadContext) -> Vec<LoadOutcome> {
        let mut outcomes: Vec<Option<LoadOutcome>> = files.iter().map(|_| None).collect();
        let mut started = vec![false; files.len()];
        let mut running: JoinSet<(usize, LoadOutcome)> = JoinSet::new();

        loop {
            if !self.cancel.is_cancelled() {
                while running.len() < self.config.worker_count {
                    let Some(idx) = next_ready(files, &started, &outcomes) else {
                        break;
                    };
                    started[idx] = true;
                    running.spawn(supervise(ctx.clone(), files[idx].clone(), idx));
                }
            }

            match running.join_next().await {
                Some(Ok((idx, outcome))) => outcomes[idx] = Some(outcome),
                Some(Err(e)) => warn!("File supervisor task failed: {}", e),
                None => break,
            }
        }

        if self.cancel.is_cancelled() {
            let unstarted = started.iter().filter(|s| !**s).count();
            if unstarted > 0 {
                warn!(unstarted, "batch cancelled, remaining files were not started");
            }
        }

        outcomes
            .into_iter()
            .zip(files)
            .zip(started)
            .map(|((outcome, file), was_started)| {
                outcome.unwrap_or_else(|| {
                    if was_started {
                        let lost = LoadError::Panicked("load task was lost".to_string());
                        LoadOutcome::failure(file.descriptor.clone(), &lost, Duration::ZERO)
                    } else {
                        LoadOutcome::cancelled(file.descriptor.clone())
                    }
                })
            })
            .collect()
    }

    /// Setup progress tracking with progress bars
    fn setup_progress_tracking(
        config: &LoadJobConfig,
        plan: &LoadPlan,
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if config.quiet {
            return None;
        }

        let multi_progress = MultiProgress::new();

        let files_bar = multi_progress.add(ProgressBar::new(plan.files.len() as u64));
        files_bar.set_style(bar_style(
            "[{elapsed_precise}] Files: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
        ));

        let rows_bar = multi_progress.add(ProgressBar::new_spinner());
        rows_bar.set_style(bar_style(
            "[{elapsed_precise}] Rows:  {human_pos} written | {per_sec}",
        ));

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(bar_style("[{elapsed_precise}] Chunk Time: {msg}"));

        Some(tokio::spawn(async move {
            let mut stats = ProgressStats::new();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);

                match &event {
                    TelemetryEvent::FileStarted { file } => {
                        files_bar
                            .set_message(format!("{} ({} in flight)", file, stats.in_flight()));
                    }
                    TelemetryEvent::FileCompleted { file, succeeded: false } => {
                        files_bar.println(format!("FAILED {}", file));
                    }
                    _ => {}
                }
                files_bar.set_position(stats.files_completed as u64);
                rows_bar.set_position(stats.rows_written);

                let (p50, p90, p99) = stats.get_percentiles();
                if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                    stats_bar
                        .set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
                }
            }

            files_bar.finish_with_message(format!("{} failed", stats.files_failed));
            rows_bar.finish();
            stats_bar.finish();
        }))
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// First unstarted file, in plan order, whose dependencies have all settled
fn next_ready(
    files: &[PlannedFile],
    started: &[bool],
    outcomes: &[Option<LoadOutcome>],
) -> Option<usize> {
    files.iter().enumerate().position(|(idx, file)| {
        !started[idx] && file.depends_on.iter().all(|&dep| outcomes[dep].is_some())
    })
}

/// Load a file on its own task so a panic becomes that file's outcome
async fn supervise(ctx: LoadContext, file: PlannedFile, idx: usize) -> (usize, LoadOutcome) {
    let descriptor = file.descriptor.clone();
    let start = Instant::now();

    let outcome = match tokio::spawn(load_one(ctx.clone(), file)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let error = LoadError::Panicked(e.to_string());
            warn!(file = %descriptor.source_file_name, error = %error, "file load aborted");
            ctx.emit(TelemetryEvent::FileCompleted {
                file: descriptor.source_file_name.clone(),
                succeeded: false,
            });
            LoadOutcome::failure(descriptor, &error, start.elapsed())
        }
    };
    (idx, outcome)
}

async fn load_one(ctx: LoadContext, file: PlannedFile) -> LoadOutcome {
    let name = file.descriptor.source_file_name.clone();
    let start = Instant::now();
    ctx.emit(TelemetryEvent::FileStarted { file: name.clone() });

    let outcome = match load_file(&ctx, &file).await {
        Ok(stats) => {
            info!(
                file = %name,
                table = %ctx.table_for(&file.descriptor),
                rows = stats.rows_loaded,
                chunks = stats.chunks_written,
                duplicates_dropped = stats.duplicates_dropped,
                issues = stats.issue_count,
                "file committed"
            );
            LoadOutcome::success(file.descriptor, stats, start.elapsed())
        }
        Err(e) => {
            warn!(file = %name, kind = e.kind(), error = %e, "file load failed, rolled back");
            LoadOutcome::failure(file.descriptor, &e, start.elapsed())
        }
    };

    ctx.emit(TelemetryEvent::FileCompleted {
        file: name,
        succeeded: outcome.succeeded,
    });
    outcome
}
