//! Per-file load protocols.
//!
//! Each file loads inside exactly one store transaction: either every row the file contributes
//! becomes visible or none do.

mod auto_create;
mod bulk_copy;
mod dedup;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{LoadJobConfig, LoadMode, MAX_RECORDED_ISSUES};
use crate::db::{Store, StoreTransaction, TableName};
use crate::error::LoadResult;
use crate::source::{FileDescriptor, PlannedFile, RowIssue};
use crate::telemetry::TelemetryEvent;

pub use dedup::Deduplicator;

/// What one committed file load wrote
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub rows_loaded: u64,
    pub chunks_written: usize,
    pub duplicates_dropped: u64,
    pub issue_count: u64,
    pub issues: Vec<RowIssue>,
}

impl FileStats {
    fn record_issues(&mut self, issues: &[RowIssue], count: u64) {
        self.issue_count += count;
        let room = MAX_RECORDED_ISSUES.saturating_sub(self.issues.len());
        self.issues.extend(issues.iter().take(room).cloned());
    }
}

/// Everything a file load needs from its batch
#[derive(Clone)]
pub struct LoadContext {
    pub store: Arc<dyn Store>,
    pub config: Arc<LoadJobConfig>,
    pub cancel: CancellationToken,
    pub telemetry: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl LoadContext {
    pub fn table_for(&self, descriptor: &FileDescriptor) -> TableName {
        TableName::new(&self.config.schema, &descriptor.destination_table)
    }

    pub(crate) fn emit(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry {
            // Progress display is best effort; a closed channel only means no one is watching
            let _ = tx.send(event);
        }
    }

    fn chunk_written(&self, rows: u64, started: Instant) {
        self.emit(TelemetryEvent::ChunkWritten {
            rows,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// Load one file with the protocol matching the batch mode
pub async fn load_file(ctx: &LoadContext, file: &PlannedFile) -> LoadResult<FileStats> {
    let mut tx = ctx.store.begin().await?;

    let result = match ctx.config.mode {
        LoadMode::AutoCreate => auto_create::write_file(ctx, file, tx.as_mut()).await,
        LoadMode::FixedSchema => bulk_copy::write_file(ctx, file, tx.as_mut()).await,
    };

    finish(tx, result, &file.descriptor.source_file_name).await
}

/// Commit on success, roll back otherwise
async fn finish(
    tx: Box<dyn StoreTransaction>,
    result: LoadResult<FileStats>,
    file_name: &str,
) -> LoadResult<FileStats> {
    match result {
        Ok(stats) => {
            tx.commit().await?;
            Ok(stats)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(file = file_name, error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}
