//! Per-file outcomes and the batch report built from them.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::config::LoadMode;
use crate::error::LoadError;
use crate::loader::FileStats;
use crate::source::{FileDescriptor, RowIssue, SkippedFile};

/// Why a file did not commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&LoadError> for OutcomeError {
    fn from(error: &LoadError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Result of loading one planned file
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub file: FileDescriptor,
    pub succeeded: bool,
    /// Rows committed; zero whenever `succeeded` is false
    pub rows_loaded: u64,
    pub chunks_written: usize,
    pub duplicates_dropped: u64,
    pub issue_count: u64,
    pub issues: Vec<RowIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    pub duration_ms: u64,
}

impl LoadOutcome {
    pub fn success(file: FileDescriptor, stats: FileStats, duration: Duration) -> Self {
        Self {
            file,
            succeeded: true,
            rows_loaded: stats.rows_loaded,
            chunks_written: stats.chunks_written,
            duplicates_dropped: stats.duplicates_dropped,
            issue_count: stats.issue_count,
            issues: stats.issues,
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(file: FileDescriptor, error: &LoadError, duration: Duration) -> Self {
        Self {
            file,
            succeeded: false,
            rows_loaded: 0,
            chunks_written: 0,
            duplicates_dropped: 0,
            issue_count: 0,
            issues: Vec::new(),
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// A file that was never started because the batch was cancelled
    pub fn cancelled(file: FileDescriptor) -> Self {
        Self::failure(file, &LoadError::Cancelled, Duration::ZERO)
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Aggregated result of one batch, outcomes in plan order
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub mode: LoadMode,
    pub schema: String,
    pub duration_ms: u64,
    /// Sum of rows over successful outcomes
    pub total_rows: u64,
    pub outcomes: Vec<LoadOutcome>,
    pub skipped: Vec<SkippedFile>,
}

impl BatchReport {
    pub fn new(
        job_id: String,
        started_at: DateTime<Utc>,
        mode: LoadMode,
        schema: String,
        duration: Duration,
        outcomes: Vec<LoadOutcome>,
        skipped: Vec<SkippedFile>,
    ) -> Self {
        let total_rows = outcomes
            .iter()
            .filter(|o| o.succeeded)
            .map(|o| o.rows_loaded)
            .sum();
        Self {
            job_id,
            started_at,
            mode,
            schema,
            duration_ms: duration.as_millis() as u64,
            total_rows,
            outcomes,
            skipped,
        }
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.succeeded_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &LoadOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded)
    }

    /// Every planned file committed
    pub fn is_clean(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Write the report as pretty-printed JSON, creating parent directories
    pub async fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create report directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write report file {}", path.display()))?;
        Ok(())
    }
}
