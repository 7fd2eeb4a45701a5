/// Telemetry events sent from file loads to the coordinator for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A file load began
    FileStarted { file: String },
    /// A chunk (or a whole COPY payload) was written inside the file's transaction
    ChunkWritten { rows: u64, duration_ms: u64 },
    /// A file load settled
    FileCompleted { file: String, succeeded: bool },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub files_started: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    /// Rows written so far, including rows of transactions that later roll back
    pub rows_written: u64,
    pub chunk_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FileStarted { .. } => {
                self.files_started += 1;
            }
            TelemetryEvent::ChunkWritten { rows, duration_ms } => {
                self.rows_written += rows;
                self.chunk_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::FileCompleted { succeeded, .. } => {
                self.files_completed += 1;
                if !succeeded {
                    self.files_failed += 1;
                }
            }
        }
    }

    /// Files started but not yet settled
    pub fn in_flight(&self) -> usize {
        self.files_started.saturating_sub(self.files_completed)
    }

    /// Calculate percentile from chunk durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.chunk_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.chunk_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
