/// Telemetry events sent from the dispatch client to the coordinator for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A batch invocation was handed to the dispatcher
    BatchSubmitted { batch_id: u32 },
    /// A batch invocation ended successfully
    BatchCompleted {
        batch_id: u32,
        shots: usize,
        duration_ms: u64,
    },
    /// A batch invocation failed
    BatchFailed { batch_id: u32, duration_ms: u64 },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub batches_submitted: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub shots_done: usize,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::BatchSubmitted { .. } => {
                self.batches_submitted += 1;
            }
            TelemetryEvent::BatchCompleted {
                shots, duration_ms, ..
            } => {
                self.batches_completed += 1;
                self.shots_done += shots;
                self.batch_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::BatchFailed { duration_ms, .. } => {
                self.batches_failed += 1;
                self.batch_durations_ms.push(*duration_ms);
            }
        }
    }

    /// Batches that ended, successfully or not
    pub fn batches_finished(&self) -> usize {
        self.batches_completed + self.batches_failed
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
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
