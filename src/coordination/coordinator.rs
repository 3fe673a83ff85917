use anyhow::{Context, Result, bail};
use chrono::Utc;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::manifest::{BatchInfo, BatchResultFile, BatchStatus, ManifestFile, ManifestStorage};
use crate::acquisition::Acquisition;
use crate::config::MAX_BATCH_COUNT;
use crate::dispatch::{BatchDispatcher, BatchRequest, Client, LaunchOptions};
use crate::fwi::ShotSettings;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Configuration for a dispatch operation
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub acquisition: Acquisition,
    pub xml: PathBuf,
    pub geosx: PathBuf,
    pub settings: ShotSettings,
    pub launch: LaunchOptions,
    /// Number of batches the acquisition is split into
    pub batch_count: usize,
    /// Batches running at the same time
    pub workers: usize,
    pub aggregate: bool,
    pub quiet: bool,
}

/// Result of a completed dispatch operation
#[derive(Debug)]
pub struct DispatchResult {
    pub job_id: String,
    pub batches_submitted: usize,
    pub batches_failed: usize,
    pub shots_done: usize,
    /// Sum of the batch costs, when batches aggregate
    pub total_cost: Option<f64>,
    pub duration: Duration,
    /// Detailed results for each batch (accessed in integration tests)
    #[cfg_attr(not(test), allow(dead_code))]
    pub batch_results: Vec<BatchResultFile>,
}

/// The Coordinator splits an acquisition into batches and maps the shot
/// runner over them.
pub struct Coordinator {
    manifest_storage: Arc<dyn ManifestStorage>,
    dispatcher: Arc<dyn BatchDispatcher>,
}

impl Coordinator {
    pub fn new(
        manifest_storage: Arc<dyn ManifestStorage>,
        dispatcher: Arc<dyn BatchDispatcher>,
    ) -> Self {
        Self {
            manifest_storage,
            dispatcher,
        }
    }

    /// Run the complete dispatch operation
    ///
    /// 1. Generate unique job ID
    /// 2. Split the acquisition and export one shot list per batch
    /// 3. Write manifest file
    /// 4. Map the batches over the dispatch client
    /// 5. Wait for completion and aggregate results
    pub async fn run_dispatch(&self, config: DispatchConfig) -> Result<DispatchResult> {
        let start_time = Instant::now();

        config.settings.validate()?;
        config.launch.validate()?;
        if config.acquisition.is_empty() {
            bail!("Acquisition has no shot to dispatch");
        }
        if config.batch_count == 0 || config.batch_count > MAX_BATCH_COUNT {
            bail!(
                "Batch count must be between 1 and {}, got {}",
                MAX_BATCH_COUNT,
                config.batch_count
            );
        }

        // 1. Generate job ID
        let job_id = Uuid::new_v4().to_string();
        info!("Starting dispatch job: {}", job_id);

        // 2. Split and export
        let batches = self.export_batches(&job_id, &config).await?;

        // 3. Write manifest
        self.create_and_write_manifest(&job_id, &config, &batches)
            .await?;

        // 4. Telemetry channel and client
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let client = Client::new(Arc::clone(&self.dispatcher))
            .scale(config.workers)
            .with_telemetry(telemetry_tx);

        let requests: Vec<BatchRequest> = batches
            .iter()
            .map(|batch| BatchRequest {
                job_id: job_id.clone(),
                batch_id: batch.batch_id,
                manifest_dir: self.manifest_storage.base_dir(),
                xml: config.xml.clone(),
                geosx: config.geosx.clone(),
                launch: config.launch.clone(),
                aggregate: config.aggregate,
                shot_count: batch.shot_ids.len(),
                run_id: Uuid::new_v4().simple().to_string(),
            })
            .collect();

        let mapped = client.map(requests);

        // Drop the client's sender so the channel closes when batches finish
        drop(client);

        let prog_jh = Self::setup_progress_tracking(&config, &batches, telemetry_rx);

        let outcomes = Client::gather(mapped).await;

        if let Some(jh) = prog_jh {
            let _ = jh.await;
        }

        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                warn!(
                    "Batch {} failed after {:.1}s: {:#}",
                    outcome.batch_id,
                    outcome.duration.as_secs_f64(),
                    e
                );
            }
        }

        // 5. Aggregate results
        self.aggregate_final_results(&job_id, &config, &batches, start_time)
            .await
    }

    /// Split the acquisition and write the shot list of every non-empty batch
    async fn export_batches(&self, job_id: &str, config: &DispatchConfig) -> Result<Vec<BatchInfo>> {
        let acquisition = config.acquisition.clone().with_xml(&config.xml);
        let parts = acquisition
            .split(config.batch_count)
            .context("Failed to split acquisition")?;

        let mut batches = Vec::new();
        for (index, part) in parts.into_iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            let batch_id = index as u32;
            self.manifest_storage
                .write_shot_list(job_id, batch_id, &part)
                .await?;
            batches.push(BatchInfo {
                batch_id,
                shot_ids: part.shots.iter().map(|s| s.id.clone()).collect(),
            });
        }

        info!(
            "Split {} shots into {} batches",
            config.acquisition.len(),
            batches.len()
        );
        Ok(batches)
    }

    async fn create_and_write_manifest(
        &self,
        job_id: &str,
        config: &DispatchConfig,
        batches: &[BatchInfo],
    ) -> Result<()> {
        let manifest = ManifestFile {
            job_id: job_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            xml: config.xml.clone(),
            geosx: config.geosx.clone(),
            settings: config.settings.clone(),
            launch: config.launch.clone(),
            aggregate: config.aggregate,
            total_shots: config.acquisition.len(),
            batches: batches.to_vec(),
        };

        self.manifest_storage
            .write_manifest(job_id, &manifest)
            .await
            .context("Failed to write manifest")?;

        info!("Manifest written for job: {}", job_id);
        Ok(())
    }

    fn bar_style(template: &str) -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-")
    }

    /// Setup progress tracking with progress bars
    fn setup_progress_tracking(
        config: &DispatchConfig,
        batches: &[BatchInfo],
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if config.quiet {
            return None;
        }

        let multi_progress = MultiProgress::new();
        let total_shots: usize = batches.iter().map(|b| b.shot_ids.len()).sum();

        let batch_bar = multi_progress.add(ProgressBar::new(batches.len() as u64));
        batch_bar.set_style(Self::bar_style(
            "[{elapsed_precise}] Batches: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
        ));

        let shots_bar = multi_progress.add(ProgressBar::new(total_shots as u64));
        shots_bar.set_style(Self::bar_style(
            "[{elapsed_precise}] Shots:   [{bar:30.green/blue}] {pos}/{len} ({percent}%)",
        ));

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(Self::bar_style("[{elapsed_precise}] Batch Time: {msg}"));

        Some(tokio::spawn(async move {
            let mut stats = ProgressStats::new();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);

                batch_bar.set_position(stats.batches_finished() as u64);
                if stats.batches_failed > 0 {
                    batch_bar.set_message(format!("{} failed", stats.batches_failed));
                }
                shots_bar.set_position(stats.shots_done as u64);

                let (p50, p90, p99) = stats.get_percentiles();
                if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                    stats_bar
                        .set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
                }
            }

            batch_bar.finish_with_message("All batches finished");
            shots_bar.finish();

            let (p50, p90, p99) = stats.get_percentiles();
            if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                stats_bar
                    .finish_with_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
            } else {
                stats_bar.finish();
            }
        }))
    }

    /// Collect all batch results from manifest storage
    async fn collect_results(&self, job_id: &str, batches: &[BatchInfo]) -> Vec<BatchResultFile> {
        let mut results = Vec::with_capacity(batches.len());

        for batch in batches {
            match self.manifest_storage.read_result(job_id, batch.batch_id).await {
                Ok(result) => results.push(result),
                Err(_) => {
                    // The batch died before its root rank could report
                    warn!("Batch {} result missing", batch.batch_id);
                }
            }
        }

        results
    }

    /// Aggregate the final results from all batch result files
    async fn aggregate_final_results(
        &self,
        job_id: &str,
        config: &DispatchConfig,
        batches: &[BatchInfo],
        start_time: Instant,
    ) -> Result<DispatchResult> {
        info!("Aggregating results...");
        let batch_results = self.collect_results(job_id, batches).await;

        let succeeded = batch_results
            .iter()
            .filter(|r| r.status == BatchStatus::Success)
            .count();
        let batches_failed = batches.len() - succeeded;
        let shots_done: usize = batch_results.iter().map(|r| r.shots_done.len()).sum();

        let total_cost = if config.aggregate && batches_failed == 0 {
            Some(batch_results.iter().filter_map(|r| r.full_cost).sum())
        } else {
            None
        };
        let duration = start_time.elapsed();

        info!(
            "Dispatch complete: {} batches, {} failed, {} of {} shots done in {:.2}s",
            batches.len(),
            batches_failed,
            shots_done,
            config.acquisition.len(),
            duration.as_secs_f64()
        );

        Ok(DispatchResult {
            job_id: job_id.to_string(),
            batches_submitted: batches.len(),
            batches_failed,
            shots_done,
            total_cost,
            duration,
            batch_results,
        })
    }
}
