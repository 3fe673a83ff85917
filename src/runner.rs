//! High-level runner API for the FWI shot driver.
//!
//! This module provides a simplified public interface that encapsulates the
//! setup of manifest storage, dispatchers, engine launchers and communicators.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

use crate::acquisition::{Acquisition, EquispacedAcquisition};
use crate::coordination::{
    Coordinator, DispatchConfig, LocalManifestStorage, ManifestStorage, ShotRunner, communicator,
};
use crate::dispatch::{
    BatchDispatcher, ClusterSpecBuilder, InlineDispatcher, LocalProcessDispatcher,
    SchedulerDispatcher,
};
use crate::solver::BridgeLauncher;

pub use crate::dispatch::{LaunchOptions, LaunchOptionsBuilder, SchedulerKind};
pub use crate::fwi::{ShotSettings, ShotSettingsBuilder};
pub use crate::io::{from_json_file, from_json_generic, to_json_file, to_record};

/// Where the batches of a dispatch run
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// Tasks of the dispatching process, one rank each
    Inline,
    /// Child processes of this machine, started through `mpirun` when a
    /// batch spans several cores
    Local { mpirun: String },
    /// One SLURM or LSF job per batch
    Scheduler {
        kind: SchedulerKind,
        job_name: String,
        nodes: usize,
        queue: Option<String>,
        walltime: Option<String>,
        extra: Vec<String>,
    },
}

/// Arguments for building an acquisition without running it
#[derive(Debug, Clone)]
pub struct PlanArgs {
    /// JSON acquisition file
    pub acquisition: PathBuf,
    /// Overrides the file's aperture
    pub aperture: Option<f64>,
    /// Stem of the exported shot list, if any
    pub output: Option<PathBuf>,
}

/// Summary of a planned acquisition
#[derive(Debug)]
pub struct PlanResult {
    pub shots: usize,
    pub min_receivers: usize,
    pub max_receivers: usize,
    pub written: Option<PathBuf>,
}

/// Arguments for a dispatch operation
#[derive(Debug, Clone)]
pub struct DispatchArgs {
    pub acquisition: PathBuf,
    pub aperture: Option<f64>,
    /// Base engine XML deck
    pub xml: PathBuf,
    /// Engine installation directory
    pub geosx: PathBuf,
    pub settings: ShotSettings,
    pub launch: LaunchOptions,
    pub backend: Backend,
    pub batch_count: usize,
    pub workers: usize,
    pub aggregate: bool,
    pub manifest_dir: Option<PathBuf>,
    pub quiet: bool,
}

/// Result of a completed dispatch operation
#[derive(Debug)]
pub struct DispatchSummary {
    pub job_id: String,
    pub batches_submitted: usize,
    pub batches_failed: usize,
    pub shots_done: usize,
    pub total_shots: usize,
    pub total_cost: Option<f64>,
    pub duration: Duration,
    /// Directory holding the job outputs, when it outlives the run
    pub manifest_dir: Option<PathBuf>,
}

/// Arguments for running one batch on this process's rank
#[derive(Debug, Clone)]
pub struct BatchArgs {
    pub manifest_dir: PathBuf,
    pub job_id: String,
    pub batch_id: u32,
    /// Keys the barrier markers of this run of the batch
    pub run_id: String,
    pub xml: PathBuf,
    pub geosx: PathBuf,
    /// Overrides the bridge shipped with `geosx`
    pub bridge: Option<PathBuf>,
    pub x_partition: usize,
    pub y_partition: usize,
    /// Explicit rank and size; taken from the launcher's environment otherwise
    pub rank: Option<usize>,
    pub size: Option<usize>,
    pub aggregate: bool,
    pub engine_args: Vec<String>,
}

async fn load_acquisition(path: &Path, aperture: Option<f64>) -> Result<Acquisition> {
    let mut config: EquispacedAcquisition = from_json_file(path)
        .await
        .with_context(|| format!("Failed to load acquisition {}", path.display()))?;
    if aperture.is_some() {
        config.aperture = aperture;
    }
    config.to_acquisition()
}

/// Build the acquisition described by a JSON file, optionally exporting its
/// shot list.
pub async fn plan(args: PlanArgs) -> Result<PlanResult> {
    let acquisition = load_acquisition(&args.acquisition, args.aperture).await?;

    let receivers = acquisition.shots.iter().map(|s| s.receivers.len());
    let min_receivers = receivers.clone().min().unwrap_or(0);
    let max_receivers = receivers.max().unwrap_or(0);

    let written = match &args.output {
        Some(stem) => Some(to_json_file(&acquisition, stem).await?),
        None => None,
    };

    Ok(PlanResult {
        shots: acquisition.len(),
        min_receivers,
        max_receivers,
        written,
    })
}

/// Split an acquisition into batches and run them on the chosen backend
///
/// Without `manifest_dir`, a temporary directory holds the job; it is kept
/// only when a batch fails, for inspection.
///
/// # Example
///
/// ```no_run
/// use fwi_shot_driver::runner::{
///     Backend, DispatchArgs, LaunchOptions, ShotSettingsBuilder, run_dispatch,
/// };
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let args = DispatchArgs {
///     acquisition: PathBuf::from("acquisition.json"),
///     aperture: None,
///     xml: PathBuf::from("acous3D.xml"),
///     geosx: PathBuf::from("/opt/GEOSX"),
///     settings: ShotSettingsBuilder::default()
///         .max_time(2.0)
///         .output_wavefield_interval(10usize)
///         .build()?,
///     launch: LaunchOptions::default(),
///     backend: Backend::Local { mpirun: "mpirun".to_string() },
///     batch_count: 4,
///     workers: 2,
///     aggregate: true,
///     manifest_dir: Some(PathBuf::from("fwi-jobs")),
///     quiet: true,
/// };
///
/// let summary = run_dispatch(args).await?;
/// println!("{} shots done in {:?}", summary.shots_done, summary.duration);
/// # Ok(())
/// # }
/// ```
pub async fn run_dispatch(args: DispatchArgs) -> Result<DispatchSummary> {
    let acquisition = load_acquisition(&args.acquisition, args.aperture).await?;
    let total_shots = acquisition.len();

    if matches!(args.backend, Backend::Scheduler { .. }) && args.manifest_dir.is_none() {
        bail!("Scheduler jobs need a shared --manifest-dir");
    }

    let (mut temp_dir, manifest_dir_path) = if let Some(dir) = args.manifest_dir.clone() {
        (None, dir)
    } else {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().to_path_buf();
        (Some(temp_dir), path)
    };

    let manifest_storage: Arc<dyn ManifestStorage> =
        Arc::new(LocalManifestStorage::new(manifest_dir_path.clone()));
    let dispatcher = build_dispatcher(&args, Arc::clone(&manifest_storage))?;
    let coordinator = Coordinator::new(manifest_storage, dispatcher);

    let config = DispatchConfig {
        acquisition,
        xml: args.xml,
        geosx: args.geosx,
        settings: args.settings,
        launch: args.launch,
        batch_count: args.batch_count,
        workers: args.workers,
        aggregate: args.aggregate,
        quiet: args.quiet,
    };

    let result = coordinator.run_dispatch(config).await?;

    let manifest_dir = match temp_dir.take() {
        Some(temp) if result.batches_failed > 0 => Some(temp.keep()),
        Some(_) => None,
        None => Some(manifest_dir_path),
    };

    Ok(DispatchSummary {
        job_id: result.job_id,
        batches_submitted: result.batches_submitted,
        batches_failed: result.batches_failed,
        shots_done: result.shots_done,
        total_shots,
        total_cost: result.total_cost,
        duration: result.duration,
        manifest_dir,
    })
}

fn build_dispatcher(
    args: &DispatchArgs,
    manifest_storage: Arc<dyn ManifestStorage>,
) -> Result<Arc<dyn BatchDispatcher>> {
    Ok(match &args.backend {
        Backend::Inline => {
            let mut launcher = BridgeLauncher::for_installation(
                &args.geosx,
                args.launch.x_partition,
                args.launch.y_partition,
            );
            launcher.extra_args = args.launch.engine_args.clone();
            Arc::new(InlineDispatcher::new(manifest_storage, launcher))
        }
        Backend::Local { mpirun } => {
            Arc::new(LocalProcessDispatcher::current_exe()?.with_mpirun(mpirun.clone()))
        }
        Backend::Scheduler {
            kind,
            job_name,
            nodes,
            queue,
            walltime,
            extra,
        } => {
            let executable = std::env::current_exe()
                .context("Failed to locate the running executable")?;
            let spec = ClusterSpecBuilder::default()
                .kind(*kind)
                .job_name(job_name.clone())
                .nodes(*nodes)
                .cores(args.launch.cores)
                .queue(queue.clone())
                .walltime(walltime.clone())
                .executable(executable)
                .extra(extra.clone())
                .build()?;
            Arc::new(SchedulerDispatcher::new(spec))
        }
    })
}

/// Run one batch of a dispatched job on this process's rank
///
/// This is what every worker process or scheduler job executes.
pub async fn run_batch(args: BatchArgs) -> Result<()> {
    let manifest_storage: Arc<dyn ManifestStorage> =
        Arc::new(LocalManifestStorage::new(args.manifest_dir.clone()));

    let mut launcher =
        BridgeLauncher::for_installation(&args.geosx, args.x_partition, args.y_partition);
    if let Some(bridge) = args.bridge {
        launcher.program = bridge;
    }
    launcher.extra_args = args.engine_args;

    let batch_dir = manifest_storage.batch_dir(&args.job_id, args.batch_id);
    let comm = communicator(batch_dir, &args.run_id, args.rank, args.size)?;
    info!(
        "Batch {} of job {} on rank {}/{}",
        args.batch_id,
        args.job_id,
        comm.rank(),
        comm.size()
    );

    let runner = ShotRunner::new(manifest_storage, launcher, Arc::from(comm));
    runner
        .run(&args.job_id, args.batch_id, &args.xml, args.aggregate)
        .await
}
