use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::barrier::Communicator;
use super::manifest::{BatchResultFile, BatchStatus, ManifestFile, ManifestStorage};
use crate::acquisition::Acquisition;
use crate::config::GRADIENT_DIR;
use crate::fwi::{self, Traces, compute_full_cost, wavefield_names, write_partial_cost};
use crate::io::{ShotDeck, from_json_file, shot_xml_path, write_shot_xml};
use crate::solver::{AcousticSolver, EngineLauncher, GradientEngine, SolverSettings};

/// What a batch produced
#[derive(Debug, Default)]
struct BatchOutput {
    shots_done: Vec<String>,
    full_cost: Option<f64>,
}

/// Runs the shots of one batch on one rank of its process group
pub struct ShotRunner<L: EngineLauncher> {
    pub worker_id: String,
    pub manifest_storage: Arc<dyn ManifestStorage>,
    pub launcher: L,
    pub comm: Arc<dyn Communicator>,
}

impl<L: EngineLauncher> ShotRunner<L> {
    /// Create a new runner with a random UUID
    pub fn new(
        manifest_storage: Arc<dyn ManifestStorage>,
        launcher: L,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        Self {
            worker_id: Uuid::new_v4().to_string(),
            manifest_storage,
            launcher,
            comm,
        }
    }

    /// Process a batch and, on the root rank, write its result file.
    ///
    /// The result file is written for failed batches too; the error is then
    /// returned to the caller.
    pub async fn run(&self, job_id: &str, batch_id: u32, xml: &Path, aggregate: bool) -> Result<()> {
        let start_time = Utc::now();
        let start_instant = std::time::Instant::now();

        let mut output = BatchOutput::default();
        let outcome = self
            .process_batch(job_id, batch_id, xml, aggregate, &mut output)
            .await;

        if !self.comm.is_root() {
            return outcome;
        }

        let (status, error) = match &outcome {
            Ok(()) => (BatchStatus::Success, None),
            Err(e) => (BatchStatus::Failed, Some(format!("{:#}", e))),
        };

        let result = BatchResultFile {
            batch_id,
            worker_id: self.worker_id.clone(),
            status,
            shots_done: output.shots_done,
            full_cost: output.full_cost,
            started_at: start_time.to_rfc3339(),
            completed_at: Utc::now().to_rfc3339(),
            duration_secs: start_instant.elapsed().as_secs(),
            error,
        };

        self.manifest_storage
            .write_result(job_id, batch_id, &result)
            .await
            .context("Failed to write batch result")?;

        outcome.with_context(|| format!("Batch {} failed", batch_id))
    }

    async fn process_batch(
        &self,
        job_id: &str,
        batch_id: u32,
        xml: &Path,
        aggregate: bool,
        output: &mut BatchOutput,
    ) -> Result<()> {
        let manifest = self
            .manifest_storage
            .read_manifest(job_id)
            .await
            .context("Failed to read manifest")?;
        manifest.settings.validate()?;

        let mut acquisition = self
            .manifest_storage
            .read_shot_list(job_id, batch_id)
            .await?;
        let out_dir = self.manifest_storage.batch_dir(job_id, batch_id);

        info!(
            "Rank {}/{} running batch {} ({} shots)",
            self.comm.rank(),
            self.comm.size(),
            batch_id,
            acquisition.len()
        );

        let decks = self
            .prepare_decks(&manifest, &acquisition, xml, &out_dir)
            .await?;

        let mut engine: Option<L::Engine> = None;

        for (index, deck) in decks.into_iter().enumerate() {
            if let Some(mut previous) = engine.take() {
                previous.finalize().await?;
            }

            let shot = &mut acquisition.shots[index];
            shot.xml = Some(deck);
            let current = self.run_shot(&manifest, shot, &out_dir).await?;
            engine = Some(current);

            shot.mark_done();
            info!("Shot {} done", shot.id);
            output.shots_done.push(shot.id.clone());

            self.comm.barrier().await?;
        }

        if self.comm.is_root() {
            self.manifest_storage
                .write_shot_list(job_id, batch_id, &acquisition)
                .await?;
        }

        if aggregate && self.comm.is_root() {
            output.full_cost = self
                .aggregate(engine.as_mut(), &acquisition, &out_dir)
                .await?;
        }

        if let Some(mut last) = engine {
            last.finalize().await?;
        }

        Ok(())
    }

    /// Render the deck of every shot on the root rank, then let all ranks
    /// read them
    async fn prepare_decks(
        &self,
        manifest: &ManifestFile,
        acquisition: &Acquisition,
        xml: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let dt_seismo_trace = manifest.settings.dt_seismo_trace();
        let mut decks = Vec::with_capacity(acquisition.len());

        for shot in &acquisition.shots {
            let path = if self.comm.is_root() {
                let deck = ShotDeck {
                    shot,
                    max_time: manifest.settings.max_time,
                    dt_seismo_trace,
                };
                write_shot_xml(xml, out_dir, &deck).await?
            } else {
                shot_xml_path(out_dir, &shot.id)
            };
            decks.push(path);
        }

        self.comm.barrier().await?;
        Ok(decks)
    }

    /// Forward then adjoint propagation of one shot; returns its engine,
    /// still initialized
    async fn run_shot(
        &self,
        manifest: &ManifestFile,
        shot: &crate::acquisition::Shot,
        out_dir: &Path,
    ) -> Result<L::Engine> {
        let settings = &manifest.settings;
        let grad_dir = out_dir.join(GRADIENT_DIR);
        let xml = shot
            .xml
            .clone()
            .with_context(|| format!("Shot {} has no engine XML", shot.id))?;

        let mut engine = self
            .launcher
            .launch(&SolverSettings {
                xml,
                dt: shot.dt,
                max_time: settings.max_time,
                dt_seismo_trace: settings.dt_seismo_trace(),
            })
            .await
            .with_context(|| format!("Failed to start the engine for shot {}", shot.id))?;

        engine.initialize(self.comm.rank()).await?;
        engine
            .update_outputs_name(&wavefield_names(&grad_dir, "forwardWaveField", &shot.id), false)
            .await?;
        engine
            .update_sources_and_receivers(&[shot.source], Some(&shot.receivers))
            .await?;
        engine.apply_initial_conditions().await?;

        let observed: Option<Traces> = match &shot.observed {
            Some(path) => Some(
                from_json_file(path)
                    .await
                    .with_context(|| format!("Failed to load observed traces of shot {}", shot.id))?,
            ),
            None => None,
        };

        let residual = fwi::forward(&mut engine, shot, settings, observed.as_ref()).await?;
        if self.comm.is_root() {
            write_partial_cost(out_dir, &residual).await?;
        }
        fwi::backward(&mut engine, shot, settings, &grad_dir, residual).await?;

        if self.comm.is_root() {
            engine
                .compute_partial_gradient(&grad_dir, shot)
                .await
                .with_context(|| format!("Partial gradient of shot {} failed", shot.id))?;
        }

        Ok(engine)
    }

    async fn aggregate(
        &self,
        engine: Option<&mut L::Engine>,
        acquisition: &Acquisition,
        out_dir: &Path,
    ) -> Result<Option<f64>> {
        if !acquisition.all_done() {
            bail!("Cannot aggregate a batch with pending shots");
        }
        let Some(engine) = engine else {
            warn!("Empty batch, nothing to aggregate");
            return Ok(None);
        };

        let full = compute_full_cost(out_dir, acquisition).await?;
        engine
            .compute_full_gradient(&out_dir.join(GRADIENT_DIR), acquisition)
            .await
            .context("Full gradient failed")?;

        Ok(Some(full.cost))
    }
}
