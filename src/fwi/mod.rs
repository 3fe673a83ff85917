//! Forward and adjoint passes of one shot, plus the misfit bookkeeping

pub mod cost;
pub mod traces;
pub mod wavelet;

pub use cost::{compute_full_cost, write_partial_cost};
pub use traces::{Residual, Traces};
pub use wavelet::ricker;

use anyhow::{Context, Result, bail};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::acquisition::Shot;
use crate::config::DEFAULT_SOURCE_FREQUENCY;
use crate::solver::AcousticSolver;

/// Number of `dt` steps in `[0, max_time)`, tolerant to rounding of the ratio
pub(crate) fn time_steps(max_time: f64, dt: f64) -> usize {
    if !(max_time > 0.0 && dt > 0.0) {
        return 0;
    }
    (max_time / dt + 1e-9).floor() as usize
}

fn default_nb_seismo() -> usize {
    500
}

fn default_source_frequency() -> f64 {
    DEFAULT_SOURCE_FREQUENCY
}

/// Time settings shared by every shot of a run
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct ShotSettings {
    pub max_time: f64,
    /// Number of seismogram samples recorded per receiver
    #[builder(default = "default_nb_seismo()")]
    #[serde(default = "default_nb_seismo")]
    pub nb_seismo: usize,
    /// Write the wavefield every this many steps
    pub output_wavefield_interval: usize,
    #[builder(default = "default_source_frequency()")]
    #[serde(default = "default_source_frequency")]
    pub source_frequency: f64,
}

impl ShotSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_time.is_finite() && self.max_time > 0.0) {
            bail!("maxTime must be positive, got {}", self.max_time);
        }
        if self.nb_seismo < 2 {
            bail!("At least 2 seismogram samples are needed, got {}", self.nb_seismo);
        }
        if self.output_wavefield_interval == 0 {
            bail!("Wavefield output interval must be at least 1");
        }
        if !(self.source_frequency.is_finite() && self.source_frequency > 0.0) {
            bail!("Source frequency must be positive, got {}", self.source_frequency);
        }
        Ok(())
    }

    /// Sampling interval of the recorded seismograms
    pub fn dt_seismo_trace(&self) -> f64 {
        self.max_time / (self.nb_seismo - 1) as f64
    }
}

/// Engine output names of the three wavefield time levels of a shot
pub fn wavefield_names(grad_dir: &Path, prefix: &str, shot_id: &str) -> Vec<String> {
    ["Np1", "N", "Nm1"]
        .iter()
        .map(|level| {
            grad_dir
                .join(format!("{}{}_{}", prefix, level, shot_id))
                .display()
                .to_string()
        })
        .collect()
}

/// Propagate the source wavelet and return the receiver residual.
///
/// The solver must already be initialized with the shot's sources, receivers
/// and output names.
pub async fn forward<S: AcousticSolver + ?Sized>(
    solver: &mut S,
    shot: &Shot,
    settings: &ShotSettings,
    observed: Option<&Traces>,
) -> Result<Residual> {
    let steps = time_steps(settings.max_time, shot.dt);
    let wavelet = Traces::new(
        shot.dt,
        vec![ricker(settings.max_time, shot.dt, settings.source_frequency)],
    )?;

    solver
        .update_source_value(&wavelet)
        .await
        .with_context(|| format!("Failed to set the source wavelet of shot {}", shot.id))?;

    debug!("Shot {}: forward pass over {} steps", shot.id, steps);
    for cycle in 0..steps {
        let time = cycle as f64 * shot.dt;
        solver
            .execute(time, cycle, cycle % settings.output_wavefield_interval == 0)
            .await
            .with_context(|| format!("Forward step {} of shot {} failed", cycle, shot.id))?;
    }

    let simulated = solver
        .get_pressure_at_receivers()
        .await
        .with_context(|| format!("Failed to read receiver pressure of shot {}", shot.id))?;

    if simulated.num_channels() != shot.receivers.len() {
        bail!(
            "Engine returned {} receiver traces for shot {}, expected {}",
            simulated.num_channels(),
            shot.id,
            shot.receivers.len()
        );
    }

    Residual::compute(&shot.id, simulated, observed)
}

/// Back-propagate `residual` from the receivers, reversed in time.
///
/// Receivers act as sources. The residual is consumed here so it cannot seed
/// another shot.
pub async fn backward<S: AcousticSolver + ?Sized>(
    solver: &mut S,
    shot: &Shot,
    settings: &ShotSettings,
    grad_dir: &Path,
    residual: Residual,
) -> Result<()> {
    if residual.shot_id() != shot.id {
        bail!(
            "Residual of shot {} cannot seed the adjoint of shot {}",
            residual.shot_id(),
            shot.id
        );
    }

    solver
        .update_sources_and_receivers(&shot.receivers, None)
        .await
        .context("Failed to move sources to the receivers")?;
    solver
        .update_source_value(residual.traces())
        .await
        .context("Failed to seed the adjoint sources")?;
    solver
        .update_outputs_name(&wavefield_names(grad_dir, "backwardWaveField", &shot.id), true)
        .await
        .context("Failed to rename adjoint outputs")?;
    solver.apply_initial_conditions().await?;

    let steps = time_steps(settings.max_time, shot.dt);
    debug!("Shot {}: backward pass over {} steps", shot.id, steps);
    for cycle in (0..steps).rev() {
        let time = cycle as f64 * shot.dt;
        solver
            .execute(time, cycle, cycle % settings.output_wavefield_interval == 0)
            .await
            .with_context(|| format!("Backward step {} of shot {} failed", cycle, shot.id))?;
    }

    Ok(())
}
