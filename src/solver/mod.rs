//! Contract with the external wave-propagation engine
//!
//! The engine owns the mesh, the wave equation and the gradient kernels. This
//! crate only drives it through the traits below; [`bridge`] talks to a real
//! engine process.

pub mod bridge;
#[cfg(test)]
pub mod fake;

pub use bridge::BridgeLauncher;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::acquisition::{Acquisition, Point3, Shot};
use crate::fwi::Traces;

/// Settings an engine instance is created with for one shot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub xml: PathBuf,
    pub dt: f64,
    pub max_time: f64,
    pub dt_seismo_trace: f64,
}

/// Time-stepping acoustic solver of the engine
#[async_trait]
pub trait AcousticSolver: Send {
    async fn initialize(&mut self, rank: usize) -> Result<()>;

    /// Rename the wavefield outputs (`[Np1, N, Nm1]`); `backward` marks the adjoint run
    async fn update_outputs_name(&mut self, names: &[String], backward: bool) -> Result<()>;

    /// Move sources, and receivers when given
    async fn update_sources_and_receivers(
        &mut self,
        sources: &[Point3],
        receivers: Option<&[Point3]>,
    ) -> Result<()>;

    /// Replace the source time functions, one channel per source
    async fn update_source_value(&mut self, values: &Traces) -> Result<()>;

    async fn apply_initial_conditions(&mut self) -> Result<()>;

    /// Advance one step at `time`; write the wavefield when `output_wavefield` is set
    async fn execute(&mut self, time: f64, cycle: usize, output_wavefield: bool) -> Result<()>;

    /// Pressure recorded at the receivers so far, one channel per receiver
    async fn get_pressure_at_receivers(&mut self) -> Result<Traces>;

    async fn finalize(&mut self) -> Result<()>;
}

/// Gradient kernels of the engine, reading the wavefields it wrote
#[async_trait]
pub trait GradientEngine: Send {
    async fn compute_partial_gradient(&mut self, grad_dir: &Path, shot: &Shot) -> Result<()>;

    async fn compute_full_gradient(
        &mut self,
        grad_dir: &Path,
        acquisition: &Acquisition,
    ) -> Result<()>;
}

/// Creates one engine instance per shot
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    type Engine: AcousticSolver + GradientEngine;

    async fn launch(&self, settings: &SolverSettings) -> Result<Self::Engine>;
}
