//! In-memory engine recording every call, for tests

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{AcousticSolver, EngineLauncher, GradientEngine, SolverSettings};
use crate::acquisition::{Acquisition, Point3, Shot};
use crate::fwi::Traces;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Launch(SolverSettings),
    Initialize(usize),
    UpdateOutputsName {
        names: Vec<String>,
        backward: bool,
    },
    UpdateSourcesAndReceivers {
        sources: Vec<Point3>,
        receivers: Option<Vec<Point3>>,
    },
    UpdateSourceValue(Traces),
    ApplyInitialConditions,
    Execute {
        time: f64,
        cycle: usize,
        output: bool,
    },
    GetPressure,
    PartialGradient {
        dir: PathBuf,
        shot_id: String,
    },
    FullGradient {
        dir: PathBuf,
        shot_ids: Vec<String>,
    },
    Finalize,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Debug, Default)]
pub struct FakeEngine {
    log: CallLog,
    settings: Option<SolverSettings>,
    sources: Vec<Point3>,
    receivers: Vec<Point3>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AcousticSolver for FakeEngine {
    async fn initialize(&mut self, rank: usize) -> Result<()> {
        self.record(Call::Initialize(rank));
        Ok(())
    }

    async fn update_outputs_name(&mut self, names: &[String], backward: bool) -> Result<()> {
        self.record(Call::UpdateOutputsName {
            names: names.to_vec(),
            backward,
        });
        Ok(())
    }

    async fn update_sources_and_receivers(
        &mut self,
        sources: &[Point3],
        receivers: Option<&[Point3]>,
    ) -> Result<()> {
        self.sources = sources.to_vec();
        if let Some(receivers) = receivers {
            self.receivers = receivers.to_vec();
        }
        self.record(Call::UpdateSourcesAndReceivers {
            sources: sources.to_vec(),
            receivers: receivers.map(<[Point3]>::to_vec),
        });
        Ok(())
    }

    async fn update_source_value(&mut self, values: &Traces) -> Result<()> {
        self.record(Call::UpdateSourceValue(values.clone()));
        Ok(())
    }

    async fn apply_initial_conditions(&mut self) -> Result<()> {
        self.record(Call::ApplyInitialConditions);
        Ok(())
    }

    async fn execute(&mut self, time: f64, cycle: usize, output_wavefield: bool) -> Result<()> {
        self.record(Call::Execute {
            time,
            cycle,
            output: output_wavefield,
        });
        Ok(())
    }

    /// One channel per receiver, values derived from the source position
    async fn get_pressure_at_receivers(&mut self) -> Result<Traces> {
        self.record(Call::GetPressure);

        let (dt, samples) = match &self.settings {
            Some(s) => (s.dt_seismo_trace, (s.max_time / s.dt_seismo_trace).round() as usize + 1),
            None => (1.0, 4),
        };
        let offset = self.sources.first().map(|s| s[0]).unwrap_or(0.0);
        let channels = (0..self.receivers.len())
            .map(|r| {
                (0..samples)
                    .map(|i| 0.001 * offset + r as f64 + 0.1 * i as f64)
                    .collect()
            })
            .collect();
        Traces::new(dt, channels)
    }

    async fn finalize(&mut self) -> Result<()> {
        self.record(Call::Finalize);
        Ok(())
    }
}

#[async_trait]
impl GradientEngine for FakeEngine {
    async fn compute_partial_gradient(&mut self, grad_dir: &Path, shot: &Shot) -> Result<()> {
        self.record(Call::PartialGradient {
            dir: grad_dir.to_path_buf(),
            shot_id: shot.id.clone(),
        });
        tokio::fs::create_dir_all(grad_dir).await?;
        tokio::fs::write(grad_dir.join(format!("partialGradient_{}", shot.id)), b"").await?;
        Ok(())
    }

    async fn compute_full_gradient(
        &mut self,
        grad_dir: &Path,
        acquisition: &Acquisition,
    ) -> Result<()> {
        let shot_ids = acquisition.shots.iter().map(|s| s.id.clone()).collect();
        self.record(Call::FullGradient {
            dir: grad_dir.to_path_buf(),
            shot_ids,
        });
        tokio::fs::create_dir_all(grad_dir).await?;
        tokio::fs::write(grad_dir.join("fullGradient"), b"").await?;
        Ok(())
    }
}

/// Launches [`FakeEngine`]s sharing one call log
#[derive(Debug, Clone, Default)]
pub struct FakeLauncher {
    pub log: CallLog,
    /// Launching fails for shots whose XML path contains this text
    pub fail_on: Option<String>,
}

impl FakeLauncher {
    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    type Engine = FakeEngine;

    async fn launch(&self, settings: &SolverSettings) -> Result<FakeEngine> {
        if let Some(pattern) = &self.fail_on
            && settings.xml.display().to_string().contains(pattern.as_str())
        {
            bail!("Engine refused {}", settings.xml.display());
        }
        self.log.lock().unwrap().push(Call::Launch(settings.clone()));
        Ok(FakeEngine {
            log: Arc::clone(&self.log),
            settings: Some(settings.clone()),
            ..FakeEngine::default()
        })
    }
}
