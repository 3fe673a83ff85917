use anyhow::{Result, bail};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::geometry::{BoundaryBox, Point3, line_positions};
use super::{Acquisition, Shot};

fn default_velocity_model() -> f64 {
    1500.0
}

/// Parameters of an equispaced acquisition: sources along one line, receivers
/// along one or more lines, each at a fixed depth.
///
/// Also the on-disk format of the acquisition file passed to the CLI.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct EquispacedAcquisition {
    pub boundary: BoundaryBox,
    pub dt: f64,
    #[builder(default = "default_velocity_model()")]
    #[serde(default = "default_velocity_model")]
    pub velocity_model: f64,
    pub start_source_pos: [f64; 2],
    pub end_source_pos: [f64; 2],
    /// Start of each receiver line
    pub start_receivers_pos: Vec<[f64; 2]>,
    /// End of each receiver line, paired with `start_receivers_pos`
    pub end_receivers_pos: Vec<[f64; 2]>,
    pub number_of_sources: usize,
    /// Receivers per line
    pub number_of_receivers: usize,
    pub source_depth: f64,
    pub receivers_depth: f64,
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aperture: Option<f64>,
}

impl EquispacedAcquisition {
    /// Build the shots: one per source, each with the full receiver set
    /// (restricted to `aperture` when set).
    pub fn to_acquisition(&self) -> Result<Acquisition> {
        self.validate()?;

        let receivers: Vec<Point3> = self
            .start_receivers_pos
            .iter()
            .zip(&self.end_receivers_pos)
            .flat_map(|(start, end)| {
                line_positions(*start, *end, self.number_of_receivers, self.receivers_depth)
            })
            .collect();

        let sources = line_positions(
            self.start_source_pos,
            self.end_source_pos,
            self.number_of_sources,
            self.source_depth,
        );

        let shots = sources
            .into_iter()
            .enumerate()
            .map(|(i, source)| Shot::new(i, source, receivers.clone(), self.dt))
            .collect();

        let mut acquisition = Acquisition {
            boundary: self.boundary.clone(),
            velocity_model: self.velocity_model,
            dt: self.dt,
            xml: None,
            shots,
        };

        if let Some(aperture) = self.aperture {
            acquisition.limited_aperture(aperture)?;
        }

        for shot in &acquisition.shots {
            if !acquisition.boundary.contains(&shot.source) {
                debug!("Source of shot {} lies outside the boundary box", shot.id);
            }
        }

        Ok(acquisition)
    }

    fn validate(&self) -> Result<()> {
        if self.number_of_sources == 0 {
            bail!("Acquisition needs at least one source");
        }
        if self.number_of_receivers == 0 {
            bail!("Acquisition needs at least one receiver");
        }
        if self.start_receivers_pos.is_empty() {
            bail!("Acquisition needs at least one receiver line");
        }
        if self.start_receivers_pos.len() != self.end_receivers_pos.len() {
            bail!(
                "Receiver lines mismatch: {} start positions but {} end positions",
                self.start_receivers_pos.len(),
                self.end_receivers_pos.len()
            );
        }
        if !self.dt.is_finite() || self.dt <= 0.0 {
            bail!("Time step must be positive and finite, got {}", self.dt);
        }

        let coordinates = self
            .start_source_pos
            .iter()
            .chain(&self.end_source_pos)
            .chain(self.start_receivers_pos.iter().flatten())
            .chain(self.end_receivers_pos.iter().flatten())
            .chain([&self.source_depth, &self.receivers_depth]);
        if let Some(bad) = coordinates.into_iter().find(|v| !v.is_finite()) {
            bail!("Acquisition coordinates must be finite, got {}", bad);
        }

        Ok(())
    }
}
