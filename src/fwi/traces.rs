use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Time series sampled every `dt`, one channel per source or receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traces {
    pub dt: f64,
    pub channels: Vec<Vec<f64>>,
}

impl Traces {
    pub fn new(dt: f64, channels: Vec<Vec<f64>>) -> Result<Self> {
        if let Some(first) = channels.first()
            && let Some((idx, bad)) = channels
                .iter()
                .enumerate()
                .find(|(_, c)| c.len() != first.len())
        {
            bail!(
                "Channel {} has {} samples, expected {}",
                idx,
                bad.len(),
                first.len()
            );
        }
        Ok(Self { dt, channels })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_samples(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Sum of squared samples over every channel
    pub fn energy(&self) -> f64 {
        self.channels.iter().flatten().map(|v| v * v).sum()
    }
}

/// Simulated minus observed receiver traces of one shot.
///
/// Only built by the forward pass and consumed by the backward pass of the
/// same shot.
#[derive(Debug, PartialEq)]
pub struct Residual {
    shot_id: String,
    traces: Traces,
}

impl Residual {
    /// Difference `simulated - observed`; without observation the simulated
    /// traces are the residual.
    pub(crate) fn compute(
        shot_id: &str,
        simulated: Traces,
        observed: Option<&Traces>,
    ) -> Result<Self> {
        let traces = match observed {
            None => simulated,
            Some(observed) => {
                if observed.num_channels() != simulated.num_channels()
                    || observed.num_samples() != simulated.num_samples()
                {
                    bail!(
                        "Observed traces of shot {} are {}x{}, simulated are {}x{}",
                        shot_id,
                        observed.num_channels(),
                        observed.num_samples(),
                        simulated.num_channels(),
                        simulated.num_samples()
                    );
                }
                let channels = simulated
                    .channels
                    .iter()
                    .zip(&observed.channels)
                    .map(|(s, o)| s.iter().zip(o).map(|(a, b)| a - b).collect())
                    .collect();
                Traces {
                    dt: simulated.dt,
                    channels,
                }
            }
        };

        Ok(Self {
            shot_id: shot_id.to_string(),
            traces,
        })
    }

    pub fn shot_id(&self) -> &str {
        &self.shot_id
    }

    pub fn traces(&self) -> &Traces {
        &self.traces
    }

    /// Least-squares misfit `0.5 * dt * sum(r^2)`
    pub fn cost(&self) -> f64 {
        0.5 * self.traces.dt * self.traces.energy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_channels_rejected() {
        assert!(Traces::new(0.1, vec![vec![1.0, 2.0], vec![1.0]]).is_err());
        assert!(Traces::new(0.1, vec![]).is_ok());
    }

    #[test]
    fn test_residual_without_observation_is_simulated() {
        let simulated = Traces::new(0.5, vec![vec![1.0, -2.0]]).unwrap();
        let residual = Residual::compute("00001", simulated.clone(), None).unwrap();
        assert_eq!(residual.traces(), &simulated);
        assert_eq!(residual.shot_id(), "00001");
        assert!((residual.cost() - 0.5 * 0.5 * 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_residual_difference() {
        let simulated = Traces::new(1.0, vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        let observed = Traces::new(1.0, vec![vec![1.0, 1.0], vec![0.0, 4.0]]).unwrap();
        let residual = Residual::compute("00000", simulated, Some(&observed)).unwrap();
        assert_eq!(residual.traces().channels, vec![vec![0.0, 1.0], vec![3.0, 0.0]]);
        assert_eq!(residual.cost(), 5.0);
    }

    #[test]
    fn test_residual_shape_mismatch() {
        let simulated = Traces::new(1.0, vec![vec![0.0; 3]; 2]).unwrap();
        let observed = Traces::new(1.0, vec![vec![0.0; 4]; 2]).unwrap();
        assert!(Residual::compute("00000", simulated, Some(&observed)).is_err());
    }
}
