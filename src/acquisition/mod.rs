//! Acquisition geometry: sources, receivers and the shots built from them

pub mod equispaced;
pub mod geometry;
pub mod shot;

pub use equispaced::EquispacedAcquisition;
pub use geometry::{BoundaryBox, Point3};
pub use shot::Shot;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use geometry::horizontal_distance;

/// Ordered shots sharing a model boundary, velocity and time step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acquisition {
    pub boundary: BoundaryBox,
    pub velocity_model: f64,
    pub dt: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml: Option<PathBuf>,
    pub shots: Vec<Shot>,
}

impl Acquisition {
    /// Attach the base engine XML to the acquisition and every shot
    pub fn with_xml(mut self, xml: impl AsRef<Path>) -> Self {
        let xml = xml.as_ref().to_path_buf();
        for shot in &mut self.shots {
            shot.xml = Some(xml.clone());
        }
        self.xml = Some(xml);
        self
    }

    /// Keep, for each shot, only receivers within `aperture` of its source
    /// (horizontal distance). Fails, leaving every shot untouched, if a shot
    /// would end up with no receiver.
    pub fn limited_aperture(&mut self, aperture: f64) -> Result<()> {
        if !aperture.is_finite() || aperture < 0.0 {
            bail!("Aperture must be a non-negative finite distance, got {}", aperture);
        }

        let mut kept = Vec::with_capacity(self.shots.len());
        for shot in &self.shots {
            let receivers: Vec<Point3> = shot
                .receivers
                .iter()
                .filter(|r| horizontal_distance(&shot.source, r) <= aperture)
                .copied()
                .collect();
            if receivers.is_empty() {
                bail!(
                    "Shot {} has no receiver within an aperture of {}",
                    shot.id,
                    aperture
                );
            }
            kept.push(receivers);
        }

        for (shot, receivers) in self.shots.iter_mut().zip(kept) {
            shot.receivers = receivers;
        }
        Ok(())
    }

    /// Partition the shots into `parts` sub-acquisitions without reordering.
    ///
    /// Part `i` takes `remaining / (parts - i)` shots, so sizes differ by at most
    /// one and concatenating the parts yields the original order.
    pub fn split(self, parts: usize) -> Result<Vec<Acquisition>> {
        if parts == 0 {
            bail!("Cannot split an acquisition into 0 parts");
        }

        let Acquisition {
            boundary,
            velocity_model,
            dt,
            xml,
            shots,
        } = self;

        let mut remaining = shots.len();
        let mut shots = shots.into_iter();
        let mut result = Vec::new();

        for i in 0..parts {
            let take = remaining / (parts - i);
            result.push(Acquisition {
                boundary: boundary.clone(),
                velocity_model,
                dt,
                xml: xml.clone(),
                shots: shots.by_ref().take(take).collect(),
            });
            remaining -= take;
        }

        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.shots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    pub fn all_done(&self) -> bool {
        self.shots.iter().all(Shot::is_done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::equispaced::EquispacedAcquisitionBuilder;

    fn acquisition_with(n: usize) -> Acquisition {
        EquispacedAcquisitionBuilder::default()
            .boundary(BoundaryBox::new(vec![[0.0, 2000.0], [0.0, 2000.0], [0.0, 2000.0]]).unwrap())
            .dt(0.002)
            .start_source_pos([501.0, 1001.0])
            .end_source_pos([1501.0, 1001.0])
            .start_receivers_pos(vec![[21.0, 1001.0]])
            .end_receivers_pos(vec![[1981.0, 1001.0]])
            .number_of_sources(n)
            .number_of_receivers(4usize)
            .source_depth(1899.0)
            .receivers_depth(1949.0)
            .build()
            .unwrap()
            .to_acquisition()
            .unwrap()
    }

    fn ids(acq: &Acquisition) -> Vec<String> {
        acq.shots.iter().map(|s| s.id.clone()).collect()
    }

    #[test]
    fn test_split_sizes_sum_and_order_preserved() {
        for n in [1usize, 4, 7, 10, 23] {
            for k in 1..=6 {
                let acq = acquisition_with(n);
                let original = ids(&acq);
                let parts = acq.split(k).unwrap();

                assert_eq!(parts.len(), k);
                let total: usize = parts.iter().map(Acquisition::len).sum();
                assert_eq!(total, original.len());

                let concatenated: Vec<String> = parts.iter().flat_map(ids).collect();
                assert_eq!(concatenated, original);

                let max = parts.iter().map(Acquisition::len).max().unwrap();
                let min = parts.iter().map(Acquisition::len).min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn test_split_larger_parts_come_last() {
        let parts = acquisition_with(10).split(4).unwrap();
        let sizes: Vec<usize> = parts.iter().map(Acquisition::len).collect();
        assert_eq!(sizes, vec![2, 2, 3, 3]);
    }

    #[test]
    fn test_split_zero_parts_is_error() {
        assert!(acquisition_with(3).split(0).is_err());
    }

    #[test]
    fn test_split_keeps_shared_fields() {
        let acq = acquisition_with(4).with_xml("/data/base.xml");
        let parts = acq.clone().split(2).unwrap();
        for part in &parts {
            assert_eq!(part.boundary, acq.boundary);
            assert_eq!(part.dt, acq.dt);
            assert_eq!(part.xml, acq.xml);
        }
    }

    #[test]
    fn test_with_xml_sets_every_shot() {
        let acq = acquisition_with(3).with_xml("/data/base.xml");
        assert!(
            acq.shots
                .iter()
                .all(|s| s.xml.as_deref() == Some(Path::new("/data/base.xml")))
        );
    }

    #[test]
    fn test_limited_aperture_filters_receivers() {
        // receivers at x = 21, 674.33, 1327.67, 1981; sources at 501 .. 1501
        let mut acq = acquisition_with(4);
        acq.limited_aperture(500.0).unwrap();

        for shot in &acq.shots {
            assert!(!shot.receivers.is_empty());
            for r in &shot.receivers {
                assert!((r[0] - shot.source[0]).abs() <= 500.0);
            }
        }
        // first source at x=501 sees 21 and 674.33 only
        assert_eq!(acq.shots[0].receivers.len(), 2);
    }

    #[test]
    fn test_limited_aperture_empty_is_error() {
        let mut acq = acquisition_with(2);
        let before = acq.clone();
        assert!(acq.limited_aperture(1.0).is_err());
        assert_eq!(acq, before);
        assert!(acquisition_with(2).limited_aperture(-1.0).is_err());
    }

    #[test]
    fn test_all_done() {
        let mut acq = acquisition_with(2);
        assert!(!acq.all_done());
        for shot in &mut acq.shots {
            shot.mark_done();
        }
        assert!(acq.all_done());
    }
}
