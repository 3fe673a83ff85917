use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// A point in model coordinates: (x, y, depth)
pub type Point3 = [f64; 3];

/// Axis-aligned extent of the model, one `[min, max]` pair per axis
///
/// Serialized as a plain nested array, e.g. `[[0, 2000], [0, 2000], [0, 2000]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct BoundaryBox {
    axes: Vec<[f64; 2]>,
}

impl BoundaryBox {
    /// Create a boundary box from 2 or 3 `[min, max]` ranges
    pub fn new(axes: Vec<[f64; 2]>) -> Result<Self> {
        if !(2..=3).contains(&axes.len()) {
            bail!(
                "Boundary box must have 2 or 3 axes, got {}",
                axes.len()
            );
        }
        for (axis, [min, max]) in axes.iter().enumerate() {
            if !min.is_finite() || !max.is_finite() || min > max {
                bail!(
                    "Invalid boundary range on axis {}: [{}, {}]",
                    axis,
                    min,
                    max
                );
            }
        }
        Ok(Self { axes })
    }

    /// Check whether a point lies inside the box (missing axes are unbounded)
    pub fn contains(&self, point: &Point3) -> bool {
        self.axes
            .iter()
            .zip(point.iter())
            .all(|([min, max], v)| *v >= *min && *v <= *max)
    }
}

impl TryFrom<Vec<[f64; 2]>> for BoundaryBox {
    type Error = anyhow::Error;

    fn try_from(axes: Vec<[f64; 2]>) -> Result<Self> {
        Self::new(axes)
    }
}

impl From<BoundaryBox> for Vec<[f64; 2]> {
    fn from(boundary: BoundaryBox) -> Self {
        boundary.axes
    }
}

/// `count` evenly spaced values from `start` to `end` inclusive.
/// A single value collapses onto `start`.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| start + i as f64 * step).collect()
        }
    }
}

/// Evenly spaced (x, y) positions along a line at a fixed depth
pub fn line_positions(start: [f64; 2], end: [f64; 2], count: usize, depth: f64) -> Vec<Point3> {
    let xs = linspace(start[0], end[0], count);
    let ys = linspace(start[1], end[1], count);
    xs.into_iter()
        .zip(ys)
        .map(|(x, y)| [x, y, depth])
        .collect()
}

/// Distance between two points projected on the surface (x, y)
pub fn horizontal_distance(a: &Point3, b: &Point3) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}
