use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::geometry::Point3;

/// Processing state of a shot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShotStatus {
    #[default]
    Pending,
    Done,
}

/// One source firing recorded by a set of receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub id: String,
    pub source: Point3,
    pub receivers: Vec<Point3>,
    /// Engine XML used for this shot (base file until the runner renders a per-shot copy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xml: Option<PathBuf>,
    /// Recorded traces to compare against; zero traces when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<PathBuf>,
    pub dt: f64,
    #[serde(default)]
    pub status: ShotStatus,
}

impl Shot {
    pub fn new(index: usize, source: Point3, receivers: Vec<Point3>, dt: f64) -> Self {
        Self {
            id: shot_id(index),
            source,
            receivers,
            xml: None,
            observed: None,
            dt,
            status: ShotStatus::Pending,
        }
    }

    pub fn mark_done(&mut self) {
        self.status = ShotStatus::Done;
    }

    pub fn is_done(&self) -> bool {
        self.status == ShotStatus::Done
    }
}

/// Zero-padded shot identifier used in every per-shot file name
pub fn shot_id(index: usize) -> String {
    format!("{:05}", index)
}
