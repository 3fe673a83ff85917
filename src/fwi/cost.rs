//! File-based misfit accumulator
//!
//! Every shot drops `partialCostFunction/partialCost_<id>.json` into the batch
//! output directory; the reduction sums the files of an acquisition into
//! `fullCostFunction.json`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::Residual;
use crate::acquisition::Acquisition;
use crate::config::{COST_DIR, FULL_COST_FILE};
use crate::io::json::{from_json_file, to_json_file};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialCost {
    pub shot_id: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullCost {
    pub cost: f64,
    pub shot_ids: Vec<String>,
}

fn partial_cost_stem(out_dir: &Path, shot_id: &str) -> PathBuf {
    out_dir.join(COST_DIR).join(format!("partialCost_{}", shot_id))
}

/// Record the misfit of one shot
pub async fn write_partial_cost(out_dir: &Path, residual: &Residual) -> Result<PathBuf> {
    let record = PartialCost {
        shot_id: residual.shot_id().to_string(),
        cost: residual.cost(),
    };
    to_json_file(&record, partial_cost_stem(out_dir, residual.shot_id())).await
}

/// Sum the partial costs of every shot of `acquisition`.
///
/// A missing partial file is an error: the reduction must only run once all
/// shots are done.
pub async fn compute_full_cost(out_dir: &Path, acquisition: &Acquisition) -> Result<FullCost> {
    let mut total = 0.0;
    let mut shot_ids = Vec::with_capacity(acquisition.len());

    for shot in &acquisition.shots {
        let mut path = partial_cost_stem(out_dir, &shot.id).into_os_string();
        path.push(".json");

        let partial: PartialCost = from_json_file(&path)
            .await
            .with_context(|| format!("Missing partial cost of shot {}", shot.id))?;
        if partial.shot_id != shot.id {
            bail!(
                "Partial cost file of shot {} belongs to shot {}",
                shot.id,
                partial.shot_id
            );
        }
        total += partial.cost;
        shot_ids.push(shot.id.clone());
    }

    let full = FullCost {
        cost: total,
        shot_ids,
    };
    let path = to_json_file(&full, out_dir.join(FULL_COST_FILE)).await?;
    info!("Full cost {:.6e} over {} shots written to {}", total, full.shot_ids.len(), path.display());

    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{BoundaryBox, Shot};
    use crate::fwi::Traces;
    use tempfile::TempDir;

    fn acquisition(ids: &[usize]) -> Acquisition {
        Acquisition {
            boundary: BoundaryBox::new(vec![[0.0, 10.0], [0.0, 10.0]]).unwrap(),
            velocity_model: 1500.0,
            dt: 0.1,
            xml: None,
            shots: ids
                .iter()
                .map(|&i| Shot::new(i, [1.0, 1.0, 0.0], vec![[2.0, 1.0, 0.0]], 0.1))
                .collect(),
        }
    }

    fn residual(id: &str, value: f64) -> Residual {
        let traces = Traces::new(2.0, vec![vec![value]]).unwrap();
        Residual::compute(id, traces, None).unwrap()
    }

    #[tokio::test]
    async fn test_full_cost_sums_partials() {
        let dir = TempDir::new().unwrap();
        let path = write_partial_cost(dir.path(), &residual("00000", 1.0))
            .await
            .unwrap();
        assert!(path.ends_with("partialCostFunction/partialCost_00000.json"));
        write_partial_cost(dir.path(), &residual("00001", 2.0))
            .await
            .unwrap();

        let full = compute_full_cost(dir.path(), &acquisition(&[0, 1]))
            .await
            .unwrap();
        // 0.5 * 2.0 * (1 + 4)
        assert_eq!(full.cost, 5.0);
        assert_eq!(full.shot_ids, vec!["00000", "00001"]);

        let written: FullCost = from_json_file(dir.path().join("fullCostFunction.json"))
            .await
            .unwrap();
        assert_eq!(written, full);
    }

    #[tokio::test]
    async fn test_full_cost_missing_shot_is_error() {
        let dir = TempDir::new().unwrap();
        write_partial_cost(dir.path(), &residual("00000", 1.0))
            .await
            .unwrap();

        let err = compute_full_cost(dir.path(), &acquisition(&[0, 1]))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("00001"));
    }
}
