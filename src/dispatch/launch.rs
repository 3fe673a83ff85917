use anyhow::{Result, bail};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How one batch invocation is started
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
pub struct LaunchOptions {
    /// MPI ranks per batch; the engine domain is cut in `x_partition * y_partition`
    pub cores: usize,
    pub x_partition: usize,
    pub y_partition: usize,
    /// Extra arguments handed to the engine bridge
    #[serde(default)]
    pub engine_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            cores: 1,
            x_partition: 1,
            y_partition: 1,
            engine_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 || self.x_partition == 0 || self.y_partition == 0 {
            bail!("cores and partitions must be at least 1");
        }
        if self.x_partition * self.y_partition != self.cores {
            bail!(
                "Partition {}x{} does not match {} cores",
                self.x_partition,
                self.y_partition,
                self.cores
            );
        }
        Ok(())
    }
}

/// Everything a batch invocation needs to find its work
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub job_id: String,
    pub batch_id: u32,
    pub manifest_dir: PathBuf,
    pub xml: PathBuf,
    pub geosx: PathBuf,
    pub launch: LaunchOptions,
    pub aggregate: bool,
    /// Shots in the batch, for progress reporting
    pub shot_count: usize,
    /// Fresh for every submission; keys the barrier of the batch's ranks
    pub run_id: String,
}

impl BatchRequest {
    /// File next to the batch shot list, e.g. `batches/0003.log`
    pub fn batch_file(&self, extension: &str) -> PathBuf {
        self.manifest_dir
            .join("jobs")
            .join(&self.job_id)
            .join("batches")
            .join(format!("{:04}.{}", self.batch_id, extension))
    }

    /// Arguments of the `run-batch` subcommand for this request
    pub fn run_batch_args(&self) -> Vec<String> {
        let mut args = vec![
            "run-batch".to_string(),
            "--manifest-dir".to_string(),
            self.manifest_dir.display().to_string(),
            "--job-id".to_string(),
            self.job_id.clone(),
            "--batch-id".to_string(),
            self.batch_id.to_string(),
            "--run-id".to_string(),
            self.run_id.clone(),
            "--xml".to_string(),
            self.xml.display().to_string(),
            "--geosx".to_string(),
            self.geosx.display().to_string(),
            "-x".to_string(),
            self.launch.x_partition.to_string(),
            "-y".to_string(),
            self.launch.y_partition.to_string(),
        ];
        if self.aggregate {
            args.push("--aggregate".to_string());
        }
        for arg in &self.launch.engine_args {
            args.push(format!("--engine-arg={}", arg));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_must_match_cores() {
        let options = LaunchOptionsBuilder::default()
            .cores(32usize)
            .x_partition(8usize)
            .y_partition(4usize)
            .build()
            .unwrap();
        assert!(options.validate().is_ok());

        let options = LaunchOptionsBuilder::default()
            .cores(2usize)
            .x_partition(2usize)
            .y_partition(2usize)
            .build()
            .unwrap();
        assert!(options.validate().is_err());

        assert!(LaunchOptions::default().validate().is_ok());
    }

    #[test]
    fn test_run_batch_args() {
        let request = BatchRequest {
            job_id: "job".to_string(),
            batch_id: 2,
            manifest_dir: PathBuf::from("/scratch/run"),
            xml: PathBuf::from("/data/acous3D.xml"),
            geosx: PathBuf::from("/opt/geosx"),
            launch: LaunchOptionsBuilder::default()
                .cores(2usize)
                .x_partition(2usize)
                .engine_args(vec!["--trace".to_string()])
                .build()
                .unwrap(),
            aggregate: true,
            shot_count: 4,
            run_id: "r1".to_string(),
        };

        assert_eq!(
            request.run_batch_args(),
            vec![
                "run-batch",
                "--manifest-dir",
                "/scratch/run",
                "--job-id",
                "job",
                "--batch-id",
                "2",
                "--run-id",
                "r1",
                "--xml",
                "/data/acous3D.xml",
                "--geosx",
                "/opt/geosx",
                "-x",
                "2",
                "-y",
                "1",
                "--aggregate",
                "--engine-arg=--trace",
            ]
        );
    }
}
