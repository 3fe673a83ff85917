use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::acquisition::Acquisition;
use crate::dispatch::LaunchOptions;
use crate::fwi::ShotSettings;
use crate::io::json::{from_json_file, to_json_file};

/// Shots assigned to one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub batch_id: u32,
    pub shot_ids: Vec<String>,
}

/// The manifest file structure written by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub job_id: String,
    pub created_at: String, // ISO 8601
    /// Base engine XML every shot deck is rendered from
    pub xml: PathBuf,
    /// Engine installation directory
    pub geosx: PathBuf,
    pub settings: ShotSettings,
    pub launch: LaunchOptions,
    /// Reduce cost and gradient at the end of each batch
    pub aggregate: bool,
    pub total_shots: usize,
    pub batches: Vec<BatchInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Failed,
}

/// The result file structure written by the root rank of a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultFile {
    pub batch_id: u32,
    pub worker_id: String,
    pub status: BatchStatus,
    pub shots_done: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_cost: Option<f64>,
    pub started_at: String,   // ISO 8601
    pub completed_at: String, // ISO 8601
    pub duration_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Trait for manifest storage operations
///
/// The coordinator and the batch runners only meet through this storage, so a
/// batch can run in a different process or on a different node.
#[async_trait::async_trait]
pub trait ManifestStorage: Send + Sync {
    /// Write the manifest file for a job
    async fn write_manifest(&self, job_id: &str, manifest: &ManifestFile) -> Result<()>;

    /// Read the manifest file for a job
    async fn read_manifest(&self, job_id: &str) -> Result<ManifestFile>;

    /// Export the shot list of a batch
    async fn write_shot_list(
        &self,
        job_id: &str,
        batch_id: u32,
        acquisition: &Acquisition,
    ) -> Result<PathBuf>;

    /// Read back the shot list of a batch
    async fn read_shot_list(&self, job_id: &str, batch_id: u32) -> Result<Acquisition>;

    /// Write a result file for a finished batch
    async fn write_result(&self, job_id: &str, batch_id: u32, result: &BatchResultFile)
    -> Result<()>;

    /// Read a result file for a finished batch
    async fn read_result(&self, job_id: &str, batch_id: u32) -> Result<BatchResultFile>;

    /// Directory holding the outputs of a batch (decks, gradients, costs, logs)
    fn batch_dir(&self, job_id: &str, batch_id: u32) -> PathBuf;

    /// Root directory the storage lives in
    fn base_dir(&self) -> PathBuf;
}

/// Local (or shared network) filesystem implementation of ManifestStorage
///
/// Directory structure:
///   {base_dir}/jobs/{job_id}/manifest.json
///   {base_dir}/jobs/{job_id}/batches/{batch_id:04}.json
///   {base_dir}/jobs/{job_id}/batches/{batch_id:04}.result
///   {base_dir}/jobs/{job_id}/batches/{batch_id:04}/
pub struct LocalManifestStorage {
    base_dir: PathBuf,
}

impl LocalManifestStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.base_dir.join("jobs").join(job_id)
    }

    fn batches_dir(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("batches")
    }

    fn manifest_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join("manifest.json")
    }

    /// Shot list path without its `.json` extension
    fn shot_list_stem(&self, job_id: &str, batch_id: u32) -> PathBuf {
        self.batches_dir(job_id).join(format!("{:04}", batch_id))
    }

    fn result_path(&self, job_id: &str, batch_id: u32) -> PathBuf {
        self.batches_dir(job_id)
            .join(format!("{:04}.result", batch_id))
    }
}

#[async_trait::async_trait]
impl ManifestStorage for LocalManifestStorage {
    async fn write_manifest(&self, job_id: &str, manifest: &ManifestFile) -> Result<()> {
        let manifest_path = self.manifest_path(job_id);

        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create manifest directory")?;
        }

        let json =
            serde_json::to_string_pretty(manifest).context("Failed to serialize manifest")?;

        fs::write(&manifest_path, json)
            .await
            .context("Failed to write manifest file")?;

        fs::create_dir_all(self.batches_dir(job_id))
            .await
            .context("Failed to create batches directory")?;

        Ok(())
    }

    async fn read_manifest(&self, job_id: &str) -> Result<ManifestFile> {
        let manifest_path = self.manifest_path(job_id);

        let contents = fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("Failed to read manifest file {}", manifest_path.display()))?;

        let manifest: ManifestFile =
            serde_json::from_str(&contents).context("Failed to parse manifest file")?;

        Ok(manifest)
    }

    async fn write_shot_list(
        &self,
        job_id: &str,
        batch_id: u32,
        acquisition: &Acquisition,
    ) -> Result<PathBuf> {
        to_json_file(acquisition, self.shot_list_stem(job_id, batch_id))
            .await
            .with_context(|| format!("Failed to export shot list of batch {}", batch_id))
    }

    async fn read_shot_list(&self, job_id: &str, batch_id: u32) -> Result<Acquisition> {
        let mut path = self.shot_list_stem(job_id, batch_id).into_os_string();
        path.push(".json");
        from_json_file(&path)
            .await
            .with_context(|| format!("Failed to read shot list of batch {}", batch_id))
    }

    async fn write_result(
        &self,
        job_id: &str,
        batch_id: u32,
        result: &BatchResultFile,
    ) -> Result<()> {
        let result_path = self.result_path(job_id, batch_id);

        let json = serde_json::to_string_pretty(result).context("Failed to serialize result")?;

        fs::write(&result_path, json)
            .await
            .context("Failed to write result file")?;

        Ok(())
    }

    async fn read_result(&self, job_id: &str, batch_id: u32) -> Result<BatchResultFile> {
        let result_path = self.result_path(job_id, batch_id);

        let contents = fs::read_to_string(&result_path)
            .await
            .context("Failed to read result file")?;

        let result: BatchResultFile =
            serde_json::from_str(&contents).context("Failed to parse result file")?;

        Ok(result)
    }

    fn batch_dir(&self, job_id: &str, batch_id: u32) -> PathBuf {
        self.shot_list_stem(job_id, batch_id)
    }

    fn base_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }
}
