//! Collective synchronization between the ranks running one batch

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::debug;

use crate::config::{BARRIER_DIR, BARRIER_POLL_INTERVAL, PROCESS_GROUP_ENV_VARS, SLURM_STEP_ENV_VAR};

/// Process group running the same batch
#[async_trait]
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Block until every rank has reached the same barrier
    async fn barrier(&self) -> Result<()>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// A group of one
#[derive(Debug, Default)]
pub struct SingleProcess;

#[async_trait]
impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Barrier over a shared directory.
///
/// Barrier `n` is reached by rank `r` when it creates `<dir>/barrier/<n>/<r>`,
/// and released once `size` markers exist there. [`FileBarrier::for_run`] adds
/// a run level, `<dir>/barrier/<run>/<n>/<r>`, so a batch can be run again.
#[derive(Debug)]
pub struct FileBarrier {
    dir: PathBuf,
    rank: usize,
    size: usize,
    epoch: AtomicU64,
}

impl FileBarrier {
    pub fn new(dir: impl Into<PathBuf>, rank: usize, size: usize) -> Result<Self> {
        if size == 0 || rank >= size {
            bail!("Rank {} is outside a group of {}", rank, size);
        }
        Ok(Self {
            dir: dir.into().join(BARRIER_DIR),
            rank,
            size,
            epoch: AtomicU64::new(0),
        })
    }

    /// Keep the markers of this run apart from those of earlier runs
    pub fn for_run(mut self, run_id: &str) -> Self {
        self.dir = self.dir.join(run_id);
        self
    }

    async fn arrived(&self, epoch_dir: &Path) -> Result<usize> {
        let mut entries = fs::read_dir(epoch_dir)
            .await
            .with_context(|| format!("Failed to list barrier {}", epoch_dir.display()))?;
        let mut count = 0;
        while let Some(_entry) = entries
            .next_entry()
            .await
            .context("Failed to read barrier entry")?
        {
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl Communicator for FileBarrier {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn barrier(&self) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        let epoch_dir = self.dir.join(epoch.to_string());

        fs::create_dir_all(&epoch_dir)
            .await
            .with_context(|| format!("Failed to create barrier {}", epoch_dir.display()))?;

        let marker = epoch_dir.join(self.rank.to_string());
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!(
                    "Rank {} reached barrier {} twice; {} holds markers of an earlier run, use a fresh --run-id",
                    self.rank,
                    epoch,
                    self.dir.display()
                );
            }
            Err(e) => return Err(e).context("Failed to create barrier marker"),
        }

        loop {
            let arrived = self.arrived(&epoch_dir).await?;
            if arrived >= self.size {
                break;
            }
            debug!(
                "Barrier {}: {}/{} ranks arrived",
                epoch, arrived, self.size
            );
            tokio::time::sleep(BARRIER_POLL_INTERVAL).await;
        }

        Ok(())
    }
}

/// Rank and size of this process from the launcher's environment, if any
///
/// SLURM variables only count inside a job step: a process started directly
/// from `salloc` or a batch script inherits the task count of the whole
/// allocation.
pub fn rank_from_env<F>(lookup: F) -> Result<Option<(usize, usize)>>
where
    F: Fn(&str) -> Option<String>,
{
    let parse = |var: &str, value: String| -> Result<usize> {
        value
            .trim()
            .parse()
            .with_context(|| format!("{}={} is not a number", var, value))
    };

    for &(rank_var, size_var) in PROCESS_GROUP_ENV_VARS {
        if rank_var.starts_with("SLURM_") && lookup(SLURM_STEP_ENV_VAR).is_none() {
            continue;
        }
        match (lookup(rank_var), lookup(size_var)) {
            (None, None) => continue,
            (Some(rank), Some(size)) => {
                return Ok(Some((parse(rank_var, rank)?, parse(size_var, size)?)));
            }
            (rank, size) => bail!(
                "Incomplete process group environment: {}={:?}, {}={:?}",
                rank_var,
                rank,
                size_var,
                size
            ),
        }
    }
    Ok(None)
}

/// Communicator for this process: explicit flags win over the environment
pub fn communicator(
    shared_dir: PathBuf,
    run_id: &str,
    rank: Option<usize>,
    size: Option<usize>,
) -> Result<Box<dyn Communicator>> {
    let group = match (rank, size) {
        (Some(rank), Some(size)) => Some((rank, size)),
        (None, None) => rank_from_env(|var| std::env::var(var).ok())?,
        _ => bail!("--rank and --size must be given together"),
    };

    let comm: Box<dyn Communicator> = match group {
        Some((_, 1)) | None => Box::new(SingleProcess),
        Some((rank, size)) => {
            Box::new(FileBarrier::new(shared_dir, rank, size)?.for_run(run_id))
        }
    };
    Ok(comm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_rank_from_env() {
        assert_eq!(rank_from_env(env(&[])).unwrap(), None);
        assert_eq!(
            rank_from_env(env(&[("OMPI_COMM_WORLD_RANK", "3"), ("OMPI_COMM_WORLD_SIZE", "8")]))
                .unwrap(),
            Some((3, 8))
        );
        assert_eq!(
            rank_from_env(env(&[
                ("SLURM_STEP_ID", "0"),
                ("SLURM_PROCID", "1"),
                ("SLURM_STEP_NUM_TASKS", "2"),
            ]))
            .unwrap(),
            Some((1, 2))
        );
        assert!(rank_from_env(env(&[("PMI_RANK", "1")])).is_err());
        assert!(rank_from_env(env(&[("PMI_RANK", "x"), ("PMI_SIZE", "2")])).is_err());
    }

    #[test]
    fn test_allocation_shell_is_not_a_group() {
        // salloc/sbatch shell: job-wide task count, no step
        let allocation = [
            ("SLURM_JOB_ID", "42"),
            ("SLURM_PROCID", "0"),
            ("SLURM_NTASKS", "4"),
        ];
        assert_eq!(rank_from_env(env(&allocation)).unwrap(), None);

        // mpirun inside the allocation still wins
        let mut under_mpirun = allocation.to_vec();
        under_mpirun.extend([("OMPI_COMM_WORLD_RANK", "1"), ("OMPI_COMM_WORLD_SIZE", "2")]);
        assert_eq!(rank_from_env(env(&under_mpirun)).unwrap(), Some((1, 2)));
    }

    #[test]
    fn test_invalid_group() {
        let dir = TempDir::new().unwrap();
        assert!(FileBarrier::new(dir.path(), 2, 2).is_err());
        assert!(FileBarrier::new(dir.path(), 0, 0).is_err());
        assert!(communicator(dir.path().to_path_buf(), "r1", Some(0), None).is_err());
    }

    #[test]
    fn test_single_rank_group_needs_no_barrier() {
        let dir = TempDir::new().unwrap();
        let comm = communicator(dir.path().to_path_buf(), "r1", Some(0), Some(1)).unwrap();
        assert!(comm.is_root());
        assert_eq!(comm.size(), 1);
    }

    #[tokio::test]
    async fn test_file_barrier_releases_all_ranks() {
        let dir = TempDir::new().unwrap();
        let size = 3;

        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let barrier = Arc::new(FileBarrier::new(dir.path(), rank, size).unwrap());
                tokio::spawn(async move {
                    barrier.barrier().await.unwrap();
                    barrier.barrier().await.unwrap();
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        for epoch in ["0", "1"] {
            let markers = std::fs::read_dir(dir.path().join("barrier").join(epoch))
                .unwrap()
                .count();
            assert_eq!(markers, size);
        }
    }

    async fn pass_barriers(dir: &Path, run_id: &str, size: usize, count: usize) -> Vec<Result<()>> {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let barrier = FileBarrier::new(dir, rank, size).unwrap().for_run(run_id);
                tokio::spawn(async move {
                    for _ in 0..count {
                        barrier.barrier().await?;
                    }
                    Ok::<(), anyhow::Error>(())
                })
            })
            .collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_rerun_with_fresh_run_id() {
        let dir = TempDir::new().unwrap();

        let first = pass_barriers(dir.path(), "run-a", 2, 2).await;
        assert!(first.iter().all(|r| r.is_ok()));

        // markers of run-a are left behind and must not release run-b early
        let second = pass_barriers(dir.path(), "run-b", 2, 3).await;
        assert!(second.iter().all(|r| r.is_ok()));
        assert!(dir.path().join("barrier/run-b/2").exists());

        let reused = FileBarrier::new(dir.path(), 0, 2).unwrap().for_run("run-a");
        let err = reused.barrier().await.unwrap_err();
        assert!(err.to_string().contains("--run-id"));
    }

    #[tokio::test]
    async fn test_file_barrier_waits_for_missing_rank() {
        let dir = TempDir::new().unwrap();
        let barrier = FileBarrier::new(dir.path(), 0, 2).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(500), barrier.barrier()).await;
        assert!(waited.is_err());
    }
}
