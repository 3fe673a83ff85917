use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BatchDispatcher, BatchHandle, BatchRequest, HandleKind};

/// Runs every batch as a child process of this machine, through `mpirun` when
/// the batch spans several cores
#[derive(Debug, Clone)]
pub struct LocalProcessDispatcher {
    executable: PathBuf,
    mpirun: String,
}

impl LocalProcessDispatcher {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            mpirun: "mpirun".to_string(),
        }
    }

    /// Dispatcher re-invoking the running binary
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the running executable")?;
        Ok(Self::new(exe))
    }

    pub fn with_mpirun(mut self, mpirun: impl Into<String>) -> Self {
        self.mpirun = mpirun.into();
        self
    }

    /// Program and arguments starting one batch
    ///
    /// A single-core batch names its group explicitly, so it never picks up the
    /// task count of an enclosing allocation.
    pub fn command_line(&self, request: &BatchRequest) -> (String, Vec<String>) {
        let exe = self.executable.display().to_string();
        if request.launch.cores > 1 {
            let mut args = vec!["-np".to_string(), request.launch.cores.to_string(), exe];
            args.extend(request.run_batch_args());
            (self.mpirun.clone(), args)
        } else {
            let mut args = request.run_batch_args();
            args.extend(["--rank", "0", "--size", "1"].map(String::from));
            (exe, args)
        }
    }
}

#[async_trait]
impl BatchDispatcher for LocalProcessDispatcher {
    async fn submit(&self, request: &BatchRequest) -> Result<BatchHandle> {
        let (program, args) = self.command_line(request);
        let log = request.batch_file("log");

        if let Some(parent) = log.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create batch log directory")?;
        }
        let stdout = std::fs::File::create(&log)
            .with_context(|| format!("Failed to create {}", log.display()))?;
        let stderr = stdout
            .try_clone()
            .context("Failed to share batch log handle")?;

        debug!("Starting batch {}: {} {}", request.batch_id, program, args.join(" "));
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", program))?;

        info!("Batch {} started, log at {}", request.batch_id, log.display());
        Ok(BatchHandle {
            batch_id: request.batch_id,
            kind: HandleKind::Process { child, log },
        })
    }

    async fn join(&self, handle: BatchHandle) -> Result<()> {
        let HandleKind::Process { mut child, log } = handle.kind else {
            bail!("Batch {} was not started as a local process", handle.batch_id);
        };

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for batch {}", handle.batch_id))?;

        if !status.success() {
            bail!(
                "Batch {} exited with {} (see {})",
                handle.batch_id,
                status,
                log.display()
            );
        }
        Ok(())
    }
}
