//! Batch submission to SLURM or LSF
//!
//! One job script per batch is written next to the batch shot list, submitted
//! with `sbatch`/`bsub`, then polled until the job leaves the queue.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{BatchDispatcher, BatchHandle, BatchRequest, HandleKind};
use crate::config::{SCHEDULER_MAX_QUERY_FAILURES, SCHEDULER_POLL_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Slurm,
    Lsf,
}

/// Resources requested for every batch job
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
pub struct ClusterSpec {
    pub kind: SchedulerKind,
    pub job_name: String,
    #[builder(default = "1")]
    pub nodes: usize,
    /// Tasks per job
    pub cores: usize,
    /// Partition (SLURM) or queue (LSF)
    #[builder(default)]
    pub queue: Option<String>,
    /// `HH:MM` (LSF) or `HH:MM:SS` (SLURM)
    #[builder(default)]
    pub walltime: Option<String>,
    /// Program started in each job
    pub executable: PathBuf,
    /// Raw scheduler options, one directive each, e.g. `-p pdebug`
    #[builder(default)]
    pub extra: Vec<String>,
}

/// Scheduler view of a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed(String),
    /// No longer known to the queue
    Gone,
}

impl JobState {
    fn is_finished(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl ClusterSpec {
    /// Job script running one batch
    pub fn render_script(&self, request: &BatchRequest, log: &std::path::Path) -> String {
        let name = format!("{}-{:04}", self.job_name, request.batch_id);
        let mut lines = vec!["#!/bin/bash".to_string()];

        let (prefix, launcher) = match self.kind {
            SchedulerKind::Slurm => {
                lines.push(format!("#SBATCH --job-name={}", name));
                lines.push(format!("#SBATCH --nodes={}", self.nodes));
                lines.push(format!("#SBATCH --ntasks={}", self.cores));
                if let Some(queue) = &self.queue {
                    lines.push(format!("#SBATCH --partition={}", queue));
                }
                if let Some(walltime) = &self.walltime {
                    lines.push(format!("#SBATCH --time={}", walltime));
                }
                lines.push(format!("#SBATCH --output={}", log.display()));
                ("#SBATCH", format!("srun -n {}", self.cores))
            }
            SchedulerKind::Lsf => {
                lines.push(format!("#BSUB -J {}", name));
                lines.push(format!("#BSUB -nnodes {}", self.nodes));
                lines.push(format!("#BSUB -n {}", self.cores));
                if let Some(queue) = &self.queue {
                    lines.push(format!("#BSUB -q {}", queue));
                }
                if let Some(walltime) = &self.walltime {
                    lines.push(format!("#BSUB -W {}", walltime));
                }
                lines.push(format!("#BSUB -o {}", log.display()));
                ("#BSUB", format!("mpirun -np {}", self.cores))
            }
        };

        for directive in &self.extra {
            lines.push(format!("{} {}", prefix, directive));
        }

        lines.push(String::new());
        let mut command = vec![launcher, self.executable.display().to_string()];
        command.extend(request.run_batch_args().iter().map(|a| shell_quote(a)));
        lines.push(command.join(" "));
        lines.push(String::new());
        lines.join("\n")
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`
pub fn parse_slurm_submit(output: &str) -> Result<String> {
    let id = output.trim().split(';').next().unwrap_or("").trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        bail!("Unexpected sbatch output: {:?}", output.trim());
    }
    Ok(id.to_string())
}

/// `bsub` prints `Job <id> is submitted to queue <q>.`
pub fn parse_lsf_submit(output: &str) -> Result<String> {
    output
        .split_once("Job <")
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(id, _)| id.to_string())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .with_context(|| format!("Unexpected bsub output: {:?}", output.trim()))
}

/// State from `squeue -h -j <id> -o %T`
pub fn parse_slurm_state(output: &str) -> JobState {
    match output.trim() {
        "" => JobState::Gone,
        "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        other => JobState::Failed(other.to_string()),
    }
}

/// State from `bjobs -noheader -o stat <id>`
pub fn parse_lsf_state(output: &str) -> JobState {
    match output.trim() {
        "" => JobState::Gone,
        "PEND" | "PSUSP" | "WAIT" => JobState::Pending,
        "RUN" | "USUSP" | "SSUSP" => JobState::Running,
        "DONE" => JobState::Completed,
        other => JobState::Failed(other.to_string()),
    }
}

/// Submits one scheduler job per batch
#[derive(Debug, Clone)]
pub struct SchedulerDispatcher {
    spec: ClusterSpec,
    poll_interval: Duration,
}

impl SchedulerDispatcher {
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            spec,
            poll_interval: SCHEDULER_POLL_INTERVAL,
        }
    }

    async fn run(program: &str, args: &[&str], stdin: Option<&PathBuf>) -> Result<String> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(path) = stdin {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            command.stdin(file);
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", program))?;

        if !output.status.success() {
            bail!(
                "{} failed with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn state(&self, job_id: &str) -> Result<JobState> {
        Ok(match self.spec.kind {
            SchedulerKind::Slurm => {
                match Self::run("squeue", &["-h", "-j", job_id, "-o", "%T"], None).await {
                    Ok(output) => parse_slurm_state(&output),
                    // squeue forgets finished jobs
                    Err(e) if e.to_string().contains("Invalid job id") => JobState::Gone,
                    Err(e) => return Err(e),
                }
            }
            SchedulerKind::Lsf => parse_lsf_state(
                &Self::run("bjobs", &["-noheader", "-o", "stat", job_id], None).await?,
            ),
        })
    }
}

#[async_trait]
impl BatchDispatcher for SchedulerDispatcher {
    async fn submit(&self, request: &BatchRequest) -> Result<BatchHandle> {
        let script_path = request.batch_file("sh");
        let log = request.batch_file("log");
        let script = self.spec.render_script(request, &log);

        if let Some(parent) = script_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create batch directory")?;
        }
        tokio::fs::write(&script_path, script)
            .await
            .with_context(|| format!("Failed to write job script {}", script_path.display()))?;

        let job_id = match self.spec.kind {
            SchedulerKind::Slurm => {
                let script = script_path.display().to_string();
                parse_slurm_submit(&Self::run("sbatch", &["--parsable", &script], None).await?)?
            }
            SchedulerKind::Lsf => {
                parse_lsf_submit(&Self::run("bsub", &[], Some(&script_path)).await?)?
            }
        };

        info!("Batch {} submitted as job {}", request.batch_id, job_id);
        Ok(BatchHandle {
            batch_id: request.batch_id,
            kind: HandleKind::Job(job_id),
        })
    }

    async fn join(&self, handle: BatchHandle) -> Result<()> {
        let HandleKind::Job(job_id) = handle.kind else {
            bail!("Batch {} was not submitted to a scheduler", handle.batch_id);
        };

        let mut failures = 0;
        loop {
            let state = match self.state(&job_id).await {
                Ok(state) => {
                    failures = 0;
                    state
                }
                Err(e) => {
                    failures += 1;
                    if failures >= SCHEDULER_MAX_QUERY_FAILURES {
                        return Err(e).with_context(|| {
                            format!("Lost track of job {} of batch {}", job_id, handle.batch_id)
                        });
                    }
                    warn!("Failed to query job {}: {:#}", job_id, e);
                    JobState::Pending
                }
            };
            debug!("Job {} of batch {}: {:?}", job_id, handle.batch_id, state);

            if state.is_finished() {
                return match state {
                    JobState::Failed(reason) => {
                        bail!("Job {} of batch {} ended {}", job_id, handle.batch_id, reason)
                    }
                    _ => Ok(()),
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LaunchOptionsBuilder;
    use std::path::Path;

    fn spec(kind: SchedulerKind) -> ClusterSpec {
        ClusterSpecBuilder::default()
            .kind(kind)
            .job_name("pygeosx")
            .cores(4usize)
            .queue(Some("pdebug".to_string()))
            .executable("/opt/fwi/bin/fwi-shot-driver")
            .extra(vec!["--exclusive".to_string()])
            .build()
            .unwrap()
    }

    fn request() -> BatchRequest {
        BatchRequest {
            job_id: "job".to_string(),
            batch_id: 3,
            manifest_dir: PathBuf::from("/scratch/run"),
            xml: PathBuf::from("/data/my deck.xml"),
            geosx: PathBuf::from("/opt/geosx"),
            launch: LaunchOptionsBuilder::default()
                .cores(4usize)
                .x_partition(2usize)
                .y_partition(2usize)
                .build()
                .unwrap(),
            aggregate: false,
            shot_count: 1,
            run_id: "r1".to_string(),
        }
    }

    #[test]
    fn test_slurm_script() {
        let script = spec(SchedulerKind::Slurm).render_script(&request(), Path::new("/tmp/3.log"));
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=pygeosx-0003\n"));
        assert!(script.contains("#SBATCH --nodes=1\n"));
        assert!(script.contains("#SBATCH --ntasks=4\n"));
        assert!(script.contains("#SBATCH --partition=pdebug\n"));
        assert!(script.contains("#SBATCH --exclusive\n"));
        assert!(script.contains("srun -n 4 /opt/fwi/bin/fwi-shot-driver run-batch"));
        assert!(script.contains("--xml '/data/my deck.xml'"));
        assert!(!script.contains("--time"));
    }

    #[test]
    fn test_lsf_script() {
        let script = spec(SchedulerKind::Lsf).render_script(&request(), Path::new("/tmp/3.log"));
        assert!(script.contains("#BSUB -J pygeosx-0003\n"));
        assert!(script.contains("#BSUB -q pdebug\n"));
        assert!(script.contains("#BSUB -o /tmp/3.log\n"));
        assert!(script.contains("mpirun -np 4 /opt/fwi/bin/fwi-shot-driver run-batch"));
    }

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(parse_slurm_submit("12345\n").unwrap(), "12345");
        assert_eq!(parse_slurm_submit("12345;cluster\n").unwrap(), "12345");
        assert!(parse_slurm_submit("error").is_err());

        assert_eq!(
            parse_lsf_submit("Job <4242> is submitted to queue <pdebug>.\n").unwrap(),
            "4242"
        );
        assert!(parse_lsf_submit("Request aborted").is_err());
    }

    #[test]
    fn test_parse_job_state() {
        assert_eq!(parse_slurm_state("PENDING\n"), JobState::Pending);
        assert_eq!(parse_slurm_state("RUNNING"), JobState::Running);
        assert_eq!(parse_slurm_state(""), JobState::Gone);
        assert_eq!(parse_slurm_state("TIMEOUT"), JobState::Failed("TIMEOUT".to_string()));
        assert!(JobState::Gone.is_finished());

        assert_eq!(parse_lsf_state("PEND"), JobState::Pending);
        assert_eq!(parse_lsf_state("DONE"), JobState::Completed);
        assert_eq!(parse_lsf_state("EXIT"), JobState::Failed("EXIT".to_string()));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("--batch-id"), "--batch-id");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
