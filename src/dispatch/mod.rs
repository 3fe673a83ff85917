//! Fan-out of batches to worker processes or cluster jobs

pub mod client;
pub mod inline;
pub mod launch;
pub mod local;
pub mod scheduler;

pub use client::Client;
pub use inline::InlineDispatcher;
pub use launch::{BatchRequest, LaunchOptions, LaunchOptionsBuilder};
pub use local::LocalProcessDispatcher;
pub use scheduler::{ClusterSpecBuilder, SchedulerDispatcher, SchedulerKind};

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// A submitted batch
#[derive(Debug)]
pub struct BatchHandle {
    pub batch_id: u32,
    pub(crate) kind: HandleKind,
}

#[derive(Debug)]
pub(crate) enum HandleKind {
    /// Worker process on this machine, with its log file
    Process { child: Child, log: PathBuf },
    /// Scheduler job id
    Job(String),
    /// Batch running inside this process
    Task(JoinHandle<Result<()>>),
}

/// Starts batch invocations and waits for them
#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    async fn submit(&self, request: &BatchRequest) -> Result<BatchHandle>;

    /// Wait until the batch is over; an error means the invocation failed
    async fn join(&self, handle: BatchHandle) -> Result<()>;
}
