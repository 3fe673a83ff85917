use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::Arc;

use super::{BatchDispatcher, BatchHandle, BatchRequest, HandleKind};
use crate::coordination::barrier::SingleProcess;
use crate::coordination::manifest::ManifestStorage;
use crate::coordination::worker::ShotRunner;
use crate::solver::EngineLauncher;

/// Runs each batch as a task of this process, on a single rank
pub struct InlineDispatcher<L> {
    manifest_storage: Arc<dyn ManifestStorage>,
    launcher: L,
}

impl<L> InlineDispatcher<L>
where
    L: EngineLauncher + Clone + 'static,
{
    pub fn new(manifest_storage: Arc<dyn ManifestStorage>, launcher: L) -> Self {
        Self {
            manifest_storage,
            launcher,
        }
    }
}

#[async_trait]
impl<L> BatchDispatcher for InlineDispatcher<L>
where
    L: EngineLauncher + Clone + 'static,
{
    async fn submit(&self, request: &BatchRequest) -> Result<BatchHandle> {
        let runner = ShotRunner::new(
            Arc::clone(&self.manifest_storage),
            self.launcher.clone(),
            Arc::new(SingleProcess),
        );
        let batch_id = request.batch_id;
        let request = request.clone();

        let handle = tokio::spawn(async move {
            runner
                .run(
                    &request.job_id,
                    request.batch_id,
                    &request.xml,
                    request.aggregate,
                )
                .await
        });

        Ok(BatchHandle {
            batch_id,
            kind: HandleKind::Task(handle),
        })
    }

    async fn join(&self, handle: BatchHandle) -> Result<()> {
        let HandleKind::Task(task) = handle.kind else {
            bail!("Batch {} was not started in this process", handle.batch_id);
        };
        task.await?
    }
}
