//! The heavy tier as an `Executor`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::JobOrchestrator;
use crate::core_types::{ExecutionRequest, ExecutionResult, ExecutionTier};
use crate::errors::{ExecutionError, JobError};
use crate::executors::Executor;

/// Submits each attempt as a scheduler job and waits for it to finish.
#[derive(Clone)]
pub struct HeavyExecutor {
    orchestrator: JobOrchestrator,
}

impl HeavyExecutor {
    pub fn new(orchestrator: JobOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }
}

#[async_trait]
impl Executor for HeavyExecutor {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Heavy
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let record = self
            .orchestrator
            .submit(
                request.source_code(),
                request.request_id(),
                &request.resource_limits(),
            )
            .await?;

        tokio::select! {
            result = self.orchestrator.await_completion(&record.job_id) => Ok(result?),
            _ = cancel.cancelled() => {
                log::info!(
                    "request_id={} cancelled, stopping job_id={}",
                    request.request_id(),
                    record.job_id
                );
                let cancelled = self.orchestrator.cancel(&record.job_id).await?;
                cancelled
                    .to_execution_result()
                    .ok_or_else(|| ExecutionError::Job(JobError::WatcherGone(record.job_id.clone())))
            }
        }
    }
}
