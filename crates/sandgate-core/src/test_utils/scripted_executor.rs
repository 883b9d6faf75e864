// src/test_utils/scripted_executor.rs
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core_types::{
    ExecutionRequest, ExecutionResult, ExecutionTier, FailureKind,
};
use crate::errors::{ExecutionError, JobError};
use crate::executors::Executor;

#[derive(Debug, Clone)]
pub enum Step {
    Succeed(&'static str),
    Fail(FailureKind, &'static str),
    /// `Err` whose kind is `ResourceExhausted`.
    Unavailable,
    /// `Err` whose kind is `Fatal`.
    Broken,
}

/// Executor that plays back a fixed list of outcomes, one per call. The
/// last step repeats once the list is used up.
pub struct ScriptedExecutor {
    tier: ExecutionTier,
    steps: Mutex<VecDeque<Step>>,
    pub calls: Mutex<Vec<Instant>>,
    pub requests: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    pub fn new(tier: ExecutionTier, steps: Vec<Step>) -> Self {
        Self {
            tier,
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().cloned().unwrap_or(Step::Succeed(""))
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn tier(&self) -> ExecutionTier {
        self.tier
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        _cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.calls.lock().unwrap().push(Instant::now());
        self.requests.lock().unwrap().push(request.clone());

        match self.next_step() {
            Step::Succeed(stdout) => Ok(ExecutionResult::success(
                request.request_id(),
                stdout.to_string(),
                String::new(),
                5,
            )),
            Step::Fail(kind, detail) => {
                let exit_code = if kind == FailureKind::Timeout { -1 } else { 1 };
                Ok(ExecutionResult::failure(request.request_id(), kind, exit_code, detail)
                    .with_output(String::new(), format!("{}\n", detail)))
            }
            Step::Unavailable => Err(ExecutionError::Job(JobError::SchedulerUnavailable(
                "scheduler unreachable".to_string(),
            ))),
            Step::Broken => Err(ExecutionError::InterpreterNotFound("python3".to_string())),
        }
    }
}
