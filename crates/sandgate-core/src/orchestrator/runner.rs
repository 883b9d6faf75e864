//! The process that runs inside a heavy-tier unit.
//!
//! The unit receives its program and identity through environment variables
//! (see `spec::ENV_*`), runs it once, stores the result, sends the
//! completion notification and exits with a `runner_exit` code so the
//! orchestrator can tell failure kinds apart without reading the result.

use tokio_util::sync::CancellationToken;

use super::job::runner_exit;
use super::spec::{
    ENV_CODE, ENV_CPU_LIMIT, ENV_DISK_LIMIT, ENV_JOB_ID, ENV_MEMORY_LIMIT, ENV_NOTIFY_URL,
    ENV_REQUEST_ID, ENV_RESULT_DIR, ENV_TIMEOUT,
};
use crate::core_types::{ExecutionRequest, ExecutionResult, FailureKind, Quantity, ResourceLimits};
use crate::errors::ConfigError;
use crate::executors::Executor;
use crate::notify::{CompletionNotification, CompletionNotifier, ResultSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEnv {
    pub code: String,
    pub request_id: String,
    pub job_id: String,
    /// The unit's limits; `timeout_seconds` is the program's deadline.
    pub limits: ResourceLimits,
    pub result_dir: String,
    pub notify_url: Option<String>,
}

impl RunnerEnv {
    /// `CODE` and `REQUEST_ID` are required. The job id falls back to the
    /// request id; the timeout and each limit fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ConfigError::MissingEnv(name.to_string()))
        };

        let code = required(ENV_CODE)?;
        let request_id = required(ENV_REQUEST_ID)?;
        let job_id = lookup(ENV_JOB_ID).unwrap_or_else(|| request_id.clone());

        let defaults = ResourceLimits::default();
        let timeout_seconds = match lookup(ENV_TIMEOUT) {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!("{} must be a whole number of seconds, got '{}'", ENV_TIMEOUT, raw))
            })?,
            None => defaults.timeout_seconds,
        };
        let quantity = |name: &str, default: Quantity| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(Quantity::new)
                .unwrap_or(default)
        };
        let limits = ResourceLimits {
            cpu_limit: quantity(ENV_CPU_LIMIT, defaults.cpu_limit),
            memory_limit: quantity(ENV_MEMORY_LIMIT, defaults.memory_limit),
            disk_limit: quantity(ENV_DISK_LIMIT, defaults.disk_limit),
            timeout_seconds,
        };
        limits.validate()?;

        Ok(Self {
            code,
            request_id,
            job_id,
            limits,
            result_dir: lookup(ENV_RESULT_DIR).unwrap_or_else(|| "/results".to_string()),
            notify_url: lookup(ENV_NOTIFY_URL).filter(|url| !url.is_empty()),
        })
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.limits.timeout_seconds
    }

    /// The unit runs its program once; retries belong to the caller.
    pub fn request(&self) -> ExecutionRequest {
        ExecutionRequest::new(self.code.clone())
            .with_request_id(self.request_id.clone())
            .with_max_retries(0)
            .with_resource_limits(self.limits.clone())
    }
}

/// Runs the unit's program once and delivers the outcome. Store and
/// notification failures are logged; they never change the exit code.
pub async fn run_unit(
    env: &RunnerEnv,
    executor: &dyn Executor,
    sink: &dyn ResultSink,
    notifier: &dyn CompletionNotifier,
    cancel: &CancellationToken,
) -> ExecutionResult {
    log::info!(
        "request_id={} job_id={} runner starting, timeout={}s",
        env.request_id,
        env.job_id,
        env.timeout_seconds()
    );

    let mut result = match executor.run(&env.request(), cancel).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("request_id={} execution machinery failed: {}", env.request_id, e);
            ExecutionResult::failure(&env.request_id, e.kind(), -1, e.to_string())
        }
    };
    result.job_id = Some(env.job_id.clone());

    let location = match sink.store(&result).await {
        Ok(location) => Some(location),
        Err(e) => {
            log::error!("request_id={} failed to store result: {}", env.request_id, e);
            None
        }
    };

    let notification = CompletionNotification::for_result(&result, location);
    if let Err(e) = notifier.notify(&notification).await {
        log::error!(
            "request_id={} completion notification failed: {}",
            env.request_id,
            e
        );
    }

    result
}

pub fn exit_code_for(result: &ExecutionResult) -> i64 {
    if result.is_success() {
        return runner_exit::SUCCESS;
    }
    runner_exit::for_failure(result.failure_kind().unwrap_or(FailureKind::RuntimeFault))
}
