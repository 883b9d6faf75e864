//! Lightweight tier: a confined interpreter process on this host.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tempfile::{Builder, TempDir};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::sandbox::{is_capacity_error, kill_process_group, ChildSandbox};
use super::Executor;
use crate::config::{ExecutorConfig, NetworkIsolation};
use crate::core_types::{
    ExecutionRequest, ExecutionResult, ExecutionTier, FailureKind, ResourceLimits,
};
use crate::errors::ExecutionError;

/// How long to wait for the output readers once the process group is dead.
/// A reader still blocked after this is abandoned with what it has read.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Variables the child sees in addition to `HOME` and `TMPDIR`.
const RESTRICTED_ENV: [(&str, &str); 3] = [
    ("PYTHONHASHSEED", "0"),
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONUNBUFFERED", "1"),
];

#[derive(Debug, Clone)]
pub struct SecureExecutor {
    interpreter: PathBuf,
    interpreter_args: Vec<String>,
    script_name: String,
    max_output_bytes: usize,
    max_open_files: u64,
    network: NetworkIsolation,
    workspace_root: Option<PathBuf>,
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// A pipe reader and the buffer it fills. The buffer outlives the task so
/// output survives an abandoned reader.
struct OutputReader {
    buffer: Arc<Mutex<Captured>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl SecureExecutor {
    /// Resolves the interpreter once; the child runs with an empty `PATH`.
    pub fn new(config: &ExecutorConfig) -> Result<Self, ExecutionError> {
        let interpreter = which::which(&config.interpreter)
            .map_err(|_| ExecutionError::InterpreterNotFound(config.interpreter.clone()))?;

        if config.network_isolation != NetworkIsolation::Required {
            log::warn!(
                "Network isolation for the secure executor is {:?}; child processes may reach the network",
                config.network_isolation
            );
        }

        Ok(Self {
            interpreter,
            interpreter_args: config.interpreter_args.clone(),
            script_name: config.script_name.clone(),
            max_output_bytes: config.max_output_bytes,
            max_open_files: config.max_open_files,
            network: config.network_isolation,
            workspace_root: config.workspace_root.clone(),
        })
    }

    pub fn interpreter(&self) -> &std::path::Path {
        &self.interpreter
    }

    /// Run `code` once in a fresh workspace. The workspace is removed on every
    /// path out of this function, including cancellation of the future.
    pub async fn execute(
        &self,
        code: &str,
        request_id: &str,
        timeout_seconds: u64,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let workspace = self.create_workspace(request_id)?;
        log::debug!(
            "request_id={} created workspace {}",
            request_id,
            workspace.path().display()
        );

        let result = self
            .run_in_workspace(&workspace, code, request_id, timeout_seconds, limits, cancel)
            .await;

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            log::error!(
                "request_id={} failed to remove workspace {}: {}",
                request_id,
                path.display(),
                e
            );
        }

        result
    }

    fn create_workspace(&self, request_id: &str) -> Result<TempDir, ExecutionError> {
        let prefix = format!("exec-{}-", sanitize_for_path(request_id));
        let mut builder = Builder::new();
        builder.prefix(&prefix);
        let workspace = match &self.workspace_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        workspace.map_err(ExecutionError::Workspace)
    }

    async fn run_in_workspace(
        &self,
        workspace: &TempDir,
        code: &str,
        request_id: &str,
        timeout_seconds: u64,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let script_path = workspace.path().join(&self.script_name);
        tokio::fs::write(&script_path, code)
            .await
            .map_err(ExecutionError::Workspace)?;

        let sandbox = self.sandbox_for(timeout_seconds, limits);
        let mut command = Command::new(&self.interpreter);
        command
            .args(&self.interpreter_args)
            .arg(&script_path)
            .current_dir(workspace.path())
            .env_clear()
            .envs(RESTRICTED_ENV)
            .env("HOME", workspace.path())
            .env("TMPDIR", workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        unsafe {
            command.pre_exec(move || sandbox.apply());
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| {
            let program = self.interpreter.display().to_string();
            if is_capacity_error(&source) {
                ExecutionError::ResourceExhausted { program, source }
            } else {
                ExecutionError::Spawn { program, source }
            }
        })?;
        let pid = child.id();

        log::info!(
            "request_id={} started {} (pid {:?}, timeout {}s)",
            request_id,
            self.interpreter.display(),
            pid,
            timeout_seconds
        );

        let stdout = spawn_reader(child.stdout.take(), self.max_output_bytes);
        let stderr = spawn_reader(child.stderr.take(), self.max_output_bytes);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = tokio::time::sleep(Duration::from_secs(timeout_seconds)) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        // The child leads its own session, so this also takes down anything
        // it left running in the background, which would otherwise hold the
        // output pipes open.
        if let Some(pid) = pid {
            if let Err(e) = kill_process_group(pid) {
                log::warn!(
                    "request_id={} failed to kill process group {}: {}",
                    request_id,
                    pid,
                    e
                );
            }
        }
        if !matches!(outcome, Outcome::Exited(_)) {
            // Reap so the child does not linger as a zombie.
            if let Err(e) = child.wait().await {
                log::warn!("request_id={} failed to reap child: {}", request_id, e);
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = finish_reader(stdout).await;
        let stderr = finish_reader(stderr).await;
        let output_truncated = stdout.truncated || stderr.truncated;
        if output_truncated {
            log::warn!(
                "request_id={} output exceeded {} bytes and was truncated",
                request_id,
                self.max_output_bytes
            );
        }
        let stdout = String::from_utf8_lossy(&stdout.bytes).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.bytes).into_owned();

        let mut result = match outcome {
            Outcome::Exited(status) if status.success() => {
                ExecutionResult::success(request_id, stdout, stderr, duration_ms)
            }
            Outcome::Exited(status) => {
                let (kind, exit_code, detail) = classify_exit(status, &stderr);
                ExecutionResult::failure(request_id, kind, exit_code, detail)
                    .with_output(stdout, stderr)
                    .with_duration_ms(duration_ms)
            }
            Outcome::TimedOut => ExecutionResult::failure(
                request_id,
                FailureKind::Timeout,
                -1,
                format!("execution timed out after {}s", timeout_seconds),
            )
            .with_output(stdout, stderr)
            .with_duration_ms(duration_ms),
            Outcome::Cancelled => {
                ExecutionResult::failure(request_id, FailureKind::Fatal, -1, "cancelled")
                    .with_output(stdout, stderr)
                    .with_duration_ms(duration_ms)
            }
        };
        result.output_truncated = output_truncated;

        match result.failure_kind() {
            None => log::info!(
                "request_id={} completed in {}ms",
                request_id,
                result.duration_ms
            ),
            Some(kind) => log::warn!(
                "request_id={} finished with {} (exit code {}) after {}ms",
                request_id,
                kind,
                result.exit_code,
                result.duration_ms
            ),
        }

        Ok(result)
    }

    /// CPU time is budgeted per granted core so a multi-threaded program hits
    /// the wall-clock timeout before `RLIMIT_CPU`.
    fn sandbox_for(&self, timeout_seconds: u64, limits: &ResourceLimits) -> ChildSandbox {
        let cores = limits
            .cpu_limit
            .millicores()
            .map(|millicores| millicores.div_ceil(1000))
            .unwrap_or(1)
            .max(1);
        ChildSandbox {
            cpu_seconds: timeout_seconds.saturating_mul(cores).saturating_add(1),
            address_space_bytes: limits.memory_limit.bytes().unwrap_or(u64::MAX),
            file_size_bytes: limits.disk_limit.bytes().unwrap_or(u64::MAX),
            open_files: self.max_open_files,
            network: self.network,
        }
    }
}

#[async_trait]
impl Executor for SecureExecutor {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Lightweight
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.execute(
            request.source_code(),
            request.request_id(),
            request.timeout_seconds(),
            &request.resource_limits(),
            cancel,
        )
        .await
    }
}

fn spawn_reader<R>(reader: Option<R>, limit: usize) -> Option<OutputReader>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    reader.map(|reader| {
        let buffer = Arc::new(Mutex::new(Captured::default()));
        let task = tokio::spawn(read_capped(reader, limit, buffer.clone()));
        OutputReader { buffer, task }
    })
}

/// Keeps the first `limit` bytes and keeps draining the pipe past that so
/// the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    buffer: Arc<Mutex<Captured>>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        let mut captured = buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let room = limit.saturating_sub(captured.bytes.len());
        if read > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..read.min(room)]);
    }
}

async fn finish_reader(reader: Option<OutputReader>) -> Captured {
    let Some(OutputReader { buffer, mut task }) = reader else {
        return Captured::default();
    };
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => log::warn!("Failed to read child output: {}", e),
        Ok(Err(e)) => log::warn!("Output reader task failed: {}", e),
        Err(_) => {
            log::warn!("Output pipe still open after the process group was killed");
            task.abort();
        }
    }
    let mut captured = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *captured)
}

/// Maps a non-zero exit to its failure kind, exit code and detail line.
fn classify_exit(status: ExitStatus, stderr: &str) -> (FailureKind, i64, String) {
    let last_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string);

    if let Some(signal) = status.signal() {
        let kind = match signal {
            libc::SIGXCPU | libc::SIGXFSZ | libc::SIGKILL => FailureKind::LimitExceeded,
            _ => FailureKind::RuntimeFault,
        };
        let detail = last_line.unwrap_or_else(|| format!("terminated by signal {}", signal));
        return (kind, -(signal as i64), detail);
    }

    let exit_code = status.code().map(i64::from).unwrap_or(-1);
    let kind = if stderr.contains("MemoryError") {
        FailureKind::LimitExceeded
    } else {
        FailureKind::RuntimeFault
    };
    let detail = last_line.unwrap_or_else(|| format!("process exited with code {}", exit_code));
    (kind, exit_code, detail)
}

fn sanitize_for_path(request_id: &str) -> String {
    request_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect()
}
