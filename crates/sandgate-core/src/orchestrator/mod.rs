//! Heavy-tier job submission and supervision.
//!
//! Each submitted job gets one watcher task. The watcher is the only writer
//! of its `JobRecord` and publishes every change through a `watch` channel,
//! so readers (`get`, `await_completion`) never block the watcher and never
//! see a record move backward.

pub mod docker;
pub mod heavy;
pub mod job;
pub mod runner;
pub mod scheduler;
pub mod spec;

pub use docker::DockerScheduler;
pub use heavy::HeavyExecutor;
pub use job::{job_id_for, runner_exit, JobRecord, JobState};
pub use runner::{exit_code_for, run_unit, RunnerEnv};
pub use scheduler::{JobScheduler, UnitObservation};
pub use spec::JobSpec;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::core_types::{ExecutionResult, FailureKind, ResourceLimits};
use crate::errors::JobError;

#[derive(Clone)]
struct JobHandle {
    /// Distinguishes a resubmitted job from the one it replaced.
    generation: u64,
    record: watch::Receiver<JobRecord>,
    cancel: CancellationToken,
    /// Skips the post-completion TTL so the unit is deleted right away.
    expire: CancellationToken,
}

impl JobHandle {
    /// The slot can be reused once its watcher has cleaned up or died.
    fn is_vacant(&self) -> bool {
        let state = self.record.borrow().state;
        state == JobState::Cleaned || self.record.has_changed().is_err()
    }
}

struct Inner {
    scheduler: Arc<dyn JobScheduler>,
    config: OrchestratorConfig,
    jobs: RwLock<HashMap<String, JobHandle>>,
    next_generation: AtomicU64,
}

/// Submits heavy code to a `JobScheduler` and tracks every job until its
/// unit has been deleted.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(scheduler: Arc<dyn JobScheduler>, config: OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                config,
                jobs: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Submits `code` as one unit and returns its `Pending` record.
    ///
    /// The job id is derived from `request_id`, so a retry of the same
    /// request reuses it: a finished predecessor is cleaned up first, a live
    /// one makes this call fail with `JobError::Duplicate`.
    pub async fn submit(
        &self,
        code: &str,
        request_id: &str,
        limits: &ResourceLimits,
    ) -> Result<JobRecord, JobError> {
        let job_id = job_id_for(request_id);
        let spec = JobSpec::build(&job_id, request_id, code, limits, &self.inner.config)?;

        self.retire_finished(&job_id).await?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let record = JobRecord::new(&job_id, request_id);
        let (tx, rx) = watch::channel(record.clone());
        let handle = JobHandle {
            generation,
            record: rx,
            cancel: CancellationToken::new(),
            expire: CancellationToken::new(),
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            if let Some(existing) = jobs.get(&job_id) {
                if !existing.is_vacant() {
                    return Err(JobError::Duplicate(job_id));
                }
            }
            jobs.insert(job_id.clone(), handle.clone());
        }

        if let Err(e) = self.inner.scheduler.submit(&spec).await {
            log::error!(
                "request_id={} job_id={} submission failed: {}",
                request_id,
                job_id,
                e
            );
            remove_if_current(&self.inner, &job_id, generation).await;
            return Err(e);
        }

        log::info!(
            "request_id={} job_id={} submitted (cpu={}, memory={}, deadline={}s)",
            request_id,
            job_id,
            limits.cpu_limit,
            limits.memory_limit,
            self.inner.config.job_deadline_seconds
        );

        tokio::spawn(watch_job(
            self.inner.clone(),
            job_id,
            generation,
            tx,
            handle.cancel,
            handle.expire,
        ));

        Ok(record)
    }

    /// Suspends until the job reaches a finished state and returns its result.
    pub async fn await_completion(&self, job_id: &str) -> Result<ExecutionResult, JobError> {
        let mut rx = self.handle(job_id).await?.record;
        let record = rx
            .wait_for(|record| record.state.is_terminal())
            .await
            .map_err(|_| JobError::WatcherGone(job_id.to_string()))?
            .clone();
        record
            .to_execution_result()
            .ok_or_else(|| JobError::WatcherGone(job_id.to_string()))
    }

    /// Stops a live job. The unit gets its grace period before it is
    /// killed; the record ends `Failed` with detail `cancelled`. Cancelling
    /// a job that already finished returns its record unchanged.
    pub async fn cancel(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let handle = self.handle(job_id).await?;
        handle.cancel.cancel();
        let mut rx = handle.record;
        let record = rx
            .wait_for(|record| record.state.is_terminal())
            .await
            .map_err(|_| JobError::WatcherGone(job_id.to_string()))?
            .clone();
        Ok(record)
    }

    pub async fn get(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let handle = self.handle(job_id).await?;
        let record = handle.record.borrow().clone();
        Ok(record)
    }

    /// Every tracked job, oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let jobs = self.inner.jobs.read().await;
        let mut records: Vec<JobRecord> = jobs
            .values()
            .map(|handle| handle.record.borrow().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Cancels live jobs, skips the TTL of finished ones and waits until
    /// every unit has been deleted.
    pub async fn shutdown(&self) {
        let handles: Vec<JobHandle> = self.inner.jobs.read().await.values().cloned().collect();
        for handle in &handles {
            handle.cancel.cancel();
            handle.expire.cancel();
        }
        for handle in handles {
            let mut rx = handle.record;
            let _ = rx.wait_for(|record| record.state == JobState::Cleaned).await;
        }
    }

    async fn handle(&self, job_id: &str) -> Result<JobHandle, JobError> {
        self.inner
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    async fn retire_finished(&self, job_id: &str) -> Result<(), JobError> {
        let Ok(handle) = self.handle(job_id).await else {
            return Ok(());
        };
        if handle.is_vacant() {
            return Ok(());
        }
        let state = handle.record.borrow().state;
        if !state.is_finished() {
            return Err(JobError::Duplicate(job_id.to_string()));
        }

        log::debug!("job_id={} resubmitted, deleting the finished unit first", job_id);
        handle.expire.cancel();
        let mut rx = handle.record;
        // A closed channel means the watcher is gone, which also frees the slot.
        let _ = rx.wait_for(|record| record.state == JobState::Cleaned).await;
        Ok(())
    }
}

async fn remove_if_current(inner: &Inner, job_id: &str, generation: u64) {
    let mut jobs = inner.jobs.write().await;
    if jobs.get(job_id).map(|handle| handle.generation) == Some(generation) {
        jobs.remove(job_id);
    }
}

/// Applies `change` to the record and notifies readers. A rejected
/// transition is logged and publishes nothing.
fn update(
    tx: &watch::Sender<JobRecord>,
    change: impl FnOnce(&mut JobRecord) -> Result<(), JobError>,
) {
    tx.send_if_modified(|record| match change(record) {
        Ok(()) => true,
        Err(e) => {
            log::error!("job_id={} {}", record.job_id, e);
            false
        }
    });
}

fn finish_failed(tx: &watch::Sender<JobRecord>, exit_code: Option<i64>, detail: &str, kind: FailureKind) {
    let detail = detail.to_string();
    update(tx, |record| {
        record.finish(JobState::Failed, exit_code, Some(detail), Some(kind))
    });
}

async fn terminate_unit(inner: &Inner, job_id: &str) {
    let grace = Duration::from_secs(inner.config.grace_period_seconds);
    if let Err(e) = inner.scheduler.terminate(job_id, grace).await {
        log::error!("job_id={} failed to terminate unit: {}", job_id, e);
    }
}

/// Deadlines past what `Instant` can hold are pushed out to thirty years.
fn deadline_after(seconds: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_secs(seconds))
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

async fn watch_job(
    inner: Arc<Inner>,
    job_id: String,
    generation: u64,
    tx: watch::Sender<JobRecord>,
    cancel: CancellationToken,
    expire: CancellationToken,
) {
    let poll = Duration::from_millis(inner.config.poll_interval_ms);
    let deadline = deadline_after(inner.config.job_deadline_seconds);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("job_id={} cancelled, terminating unit", job_id);
                terminate_unit(&inner, &job_id).await;
                finish_failed(&tx, None, "cancelled", FailureKind::Fatal);
                break;
            }
            _ = sleep_until(deadline) => {
                log::warn!(
                    "job_id={} not finished after {}s, terminating unit",
                    job_id,
                    inner.config.job_deadline_seconds
                );
                terminate_unit(&inner, &job_id).await;
                finish_failed(&tx, None, "deadline exceeded", FailureKind::Fatal);
                break;
            }
            _ = sleep(poll) => {}
        }

        let observation = match inner.scheduler.observe(&job_id).await {
            Ok(observation) => observation,
            Err(e) => {
                // The deadline still bounds a scheduler that stays unreachable.
                log::warn!("job_id={} observation failed: {}", job_id, e);
                continue;
            }
        };

        match observation {
            UnitObservation::Pending => {}
            UnitObservation::Running => {
                let state = tx.borrow().state;
                if state == JobState::Pending {
                    log::debug!("job_id={} is running", job_id);
                    update(&tx, |record| record.advance(JobState::Running));
                }
            }
            UnitObservation::Succeeded => {
                log::info!("job_id={} succeeded", job_id);
                update(&tx, |record| {
                    record.finish(JobState::Succeeded, Some(runner_exit::SUCCESS), None, None)
                });
                break;
            }
            UnitObservation::Failed {
                exit_code,
                oom_killed,
            } => {
                let (detail, kind) = if oom_killed {
                    (
                        "unit was killed for exceeding its memory limit".to_string(),
                        FailureKind::LimitExceeded,
                    )
                } else {
                    match exit_code {
                        Some(code) => (
                            format!("unit exited with code {}", code),
                            runner_exit::failure_kind(code),
                        ),
                        None => ("unit failed".to_string(), FailureKind::RuntimeFault),
                    }
                };
                log::warn!("job_id={} failed: {}", job_id, detail);
                update(&tx, |record| {
                    record.oom_killed = oom_killed;
                    record.finish(JobState::Failed, exit_code, Some(detail), Some(kind))
                });
                break;
            }
            UnitObservation::Missing => {
                log::error!("job_id={} disappeared from the scheduler", job_id);
                finish_failed(&tx, None, "unit disappeared from scheduler", FailureKind::Fatal);
                break;
            }
        }
    }

    let ttl = Duration::from_secs(inner.config.ttl_seconds_after_finished);
    tokio::select! {
        _ = sleep(ttl) => {}
        _ = expire.cancelled() => {}
    }

    if let Err(e) = inner.scheduler.delete(&job_id).await {
        log::error!("job_id={} failed to delete unit: {}", job_id, e);
    }
    update(&tx, |record| record.advance(JobState::Cleaned));
    remove_if_current(&inner, &job_id, generation).await;
    log::debug!("job_id={} cleaned up", job_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fake_scheduler::FakeScheduler;

    fn orchestrator(scheduler: Arc<FakeScheduler>) -> JobOrchestrator {
        let config = OrchestratorConfig {
            poll_interval_ms: 1000,
            job_deadline_seconds: 60,
            ttl_seconds_after_finished: 300,
            ..OrchestratorConfig::default()
        };
        JobOrchestrator::new(scheduler, config)
    }

    fn limits() -> ResourceLimits {
        ResourceLimits::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_job_lifecycle() {
        let scheduler = Arc::new(FakeScheduler::new(vec![
            UnitObservation::Pending,
            UnitObservation::Running,
            UnitObservation::Succeeded,
        ]));
        let orchestrator = orchestrator(scheduler.clone());

        let record = orchestrator
            .submit("import pandas\nprint(1)\n", "req-1", &limits())
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.job_id, job_id_for("req-1"));
        assert_eq!(scheduler.submissions(), 1);

        let result = orchestrator.await_completion(&record.job_id).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.job_id.as_deref(), Some(record.job_id.as_str()));

        let finished = orchestrator.get(&record.job_id).await.unwrap();
        assert_eq!(finished.state, JobState::Succeeded);
        assert_eq!(finished.exit_code, Some(0));

        // The unit is kept until the TTL runs out, then deleted and forgotten.
        sleep(Duration::from_secs(301)).await;
        assert!(scheduler.was_deleted(&record.job_id));
        assert!(matches!(
            orchestrator.get(&record.job_id).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_codes_map_to_failure_kinds() {
        let cases = [
            (Some(1), false, FailureKind::RuntimeFault),
            (Some(runner_exit::TIMEOUT), false, FailureKind::Timeout),
            (Some(runner_exit::LIMIT_EXCEEDED), false, FailureKind::LimitExceeded),
            (Some(137), true, FailureKind::LimitExceeded),
        ];

        for (index, (exit_code, oom_killed, expected)) in cases.into_iter().enumerate() {
            let scheduler = Arc::new(FakeScheduler::new(vec![
                UnitObservation::Running,
                UnitObservation::Failed {
                    exit_code,
                    oom_killed,
                },
            ]));
            let orchestrator = orchestrator(scheduler);
            let request_id = format!("req-{}", index);
            let record = orchestrator.submit("print(1)", &request_id, &limits()).await.unwrap();

            let result = orchestrator.await_completion(&record.job_id).await.unwrap();
            assert_eq!(result.failure_kind(), Some(expected), "case {}", index);

            let finished = orchestrator.get(&record.job_id).await.unwrap();
            assert_eq!(finished.state, JobState::Failed);
            assert_eq!(finished.oom_killed, oom_killed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_job_hits_deadline() {
        let scheduler = Arc::new(FakeScheduler::new(vec![UnitObservation::Running]));
        let orchestrator = orchestrator(scheduler.clone());

        let record = orchestrator.submit("print(1)", "req-stuck", &limits()).await.unwrap();
        let started = Instant::now();
        let result = orchestrator.await_completion(&record.job_id).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(result.failure_kind(), Some(FailureKind::Fatal));
        assert_eq!(result.error_detail.as_deref(), Some("deadline exceeded"));
        assert!(scheduler.was_terminated(&record.job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_deadline_still_completes() {
        let scheduler = Arc::new(FakeScheduler::new(vec![
            UnitObservation::Running,
            UnitObservation::Succeeded,
        ]));
        let config = OrchestratorConfig {
            poll_interval_ms: 1000,
            job_deadline_seconds: u64::MAX,
            ..OrchestratorConfig::default()
        };
        let orchestrator = JobOrchestrator::new(scheduler, config);

        let record = orchestrator.submit("print(1)", "req-long", &limits()).await.unwrap();
        let result = orchestrator.await_completion(&record.job_id).await.unwrap();
        assert!(result.is_success());
        assert!(deadline_after(u64::MAX) > Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_duplicate_is_rejected() {
        let scheduler = Arc::new(FakeScheduler::new(vec![UnitObservation::Running]));
        let orchestrator = orchestrator(scheduler.clone());

        orchestrator.submit("print(1)", "req-dup", &limits()).await.unwrap();
        let err = orchestrator
            .submit("print(2)", "req-dup", &limits())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Duplicate(_)));
        assert_eq!(scheduler.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_can_be_resubmitted() {
        let scheduler = Arc::new(FakeScheduler::new(vec![UnitObservation::Succeeded]));
        let orchestrator = orchestrator(scheduler.clone());

        let first = orchestrator.submit("print(1)", "req-again", &limits()).await.unwrap();
        orchestrator.await_completion(&first.job_id).await.unwrap();

        let second = orchestrator.submit("print(1)", "req-again", &limits()).await.unwrap();
        assert_eq!(first.job_id, second.job_id);
        assert!(scheduler.was_deleted(&first.job_id));
        assert_eq!(scheduler.submissions(), 2);

        let result = orchestrator.await_completion(&second.job_id).await.unwrap();
        assert!(result.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_terminates_unit() {
        let scheduler = Arc::new(FakeScheduler::new(vec![UnitObservation::Running]));
        let orchestrator = orchestrator(scheduler.clone());

        let record = orchestrator.submit("print(1)", "req-cancel", &limits()).await.unwrap();
        let cancelled = orchestrator.cancel(&record.job_id).await.unwrap();

        assert_eq!(cancelled.state, JobState::Failed);
        assert_eq!(cancelled.error_detail.as_deref(), Some("cancelled"));
        assert_eq!(cancelled.failure, Some(FailureKind::Fatal));
        assert!(scheduler.was_terminated(&record.job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_disappearing_is_fatal() {
        let scheduler = Arc::new(FakeScheduler::new(vec![
            UnitObservation::Running,
            UnitObservation::Missing,
        ]));
        let orchestrator = orchestrator(scheduler);

        let record = orchestrator.submit("print(1)", "req-gone", &limits()).await.unwrap();
        let result = orchestrator.await_completion(&record.job_id).await.unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::Fatal));
        assert_eq!(
            result.error_detail.as_deref(),
            Some("unit disappeared from scheduler")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_scheduler_leaves_no_record() {
        let orchestrator = orchestrator(Arc::new(FakeScheduler::unavailable()));

        let err = orchestrator.submit("print(1)", "req-x", &limits()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::ResourceExhausted);
        assert!(orchestrator.list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_and_shutdown() {
        let scheduler = Arc::new(FakeScheduler::new(vec![UnitObservation::Running]));
        let orchestrator = orchestrator(scheduler.clone());

        let a = orchestrator.submit("print(1)", "req-a", &limits()).await.unwrap();
        let b = orchestrator.submit("print(2)", "req-b", &limits()).await.unwrap();
        let listed: Vec<String> = orchestrator.list().await.into_iter().map(|r| r.job_id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a.job_id) && listed.contains(&b.job_id));

        orchestrator.shutdown().await;
        assert!(scheduler.was_deleted(&a.job_id));
        assert!(scheduler.was_deleted(&b.job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_job_is_not_found() {
        let orchestrator = orchestrator(Arc::new(FakeScheduler::new(Vec::new())));
        assert!(matches!(
            orchestrator.await_completion("sandgate-job-nope").await,
            Err(JobError::NotFound(_))
        ));
    }
}
