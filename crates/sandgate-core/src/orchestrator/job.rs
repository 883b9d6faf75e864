//! Job records and their forward-only lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::core_types::{ExecutionResult, FailureKind};
use crate::errors::JobError;

/// Exit codes the heavy-tier runner uses so the kind of failure survives
/// the trip through the scheduler.
pub mod runner_exit {
    use crate::core_types::FailureKind;

    pub const SUCCESS: i64 = 0;
    pub const RUNTIME_FAULT: i64 = 1;
    pub const TIMEOUT: i64 = 124;
    pub const LIMIT_EXCEEDED: i64 = 125;
    pub const FATAL: i64 = 126;

    pub fn for_failure(kind: FailureKind) -> i64 {
        match kind {
            FailureKind::Timeout => TIMEOUT,
            FailureKind::LimitExceeded => LIMIT_EXCEEDED,
            FailureKind::Fatal => FATAL,
            FailureKind::RuntimeFault | FailureKind::ResourceExhausted => RUNTIME_FAULT,
        }
    }

    pub fn failure_kind(exit_code: i64) -> FailureKind {
        match exit_code {
            TIMEOUT => FailureKind::Timeout,
            LIMIT_EXCEEDED => FailureKind::LimitExceeded,
            FATAL => FailureKind::Fatal,
            _ => FailureKind::RuntimeFault,
        }
    }
}

pub const JOB_ID_PREFIX: &str = "sandgate-job-";
const MAX_SLUG_LEN: usize = 37;
const HASH_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cleaned,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Succeeded | JobState::Failed => 2,
            JobState::Cleaned => 3,
        }
    }

    /// Succeeded or Failed: the unit has stopped and a result exists.
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn is_terminal(self) -> bool {
        self.is_finished() || self == JobState::Cleaned
    }

    /// Only forward moves are allowed, and the two finished states never
    /// turn into each other.
    pub fn can_advance_to(self, next: JobState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub request_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i64>,
    pub error_detail: Option<String>,
    /// Set when the unit was killed for exceeding its memory ceiling.
    #[serde(default)]
    pub oom_killed: bool,
    /// State the unit finished in, kept once the record moves to `Cleaned`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            request_id: request_id.into(),
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            exit_code: None,
            error_detail: None,
            oom_killed: false,
            outcome: None,
            failure: None,
            finished_at: None,
        }
    }

    /// Moves the record forward. Backward or sideways moves are rejected and
    /// leave the record untouched.
    pub fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_advance_to(next) {
            return Err(JobError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next.is_finished() {
            self.outcome = Some(next);
            self.finished_at = Some(now);
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn finish(
        &mut self,
        state: JobState,
        exit_code: Option<i64>,
        error_detail: Option<String>,
        failure: Option<FailureKind>,
    ) -> Result<(), JobError> {
        self.advance(state)?;
        self.exit_code = exit_code;
        self.error_detail = error_detail;
        self.failure = failure;
        Ok(())
    }

    /// The finished state, whether or not the record has been cleaned since.
    pub fn final_state(&self) -> Option<JobState> {
        self.outcome
    }

    /// The caller-facing view of a finished job. Program output stays with
    /// the unit's result sink, so `stdout`/`stderr` are empty here.
    pub fn to_execution_result(&self) -> Option<ExecutionResult> {
        let outcome = self.outcome?;
        let duration_ms = self
            .finished_at
            .map(|finished| (finished - self.created_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let mut result = match outcome {
            JobState::Succeeded => {
                ExecutionResult::success(self.request_id.clone(), String::new(), String::new(), 0)
            }
            _ => ExecutionResult::failure(
                self.request_id.clone(),
                self.failure.unwrap_or(FailureKind::RuntimeFault),
                self.exit_code.unwrap_or(-1),
                self.error_detail
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string()),
            ),
        };
        result.duration_ms = duration_ms;
        result.job_id = Some(self.job_id.clone());
        Some(result)
    }
}

/// Derives a scheduler-safe, deterministic job id from a request id.
///
/// The readable part keeps lowercase alphanumerics and hyphens; the hash
/// suffix keeps ids distinct when two request ids sanitise to the same slug.
/// The result is a valid DNS label of at most 63 characters.
pub fn job_id_for(request_id: &str) -> String {
    let mut slug = String::with_capacity(MAX_SLUG_LEN);
    let mut last_hyphen = true;
    for c in request_id.chars() {
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_matches('-');

    let digest = format!("{:x}", Sha256::digest(request_id.as_bytes()));
    let hash = &digest[..HASH_LEN];

    let mut job_id = String::from(JOB_ID_PREFIX);
    if !slug.is_empty() {
        job_id.push_str(slug);
        job_id.push('-');
    }
    job_id.push_str(hash);
    job_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut record = JobRecord::new("job", "req");
        record.advance(JobState::Running).unwrap();
        record
            .finish(JobState::Succeeded, Some(0), None, None)
            .unwrap();
        record.advance(JobState::Cleaned).unwrap();
        assert_eq!(record.state, JobState::Cleaned);
        assert_eq!(record.final_state(), Some(JobState::Succeeded));
        assert_eq!(record.exit_code, Some(0));
        assert!(record.finished_at.is_some());

        let result = record.to_execution_result().unwrap();
        assert!(result.is_success());
        assert_eq!(result.job_id.as_deref(), Some("job"));
        assert_eq!(result.request_id, "req");
    }

    #[test]
    fn test_unfinished_record_has_no_result() {
        let record = JobRecord::new("job", "req");
        assert!(record.to_execution_result().is_none());
    }

    #[test]
    fn test_failed_record_keeps_failure_kind() {
        let mut record = JobRecord::new("job", "req");
        record
            .finish(
                JobState::Failed,
                None,
                Some("deadline exceeded".to_string()),
                Some(FailureKind::Fatal),
            )
            .unwrap();
        let result = record.to_execution_result().unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::Fatal));
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.error_detail.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_runner_exit_codes() {
        assert_eq!(runner_exit::failure_kind(124), FailureKind::Timeout);
        assert_eq!(runner_exit::failure_kind(125), FailureKind::LimitExceeded);
        assert_eq!(runner_exit::failure_kind(126), FailureKind::Fatal);
        assert_eq!(runner_exit::failure_kind(1), FailureKind::RuntimeFault);
        assert_eq!(runner_exit::failure_kind(2), FailureKind::RuntimeFault);
        assert_eq!(
            runner_exit::for_failure(FailureKind::Timeout),
            runner_exit::TIMEOUT
        );
    }

    #[test]
    fn test_pending_may_finish_directly() {
        let mut record = JobRecord::new("job", "req");
        record
            .finish(
                JobState::Failed,
                None,
                Some("image pull failed".to_string()),
                Some(FailureKind::Fatal),
            )
            .unwrap();
        assert_eq!(record.state, JobState::Failed);
    }

    #[test]
    fn test_backward_transitions_rejected() {
        let mut record = JobRecord::new("job", "req");
        record.advance(JobState::Running).unwrap();
        record.advance(JobState::Failed).unwrap();

        for next in [
            JobState::Pending,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert!(matches!(
                record.advance(next),
                Err(JobError::InvalidTransition { .. })
            ));
        }
        assert_eq!(record.state, JobState::Failed);
    }

    #[test]
    fn test_job_id_shape() {
        let job_id = job_id_for("Req_42/Batch");
        assert!(job_id.starts_with("sandgate-job-req-42-batch-"));
        assert!(job_id.len() <= 63);
        assert!(job_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!job_id.ends_with('-'));
    }

    #[test]
    fn test_job_id_is_deterministic_and_distinct() {
        assert_eq!(job_id_for("abc"), job_id_for("abc"));
        // Same slug, different raw ids.
        assert_ne!(job_id_for("a.b"), job_id_for("a_b"));
    }

    #[test]
    fn test_long_request_id_is_bounded() {
        let request_id = "x".repeat(500);
        let job_id = job_id_for(&request_id);
        assert_eq!(job_id.len(), JOB_ID_PREFIX.len() + MAX_SLUG_LEN + 1 + HASH_LEN);
        assert!(job_id.len() <= 63);
    }

    #[test]
    fn test_symbol_only_request_id() {
        let job_id = job_id_for("***");
        assert_eq!(job_id.len(), JOB_ID_PREFIX.len() + HASH_LEN);
    }
}
