//! Boundary to whatever actually runs heavy-tier units.

use async_trait::async_trait;
use std::time::Duration;

use super::spec::JobSpec;
use crate::errors::JobError;

/// What the scheduler reports about a unit at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitObservation {
    /// Accepted but not yet started (image pull, queueing).
    Pending,
    Running,
    Succeeded,
    Failed { exit_code: Option<i64>, oom_killed: bool },
    /// The scheduler no longer knows the unit.
    Missing,
}

/// An external scheduler able to run one isolated unit per job.
///
/// Implementations must not retry units on their own; every retry decision
/// belongs to the caller.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Creates and starts the unit.
    async fn submit(&self, spec: &JobSpec) -> Result<(), JobError>;

    async fn observe(&self, job_id: &str) -> Result<UnitObservation, JobError>;

    /// Stops the unit, running its pre-stop hook and allowing `grace` before
    /// it is killed.
    async fn terminate(&self, job_id: &str, grace: Duration) -> Result<(), JobError>;

    /// Removes the unit and everything the scheduler keeps for it.
    async fn delete(&self, job_id: &str) -> Result<(), JobError>;
}
