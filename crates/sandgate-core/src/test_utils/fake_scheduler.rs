// src/test_utils/fake_scheduler.rs
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::JobError;
use crate::orchestrator::{JobScheduler, JobSpec, UnitObservation};

/// In-memory scheduler. Every submitted unit replays its own copy of the
/// script, one observation per poll; the last entry repeats forever.
pub struct FakeScheduler {
    script: Vec<UnitObservation>,
    unavailable: bool,
    units: Mutex<HashMap<String, VecDeque<UnitObservation>>>,
    pub submitted: Mutex<Vec<JobSpec>>,
    pub terminated: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl FakeScheduler {
    pub fn new(script: Vec<UnitObservation>) -> Self {
        Self {
            script,
            unavailable: false,
            units: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// A scheduler that refuses every submission as unreachable.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn was_terminated(&self, job_id: &str) -> bool {
        self.terminated.lock().unwrap().iter().any(|id| id == job_id)
    }

    pub fn was_deleted(&self, job_id: &str) -> bool {
        self.deleted.lock().unwrap().iter().any(|id| id == job_id)
    }
}

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<(), JobError> {
        if self.unavailable {
            return Err(JobError::SchedulerUnavailable(
                "connection refused".to_string(),
            ));
        }
        let mut units = self.units.lock().unwrap();
        if units.contains_key(&spec.job_id) {
            return Err(JobError::Duplicate(spec.job_id.clone()));
        }
        units.insert(spec.job_id.clone(), self.script.iter().cloned().collect());
        self.submitted.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn observe(&self, job_id: &str) -> Result<UnitObservation, JobError> {
        let mut units = self.units.lock().unwrap();
        let Some(script) = units.get_mut(job_id) else {
            return Ok(UnitObservation::Missing);
        };
        let observation = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(observation.unwrap_or(UnitObservation::Pending))
    }

    async fn terminate(&self, job_id: &str, _grace: Duration) -> Result<(), JobError> {
        self.terminated.lock().unwrap().push(job_id.to_string());
        if let Some(script) = self.units.lock().unwrap().get_mut(job_id) {
            script.clear();
            script.push_back(UnitObservation::Failed {
                exit_code: Some(143),
                oom_killed: false,
            });
        }
        Ok(())
    }

    async fn delete(&self, job_id: &str) -> Result<(), JobError> {
        self.units.lock().unwrap().remove(job_id);
        self.deleted.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}
