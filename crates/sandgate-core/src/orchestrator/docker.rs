//! Runs heavy-tier units as locked-down Docker containers.

use async_trait::async_trait;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, ContainerStateStatusEnum, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

use super::scheduler::{JobScheduler, UnitObservation};
use super::spec::JobSpec;
use crate::errors::JobError;

pub struct DockerScheduler {
    docker: Docker,
}

impl DockerScheduler {
    pub fn connect() -> Result<Self, JobError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| JobError::SchedulerUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Maps the unit description onto a container that cannot write its
    /// root filesystem, gain privileges or hold capabilities.
    pub fn container_config(spec: &JobSpec) -> Result<ContainerCreateBody, JobError> {
        let rejected = |message: String| JobError::Rejected {
            job_id: spec.job_id.clone(),
            message,
        };
        let millicores = spec
            .resources
            .cpu_limit
            .millicores()
            .ok_or_else(|| rejected(format!("invalid cpu limit '{}'", spec.resources.cpu_limit)))?;
        let memory = spec
            .resources
            .memory_limit
            .bytes()
            .ok_or_else(|| rejected(format!("invalid memory limit '{}'", spec.resources.memory_limit)))?;
        let disk = spec
            .resources
            .disk_limit
            .bytes()
            .ok_or_else(|| rejected(format!("invalid disk limit '{}'", spec.resources.disk_limit)))?;

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), format!("rw,noexec,nosuid,size={}", disk));
        let binds = match &spec.result_volume {
            Some(volume) => Some(vec![format!("{}:{}:rw", volume, spec.result_dir)]),
            None => {
                tmpfs.insert(spec.result_dir.clone(), format!("rw,noexec,nosuid,size={}", disk));
                None
            }
        };

        let mut security_opt = Vec::new();
        if !spec.security.allow_privilege_escalation {
            security_opt.push("no-new-privileges:true".to_string());
        }
        let cap_drop = spec
            .security
            .drop_all_capabilities
            .then(|| vec!["ALL".to_string()]);

        let host_config = HostConfig {
            nano_cpus: Some((millicores as i64) * 1_000_000),
            memory: Some(memory as i64),
            memory_swap: Some(memory as i64),
            readonly_rootfs: Some(spec.security.read_only_root_filesystem),
            tmpfs: Some(tmpfs),
            binds,
            security_opt: Some(security_opt),
            cap_drop,
            network_mode: Some(spec.network.clone().unwrap_or_else(|| "none".to_string())),
            auto_remove: Some(false),
            ..Default::default()
        };

        let env = spec
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        Ok(ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            user: Some(spec.security.run_as_user.to_string()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            stop_signal: Some("SIGTERM".to_string()),
            stop_timeout: Some(spec.pre_stop.grace_period_seconds as i64),
            host_config: Some(host_config),
            ..Default::default()
        })
    }
}

impl DockerScheduler {
    /// Pulls the runner image unless the daemon already has it.
    async fn ensure_image(&self, image: &str) -> Result<(), JobError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        log::info!("pulling runner image {}", image);
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(image.to_string()),
            ..Default::default()
        });
        let mut progress = self.docker.create_image(options, None, None);
        while let Some(step) = progress.next().await {
            step.map_err(|e| JobError::SchedulerUnavailable(format!("pull of {} failed: {}", image, e)))?;
        }
        Ok(())
    }
}

fn is_not_found(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl JobScheduler for DockerScheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<(), JobError> {
        let config = Self::container_config(spec)?;
        self.ensure_image(&spec.image).await?;
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.job_id.clone()),
            ..Default::default()
        });

        self.docker
            .create_container(options, config)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 409, ..
                } => JobError::Duplicate(spec.job_id.clone()),
                other => JobError::from(other),
            })?;
        self.docker
            .start_container(&spec.job_id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn observe(&self, job_id: &str) -> Result<UnitObservation, JobError> {
        let inspect = match self
            .docker
            .inspect_container(job_id, None::<BollardInspectContainerOptionsQuery>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(UnitObservation::Missing),
            Err(e) => return Err(e.into()),
        };

        let Some(state) = inspect.state else {
            return Ok(UnitObservation::Pending);
        };

        let observation = match state.status {
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::PAUSED)
            | Some(ContainerStateStatusEnum::RESTARTING) => UnitObservation::Running,
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                let exit_code = state.exit_code;
                let oom_killed = state.oom_killed.unwrap_or(false);
                if exit_code == Some(0) && !oom_killed {
                    UnitObservation::Succeeded
                } else {
                    UnitObservation::Failed {
                        exit_code,
                        oom_killed,
                    }
                }
            }
            Some(ContainerStateStatusEnum::REMOVING) => UnitObservation::Missing,
            _ => UnitObservation::Pending,
        };
        Ok(observation)
    }

    async fn terminate(&self, job_id: &str, grace: Duration) -> Result<(), JobError> {
        let options = Some(BollardStopContainerOptionsQuery {
            t: Some(grace.as_secs() as i32),
            ..Default::default()
        });
        match self.docker.stop_container(job_id, options).await {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, job_id: &str) -> Result<(), JobError> {
        let options = Some(BollardRemoveContainerOptionsQuery {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(job_id, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
