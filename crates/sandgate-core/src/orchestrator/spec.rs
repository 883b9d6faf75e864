//! The document handed to the external scheduler for one heavy-tier unit.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::config::OrchestratorConfig;
use crate::core_types::ResourceLimits;
use crate::errors::JobError;

pub const LABEL_APP: &str = "app";
pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_JOB_ID: &str = "sandgate.io/job-id";
pub const ANNOTATION_REQUEST_ID: &str = "sandgate.io/request-id";

pub const ENV_CODE: &str = "CODE";
pub const ENV_REQUEST_ID: &str = "REQUEST_ID";
pub const ENV_TIMEOUT: &str = "TIMEOUT";
pub const ENV_RESULT_DIR: &str = "RESULT_DIR";
pub const ENV_NOTIFY_URL: &str = "NOTIFY_URL";
pub const ENV_JOB_ID: &str = "JOB_ID";
pub const ENV_CPU_LIMIT: &str = "CPU_LIMIT";
pub const ENV_MEMORY_LIMIT: &str = "MEMORY_LIMIT";
pub const ENV_DISK_LIMIT: &str = "DISK_LIMIT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreStopHook {
    pub command: Vec<String>,
    pub grace_period_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPosture {
    pub run_as_user: u32,
    pub run_as_non_root: bool,
    pub allow_privilege_escalation: bool,
    pub read_only_root_filesystem: bool,
    pub drop_all_capabilities: bool,
}

impl SecurityPosture {
    pub fn locked_down(run_as_user: u32) -> Self {
        Self {
            run_as_user,
            run_as_non_root: true,
            allow_privilege_escalation: false,
            read_only_root_filesystem: true,
            drop_all_capabilities: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub request_id: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    /// The code travels only here, under `CODE`.
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    pub ttl_seconds_after_finished: u64,
    pub active_deadline_seconds: u64,
    pub pre_stop: PreStopHook,
    pub security: SecurityPosture,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub result_dir: String,
    pub result_volume: Option<String>,
}

impl JobSpec {
    /// Builds the unit description. Limits that the scheduler could not
    /// enforce are rejected here, before anything is submitted.
    pub fn build(
        job_id: &str,
        request_id: &str,
        code: &str,
        limits: &ResourceLimits,
        config: &OrchestratorConfig,
    ) -> Result<Self, JobError> {
        limits.validate().map_err(|e| JobError::Rejected {
            job_id: job_id.to_string(),
            message: e.to_string(),
        })?;

        let mut env = BTreeMap::new();
        env.insert(ENV_CODE.to_string(), code.to_string());
        env.insert(ENV_REQUEST_ID.to_string(), request_id.to_string());
        env.insert(ENV_JOB_ID.to_string(), job_id.to_string());
        env.insert(ENV_TIMEOUT.to_string(), limits.timeout_seconds.to_string());
        env.insert(ENV_CPU_LIMIT.to_string(), limits.cpu_limit.as_str().to_string());
        env.insert(ENV_MEMORY_LIMIT.to_string(), limits.memory_limit.as_str().to_string());
        env.insert(ENV_DISK_LIMIT.to_string(), limits.disk_limit.as_str().to_string());
        env.insert(ENV_RESULT_DIR.to_string(), config.result_dir.clone());
        if let Some(url) = &config.notify_url {
            env.insert(ENV_NOTIFY_URL.to_string(), url.clone());
        }

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APP.to_string(), "sandgate".to_string());
        labels.insert(LABEL_COMPONENT.to_string(), "job-runner".to_string());
        labels.insert(LABEL_JOB_ID.to_string(), job_id.to_string());

        Ok(Self {
            job_id: job_id.to_string(),
            request_id: request_id.to_string(),
            namespace: config.namespace.clone(),
            image: config.image.clone(),
            command: config.command.clone(),
            env,
            resources: limits.clone(),
            ttl_seconds_after_finished: config.ttl_seconds_after_finished,
            active_deadline_seconds: config.job_deadline_seconds,
            pre_stop: PreStopHook {
                command: config.pre_stop_command.clone(),
                grace_period_seconds: config.grace_period_seconds,
            },
            security: SecurityPosture::locked_down(config.run_as_user),
            labels,
            network: config.network.clone(),
            result_dir: config.result_dir.clone(),
            result_volume: config.result_volume.clone(),
        })
    }

    /// Renders a `batch/v1` Job for clusters that schedule units themselves.
    /// The scheduler never retries the unit (`backoffLimit: 0`); retries are
    /// decided by the caller.
    pub fn to_kubernetes_manifest(&self) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        let resources = json!({
            "cpu": self.resources.cpu_limit.as_str(),
            "memory": self.resources.memory_limit.as_str(),
            "ephemeral-storage": self.resources.disk_limit.as_str(),
        });

        let mut security_context = json!({
            "runAsNonRoot": self.security.run_as_non_root,
            "runAsUser": self.security.run_as_user,
            "readOnlyRootFilesystem": self.security.read_only_root_filesystem,
            "allowPrivilegeEscalation": self.security.allow_privilege_escalation,
        });
        if self.security.drop_all_capabilities {
            security_context["capabilities"] = json!({ "drop": ["ALL"] });
        }

        let mut annotations = serde_json::Map::new();
        annotations.insert(
            ANNOTATION_REQUEST_ID.to_string(),
            Value::String(self.request_id.clone()),
        );

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": self.job_id,
                "namespace": self.namespace,
                "labels": self.labels,
                "annotations": annotations,
            },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": self.ttl_seconds_after_finished,
                "activeDeadlineSeconds": self.active_deadline_seconds,
                "template": {
                    "metadata": {
                        "labels": self.labels,
                        "annotations": annotations,
                    },
                    "spec": {
                        "restartPolicy": "Never",
                        "terminationGracePeriodSeconds": self.pre_stop.grace_period_seconds,
                        "automountServiceAccountToken": false,
                        "containers": [{
                            "name": "executor",
                            "image": self.image,
                            "imagePullPolicy": "IfNotPresent",
                            "command": self.command,
                            "env": env,
                            "resources": {
                                "limits": resources,
                                "requests": resources,
                            },
                            "securityContext": security_context,
                            "lifecycle": {
                                "preStop": {
                                    "exec": { "command": self.pre_stop.command }
                                }
                            },
                            "volumeMounts": [
                                { "name": "scratch", "mountPath": "/tmp" },
                                { "name": "results", "mountPath": self.result_dir },
                            ],
                        }],
                        "volumes": [
                            {
                                "name": "scratch",
                                "emptyDir": { "sizeLimit": self.resources.disk_limit.as_str() },
                            },
                            { "name": "results", "emptyDir": {} },
                        ],
                    }
                }
            }
        })
    }
}
