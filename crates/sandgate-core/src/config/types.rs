//! Configuration type definitions
//!
//! Every section has serde defaults so an empty YAML document (or no file at
//! all) yields a working configuration. Operators override only what they
//! need; `SandgateConfig::validate` rejects combinations that cannot work.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core_types::ResourceLimits;
use crate::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandgateConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Limits attached to requests that do not bring their own.
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Sources above this size are rejected without being parsed.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,
    /// Validation slower than this adds a warning to the result.
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    /// Base modules generated code may import. The prohibited set always wins.
    #[serde(default = "default_allowed_imports")]
    pub allowed_imports: Vec<String>,
    #[serde(default)]
    pub extra_allowed_imports: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: default_max_source_bytes(),
            latency_budget_ms: default_latency_budget_ms(),
            allowed_imports: default_allowed_imports(),
            extra_allowed_imports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_heavy_libraries")]
    pub heavy_libraries: Vec<String>,
    /// `for`/`while` nesting at or above this depth routes to the heavy tier.
    #[serde(default = "default_max_loop_depth")]
    pub max_loop_depth: usize,
    /// A `range()` literal at or above this bound routes to the heavy tier.
    #[serde(default = "default_large_input_threshold")]
    pub large_input_threshold: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            heavy_libraries: default_heavy_libraries(),
            max_loop_depth: default_max_loop_depth(),
            large_input_threshold: default_large_input_threshold(),
        }
    }
}

/// How strictly the lightweight executor cuts the child off from the network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkIsolation {
    /// Launch fails if a private network namespace cannot be created.
    Required,
    /// Try a private network namespace, run without one if the host refuses.
    BestEffort,
    Disabled,
}

impl Default for NetworkIsolation {
    fn default() -> Self {
        NetworkIsolation::Required
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Interpreter name or path; resolved to an absolute path at startup
    /// because the child runs with an empty `PATH`.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_interpreter_args")]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_script_name")]
    pub script_name: String,
    /// Per-stream capture ceiling.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub network_isolation: NetworkIsolation,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
    /// Parent directory for per-run workspaces; the system temp dir if unset.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
            script_name: default_script_name(),
            max_output_bytes: default_max_output_bytes(),
            network_isolation: NetworkIsolation::default(),
            max_open_files: default_max_open_files(),
            workspace_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Namespace written into rendered cluster manifests.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_runner_image")]
    pub image: String,
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,
    /// How long a finished unit is kept before it is garbage-collected.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds_after_finished: u64,
    /// Operator deadline for a unit to reach a terminal state; distinct
    /// from the unit's own execution timeout.
    #[serde(default = "default_job_deadline_seconds")]
    pub job_deadline_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    #[serde(default = "default_pre_stop_command")]
    pub pre_stop_command: Vec<String>,
    #[serde(default = "default_run_as_user")]
    pub run_as_user: u32,
    /// Scheduler network the unit joins; units need egress only to reach
    /// the result store and notification endpoint.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_result_dir")]
    pub result_dir: String,
    /// Docker volume mounted at `result_dir`; a size-limited tmpfs if unset.
    #[serde(default)]
    pub result_volume: Option<String>,
    #[serde(default)]
    pub notify_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_runner_image(),
            command: default_runner_command(),
            ttl_seconds_after_finished: default_ttl_seconds(),
            job_deadline_seconds: default_job_deadline_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_seconds: default_grace_period_seconds(),
            pre_stop_command: default_pre_stop_command(),
            run_as_user: default_run_as_user(),
            network: None,
            result_dir: default_result_dir(),
            result_volume: None,
            notify_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Regenerate-and-revalidate cycles allowed on the validation path.
    #[serde(default = "default_max_correction_attempts")]
    pub max_correction_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_correction_attempts: default_max_correction_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub endpoint: String,
    #[serde(default = "default_generator_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generator_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_service_name() -> String {
    "sandgate".to_string()
}

fn default_max_source_bytes() -> usize {
    256 * 1024
}

fn default_latency_budget_ms() -> u64 {
    30
}

fn default_allowed_imports() -> Vec<String> {
    [
        "math", "cmath", "random", "datetime", "json", "re", "collections", "itertools",
        "functools", "operator", "string", "decimal", "fractions", "statistics", "typing",
        "dataclasses", "enum", "copy", "pprint", "textwrap", "unicodedata", "hashlib", "hmac",
        "secrets", "uuid", "time", "calendar", "zoneinfo", "heapq", "bisect", "array", "numbers",
        // Data libraries; importing them routes the code to the heavy tier.
        "numpy", "scipy", "pandas", "modin", "polars", "pyarrow", "dask", "ray", "pyspark",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

fn default_heavy_libraries() -> Vec<String> {
    ["pandas", "modin", "polars", "pyarrow", "dask", "ray", "pyspark"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_max_loop_depth() -> usize {
    3
}

fn default_large_input_threshold() -> u64 {
    10_000_000
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    // Isolated mode ignores PYTHON* variables, so unbuffered output is
    // requested on the command line.
    vec!["-I".to_string(), "-u".to_string()]
}

fn default_script_name() -> String {
    "main.py".to_string()
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_open_files() -> u64 {
    64
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_runner_image() -> String {
    "sandgate-runner:latest".to_string()
}

fn default_runner_command() -> Vec<String> {
    vec!["/usr/local/bin/sandgate-runner".to_string()]
}

fn default_ttl_seconds() -> u64 {
    3600
}

fn default_job_deadline_seconds() -> u64 {
    900
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_grace_period_seconds() -> u64 {
    10
}

fn default_pre_stop_command() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "kill -TERM 1".to_string(),
    ]
}

fn default_run_as_user() -> u32 {
    1000
}

fn default_result_dir() -> String {
    "/results".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_correction_attempts() -> u32 {
    3
}

fn default_generator_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_generator_timeout_seconds() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ValidatorConfig {
    /// The configured allow-list plus any operator additions.
    pub fn allow_list(&self) -> impl Iterator<Item = &str> {
        self.allowed_imports
            .iter()
            .chain(self.extra_allowed_imports.iter())
            .map(String::as_str)
    }
}

impl SandgateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.is_empty() {
            return Err(ConfigError::Invalid("service.name cannot be empty".to_string()));
        }

        if self.validator.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "validator.max_source_bytes must be greater than 0".to_string(),
            ));
        }

        if self.classifier.max_loop_depth == 0 {
            return Err(ConfigError::Invalid(
                "classifier.max_loop_depth must be greater than 0".to_string(),
            ));
        }

        if self.executor.interpreter.is_empty() {
            return Err(ConfigError::Invalid(
                "executor.interpreter cannot be empty".to_string(),
            ));
        }

        if self.executor.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_output_bytes must be greater than 0".to_string(),
            ));
        }

        self.limits.validate()?;

        let orchestrator = &self.orchestrator;
        if orchestrator.image.is_empty() {
            return Err(ConfigError::Invalid("orchestrator.image cannot be empty".to_string()));
        }
        if orchestrator.command.is_empty() {
            return Err(ConfigError::Invalid(
                "orchestrator.command cannot be empty".to_string(),
            ));
        }
        if orchestrator.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if Duration::from_secs(orchestrator.job_deadline_seconds)
            <= Duration::from_millis(orchestrator.poll_interval_ms)
        {
            return Err(ConfigError::Invalid(
                "orchestrator.job_deadline_seconds must be longer than one poll interval"
                    .to_string(),
            ));
        }
        if orchestrator.run_as_user == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.run_as_user must not be root".to_string(),
            ));
        }

        if let Some(generator) = &self.generator {
            if generator.endpoint.is_empty() {
                return Err(ConfigError::Invalid(
                    "generator.endpoint cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}
