//! Configuration module
//!
//! A single YAML document configures every stage: validation rules,
//! classification thresholds, both executors, the job orchestrator, retry
//! bounds and the optional code generator. Missing sections fall back to
//! their defaults.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;


use crate::errors::ConfigError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<SandgateConfig, ConfigError> {
    ConfigLoader::from_file(path).await
}

/// Validate a configuration
pub fn validate_config(config: &SandgateConfig) -> Result<(), ConfigError> {
    config.validate()
}
