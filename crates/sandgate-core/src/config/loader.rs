//! Configuration loader for YAML files and environment resolution
//!
//! `${VAR}` placeholders anywhere in the document are substituted before the
//! YAML is parsed, so secrets and per-environment values never have to be
//! written into the file itself.

use crate::config::types::*;
use crate::errors::ConfigError;
use regex::{Captures, Regex};
use std::env;
use std::path::Path;
use tokio::fs;

const PLACEHOLDER_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandgateConfig, ConfigError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        log::debug!("Loaded configuration from {}", path.display());
        Self::from_str(&content)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<SandgateConfig, ConfigError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            return Self::from_file(path).await;
        }

        log::info!(
            "No configuration file at {}, using built-in defaults",
            path.display()
        );
        let mut config = SandgateConfig::default();
        Self::resolve_environment(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandgateConfig, ConfigError> {
        let expanded = Self::expand_placeholders(content)?;

        let mut config: SandgateConfig = if expanded.trim().is_empty() {
            SandgateConfig::default()
        } else {
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::Parse(e.to_string()))?
        };

        Self::resolve_environment(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Replace every `${VAR}` with the value of `VAR`. An unset variable is an
    /// error rather than an empty string.
    fn expand_placeholders(content: &str) -> Result<String, ConfigError> {
        let pattern =
            Regex::new(PLACEHOLDER_PATTERN).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut missing = None;
        let expanded = pattern.replace_all(content, |caps: &Captures| {
            let name = &caps[1];
            match env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(name) => Err(ConfigError::MissingEnv(name)),
            None => Ok(expanded.into_owned()),
        }
    }

    fn resolve_environment(config: &mut SandgateConfig) -> Result<(), ConfigError> {
        if let Some(generator) = config.generator.as_mut() {
            Self::resolve_generator_auth(generator)?;
        }
        Ok(())
    }

    /// Resolve the generator API key from environment
    fn resolve_generator_auth(generator: &mut GeneratorConfig) -> Result<(), ConfigError> {
        if let Some(env_var) = &generator.api_key_env {
            match env::var(env_var) {
                Ok(api_key) => generator.api_key = Some(api_key),
                Err(_) if generator.api_key.is_some() => {}
                Err(_) => return Err(ConfigError::MissingEnv(env_var.clone())),
            }
        }

        if generator.api_key.is_none() && generator.api_key_env.is_none() {
            if let Ok(api_key) = env::var("OPENAI_API_KEY") {
                generator.api_key = Some(api_key);
            }
        }

        Ok(())
    }
}
