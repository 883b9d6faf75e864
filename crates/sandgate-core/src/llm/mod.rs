//! Boundary to the language model that writes the candidate code.
//!
//! The model is an untrusted collaborator: whatever it returns goes through
//! the validator before anything runs.

use async_trait::async_trait;

use crate::core_types::ValidationResult;
use crate::errors::GeneratorError;

pub mod openai;
pub mod prompts;

pub use openai::HttpCodeGenerator;
pub use prompts::extract_code;

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Python source answering `query`.
    async fn generate(&self, query: &str) -> Result<String, GeneratorError>;

    /// A new attempt at `query` after `failed_code` was rejected.
    async fn correct(
        &self,
        query: &str,
        failed_code: &str,
        validation: &ValidationResult,
    ) -> Result<String, GeneratorError>;
}
