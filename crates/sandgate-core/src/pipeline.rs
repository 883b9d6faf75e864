//! Request pipeline: validate, classify, then run on exactly one tier.
//!
//! The source is parsed once per version of the code. Validation and
//! classification share that tree, and routing uses the classifier's tier
//! and nothing else.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::analysis::SourceTree;
use crate::classifier::{Classification, Classifier};
use crate::config::SandgateConfig;
use crate::core_types::{
    ExecutionRequest, ExecutionResult, ExecutionTier, ResourceLimits, ValidationResult,
};
use crate::errors::{GeneratorError, PipelineError};
use crate::executors::{ActiveExecutions, Executor};
use crate::llm::CodeGenerator;
use crate::retry::{CorrectionPolicy, RetryCoordinator, RetryPolicy};
use crate::validator::Validator;

/// The single answer to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub request_id: String,
    pub tier: ExecutionTier,
    pub classification: Classification,
    pub validation: ValidationResult,
    pub result: ExecutionResult,
    /// The code that ran, when it was generated rather than supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_code: Option<String>,
    #[serde(default)]
    pub corrections: u32,
}

/// Request shape for `generate_and_execute`; the code comes from the model.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub request_id: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub resource_limits: Option<ResourceLimits>,
}

impl GenerationParams {
    fn into_request(self, request_id: String, code: String) -> ExecutionRequest {
        let mut request = ExecutionRequest::new(code).with_request_id(request_id);
        if let Some(timeout_seconds) = self.timeout_seconds {
            request = request.with_timeout_seconds(timeout_seconds);
        }
        if let Some(max_retries) = self.max_retries {
            request = request.with_max_retries(max_retries);
        }
        if let Some(limits) = self.resource_limits {
            request = request.with_resource_limits(limits);
        }
        request
    }
}

pub struct RequestPipeline {
    validator: Validator,
    classifier: Classifier,
    lightweight: Arc<dyn Executor>,
    heavy: Arc<dyn Executor>,
    retry: RetryCoordinator,
    correction: CorrectionPolicy,
    generator: Option<Arc<dyn CodeGenerator>>,
    active: ActiveExecutions,
    default_limits: ResourceLimits,
}

impl RequestPipeline {
    pub fn new(
        config: &SandgateConfig,
        lightweight: Arc<dyn Executor>,
        heavy: Arc<dyn Executor>,
    ) -> Self {
        Self {
            validator: Validator::new(&config.validator),
            classifier: Classifier::new(&config.classifier),
            lightweight,
            heavy,
            retry: RetryCoordinator::new(RetryPolicy::from_config(&config.retry)),
            correction: CorrectionPolicy::from_config(&config.retry),
            generator: None,
            active: ActiveExecutions::new(),
            default_limits: config.limits.clone(),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Shares an existing counter instead of the pipeline's own.
    pub fn with_active_executions(mut self, active: ActiveExecutions) -> Self {
        self.active = active;
        self
    }

    pub fn active_executions(&self) -> &ActiveExecutions {
        &self.active
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Runs a caller-supplied program. Invalid code is rejected before
    /// anything executes. Requests without limits get the configured ones.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineResponse, PipelineError> {
        let request = request.clone().with_default_limits(&self.default_limits);
        let request_id = request.request_id();
        let (validation, tree) = self.validator.validate_and_parse(request.source_code());

        let tree = match tree {
            Some(tree) if validation.is_valid => tree,
            _ => {
                log::warn!(
                    "request_id={} rejected: {}",
                    request_id,
                    validation.errors.join("; ")
                );
                return Err(PipelineError::Validation {
                    request_id: request_id.to_string(),
                    validation,
                });
            }
        };

        Ok(self.route(&request, validation, &tree, cancel).await)
    }

    /// Asks the generator for code, sends rejected versions back for
    /// correction up to the configured limit, then runs the first valid one.
    pub async fn generate_and_execute(
        &self,
        query: &str,
        params: GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<PipelineResponse, PipelineError> {
        let request_id = params
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let generator_error = |source: GeneratorError| {
            log::error!("request_id={} code generation failed: {}", request_id, source);
            PipelineError::Generator {
                request_id: request_id.clone(),
                source,
            }
        };

        let generator = self
            .generator
            .as_ref()
            .ok_or(GeneratorError::NotConfigured)
            .map_err(generator_error)?;

        log::info!("request_id={} generating code", request_id);
        let mut code = generator.generate(query).await.map_err(generator_error)?;
        let mut corrections: u32 = 0;
        let mut rejected: Vec<String> = Vec::new();

        let (validation, tree) = loop {
            let (validation, tree) = self.validator.validate_and_parse(&code);
            if let (true, Some(tree)) = (validation.is_valid, tree) {
                break (validation, tree);
            }

            rejected.extend(validation.errors.iter().cloned());
            if !self.correction.allows(corrections) {
                log::error!(
                    "request_id={} giving up after {} corrections",
                    request_id,
                    corrections
                );
                return Err(PipelineError::CorrectionExhausted {
                    request_id,
                    attempts: corrections,
                    errors: rejected,
                });
            }

            corrections += 1;
            log::warn!(
                "request_id={} generated code rejected ({}), correction {}/{}",
                request_id,
                validation.errors.join("; "),
                corrections,
                self.correction.max_attempts
            );
            code = generator
                .correct(query, &code, &validation)
                .await
                .map_err(generator_error)?;
        };

        let request = params
            .into_request(request_id, code.clone())
            .with_default_limits(&self.default_limits);
        let mut response = self.route(&request, validation, &tree, cancel).await;
        response.generated_code = Some(code);
        response.corrections = corrections;
        Ok(response)
    }

    async fn route(
        &self,
        request: &ExecutionRequest,
        validation: ValidationResult,
        tree: &SourceTree,
        cancel: &CancellationToken,
    ) -> PipelineResponse {
        let classification = self.classifier.classify_tree(tree);
        let tier = classification.tier;
        log::info!(
            "request_id={} routed to {} tier: {}",
            request.request_id(),
            tier,
            classification.reason
        );

        let result = match tier {
            ExecutionTier::Lightweight => {
                let _guard = self.active.track();
                self.retry.run(self.lightweight.as_ref(), request, cancel).await
            }
            ExecutionTier::Heavy => self.retry.run(self.heavy.as_ref(), request, cancel).await,
        };

        log::info!(
            "request_id={} finished status={} attempts={} duration_ms={}",
            request.request_id(),
            result.status,
            result.attempts,
            result.duration_ms
        );

        PipelineResponse {
            request_id: request.request_id().to_string(),
            tier,
            classification,
            validation,
            result,
            generated_code: None,
            corrections: 0,
        }
    }
}
