use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::prompts::{correction_prompt, extract_code, generation_prompt, SYSTEM_PROMPT};
use super::CodeGenerator;
use crate::config::GeneratorConfig;
use crate::core_types::ValidationResult;
use crate::errors::GeneratorError;

/// Code generator speaking the OpenAI chat-completions protocol, which most
/// hosted and self-hosted model servers accept.
#[derive(Debug, Clone)]
pub struct HttpCodeGenerator {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    model: String,
    temperature: f32,
}

impl HttpCodeGenerator {
    pub fn new(api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: None,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.0,
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            api_base: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String, GeneratorError> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = self.build_request_body(prompt);
        log::debug!("Code generation request to {} (model {})", url, self.model);

        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let response_text = response.text().await?;

        if !status.is_success() {
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body: response_text,
            });
        }

        let response_json: Value = serde_json::from_str(&response_text)
            .map_err(|e| GeneratorError::Parse(format!("Invalid JSON response: {}", e)))?;
        let content = Self::parse_response(&response_json)?;

        let code = extract_code(&content);
        if code.is_empty() {
            return Err(GeneratorError::EmptyResponse);
        }
        Ok(code)
    }

    fn parse_response(response: &Value) -> Result<String, GeneratorError> {
        let choices = response["choices"]
            .as_array()
            .ok_or_else(|| GeneratorError::Parse("No choices in response".to_string()))?;

        let choice = choices.first().ok_or(GeneratorError::EmptyResponse)?;
        choice["message"]["content"]
            .as_str()
            .map(|content| content.to_string())
            .ok_or(GeneratorError::EmptyResponse)
    }
}

#[async_trait]
impl CodeGenerator for HttpCodeGenerator {
    async fn generate(&self, query: &str) -> Result<String, GeneratorError> {
        self.complete(&generation_prompt(query)).await
    }

    async fn correct(
        &self,
        query: &str,
        failed_code: &str,
        validation: &ValidationResult,
    ) -> Result<String, GeneratorError> {
        log::debug!(
            "Requesting correction for {} validation errors",
            validation.errors.len()
        );
        self.complete(&correction_prompt(query, failed_code, validation))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_llm_server::MockLLMServer;

    #[tokio::test]
    async fn test_generate_strips_fences() {
        let server = MockLLMServer::start(vec![Ok(
            "```python\nprint(sum(range(10)))\n```".to_string()
        )])
        .await;
        let generator = HttpCodeGenerator::new(server.endpoint(), "test-model")
            .with_api_key("sk-test".to_string());

        let code = generator.generate("add the first ten integers").await.unwrap();
        assert_eq!(code, "print(sum(range(10)))");

        let requests = server.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["model"], "test-model");
        assert_eq!(requests[0]["messages"][0]["role"], "system");
        let prompt = requests[0]["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("add the first ten integers"));
        assert!(prompt.contains("Do not use file I/O operations"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_correct_sends_errors() {
        let server = MockLLMServer::start(vec![Ok("print(45)".to_string())]).await;
        let generator = HttpCodeGenerator::new(server.endpoint(), "test-model");
        let validation = ValidationResult {
            is_valid: false,
            errors: vec!["Unauthorized import detected: os".to_string()],
            ..ValidationResult::default()
        };

        let code = generator
            .correct("add numbers", "import os\nprint(45)", &validation)
            .await
            .unwrap();
        assert_eq!(code, "print(45)");

        let requests = server.get_requests();
        let prompt = requests[0]["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("Unauthorized import detected: os"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let server = MockLLMServer::start(vec![Err(429)]).await;
        let generator = HttpCodeGenerator::new(server.endpoint(), "test-model");

        let err = generator.generate("anything").await.unwrap_err();
        assert!(matches!(err, GeneratorError::Status { status: 429, .. }));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_blank_reply_is_empty() {
        let server = MockLLMServer::start(vec![Ok("```python\n\n```".to_string())]).await;
        let generator = HttpCodeGenerator::new(server.endpoint(), "test-model");

        let err = generator.generate("anything").await.unwrap_err();
        assert!(matches!(err, GeneratorError::EmptyResponse));

        server.shutdown().await;
    }

    #[test]
    fn test_parse_response_without_choices() {
        let err = HttpCodeGenerator::parse_response(&json!({ "error": "nope" })).unwrap_err();
        assert!(matches!(err, GeneratorError::Parse(_)));
    }
}
