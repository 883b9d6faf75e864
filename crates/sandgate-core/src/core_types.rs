//! Request, result and limit types shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ConfigError;

/// A resource quantity exactly as the operator wrote it (`"500m"`, `"2"`,
/// `"512Mi"`, `"8Gi"`). The text is kept verbatim so it can be forwarded
/// unchanged to the scheduler; numeric views are parsed on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(String);

impl Quantity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// CPU quantity in millicores: `"500m"` is 500, `"2"` is 2000, `"1.5"` is 1500.
    pub fn millicores(&self) -> Option<u64> {
        let text = self.0.trim();
        if let Some(milli) = text.strip_suffix('m') {
            return milli.parse::<u64>().ok().filter(|value| *value > 0);
        }
        let cores: f64 = text.parse().ok()?;
        if !cores.is_finite() || cores <= 0.0 {
            return None;
        }
        Some((cores * 1000.0).round() as u64)
    }

    /// Memory or disk quantity in bytes. Binary (`Ki`, `Mi`, `Gi`, `Ti`) and
    /// decimal (`k`/`K`, `M`, `G`, `T`) suffixes are accepted.
    pub fn bytes(&self) -> Option<u64> {
        const SUFFIXES: [(&str, u64); 9] = [
            ("Ki", 1 << 10),
            ("Mi", 1 << 20),
            ("Gi", 1 << 30),
            ("Ti", 1 << 40),
            ("k", 1_000),
            ("K", 1_000),
            ("M", 1_000_000),
            ("G", 1_000_000_000),
            ("T", 1_000_000_000_000),
        ];

        let text = self.0.trim();
        for (suffix, multiplier) in SUFFIXES {
            if let Some(number) = text.strip_suffix(suffix) {
                let value: u64 = number.trim().parse().ok()?;
                return value.checked_mul(multiplier).filter(|bytes| *bytes > 0);
            }
        }
        text.parse::<u64>().ok().filter(|bytes| *bytes > 0)
    }

    pub(crate) fn require_millicores(&self, field: &str) -> Result<u64, ConfigError> {
        self.millicores().ok_or_else(|| ConfigError::InvalidQuantity {
            field: field.to_string(),
            value: self.0.clone(),
        })
    }

    pub(crate) fn require_bytes(&self, field: &str) -> Result<u64, ConfigError> {
        self.bytes().ok_or_else(|| ConfigError::InvalidQuantity {
            field: field.to_string(),
            value: self.0.clone(),
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Ceilings attached to a request and handed unchanged to whichever
/// executor runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: Quantity,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: Quantity,
    #[serde(default = "default_disk_limit")]
    pub disk_limit: Quantity,
    #[serde(default = "default_limit_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_cpu_limit() -> Quantity {
    Quantity::new("4")
}

fn default_memory_limit() -> Quantity {
    Quantity::new("8Gi")
}

fn default_disk_limit() -> Quantity {
    Quantity::new("10Gi")
}

fn default_limit_timeout_seconds() -> u64 {
    300
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
            disk_limit: default_disk_limit(),
            timeout_seconds: default_limit_timeout_seconds(),
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cpu_limit.require_millicores("cpu_limit")?;
        self.memory_limit.require_bytes("memory_limit")?;
        self.disk_limit.require_bytes("disk_limit")?;
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "resource_limits.timeout_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timeout for requests that name neither a timeout nor limits.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// One unit of work entering the pipeline. Immutable after construction; the
/// `request_id` is carried into every log line and result.
///
/// Timeout, retries and limits are optional so the pipeline can fill the
/// ones a caller left out from configuration. Whatever is set, both tiers
/// see one timeout: `resource_limits().timeout_seconds` always equals
/// `timeout_seconds()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    request_id: String,
    source_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_limits: Option<ResourceLimits>,
}

impl ExecutionRequest {
    /// Creates a request with a fresh UUID request id.
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            source_code: source_code.into(),
            timeout_seconds: None,
            max_retries: None,
            resource_limits: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Zero is clamped to one second; a request always has a finite deadline.
    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds.max(1));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_resource_limits(mut self, resource_limits: ResourceLimits) -> Self {
        self.resource_limits = Some(resource_limits);
        self
    }

    /// Fills in limits the caller did not supply; explicit limits win.
    pub fn with_default_limits(mut self, defaults: &ResourceLimits) -> Self {
        if self.resource_limits.is_none() {
            self.resource_limits = Some(defaults.clone());
        }
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    /// The explicit timeout, else the limits' timeout, else
    /// `DEFAULT_REQUEST_TIMEOUT_SECONDS`.
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
            .or_else(|| self.resource_limits.as_ref().map(|limits| limits.timeout_seconds))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS)
            .max(1)
    }

    /// `None` when the caller left the retry budget to configuration.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn has_resource_limits(&self) -> bool {
        self.resource_limits.is_some()
    }

    /// Limits handed to the executor, carrying the request's timeout.
    pub fn resource_limits(&self) -> ResourceLimits {
        let mut limits = self.resource_limits.clone().unwrap_or_default();
        limits.timeout_seconds = self.timeout_seconds();
        limits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTier {
    Lightweight,
    Heavy,
}

impl fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTier::Lightweight => f.write_str("lightweight"),
            ExecutionTier::Heavy => f.write_str("heavy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => f.write_str("success"),
            ExecutionStatus::Failure => f.write_str("failure"),
            ExecutionStatus::Timeout => f.write_str("timeout"),
        }
    }
}

/// Why an attempt did not succeed. Produced where the failure is observed so
/// the retry layer branches on a closed set instead of inspecting errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The program did not finish within its deadline.
    Timeout,
    /// A CPU, memory or disk ceiling imposed by policy was hit.
    LimitExceeded,
    /// The program itself raised or exited non-zero.
    RuntimeFault,
    /// The host or cluster could not provide resources right now.
    ResourceExhausted,
    /// Lifecycle, configuration or cancellation failures.
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::RuntimeFault | FailureKind::ResourceExhausted)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::LimitExceeded => "limit_exceeded",
            FailureKind::RuntimeFault => "runtime_fault",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Scheduler job that produced the result, for heavy-tier runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

fn default_attempts() -> u32 {
    1
}

impl ExecutionResult {
    pub fn success(request_id: impl Into<String>, stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            stdout,
            stderr,
            exit_code: 0,
            duration_ms,
            status: ExecutionStatus::Success,
            error_detail: None,
            failure: None,
            output_truncated: false,
            attempts: 1,
            job_id: None,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        kind: FailureKind,
        exit_code: i64,
        error_detail: impl Into<String>,
    ) -> Self {
        let status = if kind == FailureKind::Timeout {
            ExecutionStatus::Timeout
        } else {
            ExecutionStatus::Failure
        };
        Self {
            request_id: request_id.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            duration_ms: 0,
            status,
            error_detail: Some(error_detail.into()),
            failure: Some(kind),
            output_truncated: false,
            attempts: 1,
            job_id: None,
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// The failure classification, treating a `Timeout` status without an
    /// explicit kind as a timeout.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match (self.status, self.failure) {
            (ExecutionStatus::Success, _) => None,
            (ExecutionStatus::Timeout, _) => Some(FailureKind::Timeout),
            (ExecutionStatus::Failure, Some(kind)) => Some(kind),
            (ExecutionStatus::Failure, None) => Some(FailureKind::RuntimeFault),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Syntax,
    SourceTooLarge,
    FileIo,
    OsCommand,
    Network,
    Import,
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ViolationCategory::Syntax => "syntax error",
            ViolationCategory::SourceTooLarge => "source too large",
            ViolationCategory::FileIo => "file I/O",
            ViolationCategory::OsCommand => "OS command",
            ViolationCategory::Network => "network",
            ViolationCategory::Import => "import",
        };
        f.write_str(label)
    }
}

/// A single rule violation: which category was hit and the offending
/// call or module name, if there is one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub category: ViolationCategory,
    pub name: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn from_violations(violations: Vec<Violation>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: violations.is_empty(),
            errors: violations.iter().map(|v| v.message.clone()).collect(),
            warnings,
            violations,
        }
    }

    pub fn has_category(&self, category: ViolationCategory) -> bool {
        self.violations.iter().any(|v| v.category == category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(Quantity::new("500m").millicores(), Some(500));
        assert_eq!(Quantity::new("2").millicores(), Some(2000));
        assert_eq!(Quantity::new("1.5").millicores(), Some(1500));
        assert_eq!(Quantity::new("0").millicores(), None);
        assert_eq!(Quantity::new("lots").millicores(), None);
    }

    #[test]
    fn test_byte_quantities() {
        assert_eq!(Quantity::new("512Mi").bytes(), Some(512 * 1024 * 1024));
        assert_eq!(Quantity::new("8Gi").bytes(), Some(8 * 1024 * 1024 * 1024));
        assert_eq!(Quantity::new("1G").bytes(), Some(1_000_000_000));
        assert_eq!(Quantity::new("4096").bytes(), Some(4096));
        assert_eq!(Quantity::new("-1Mi").bytes(), None);
        assert_eq!(Quantity::new("Mi").bytes(), None);
    }

    #[test]
    fn test_default_limits_are_valid() {
        assert!(ResourceLimits::default().validate().is_ok());

        let broken = ResourceLimits {
            memory_limit: Quantity::new("plenty"),
            ..ResourceLimits::default()
        };
        assert_eq!(
            broken.validate(),
            Err(ConfigError::InvalidQuantity {
                field: "memory_limit".to_string(),
                value: "plenty".to_string()
            })
        );
    }

    #[test]
    fn test_request_builder_keeps_fields() {
        let request = ExecutionRequest::new("print(1)")
            .with_request_id("req-1")
            .with_timeout_seconds(0)
            .with_max_retries(5);
        assert_eq!(request.request_id(), "req-1");
        assert_eq!(request.timeout_seconds(), 1);
        assert_eq!(request.max_retries(), Some(5));
        assert_eq!(request.source_code(), "print(1)");
    }

    #[test]
    fn test_request_has_one_timeout() {
        let bare = ExecutionRequest::new("print(1)");
        assert_eq!(bare.timeout_seconds(), DEFAULT_REQUEST_TIMEOUT_SECONDS);
        assert_eq!(bare.max_retries(), None);
        assert!(!bare.has_resource_limits());

        let limits = ResourceLimits {
            memory_limit: Quantity::new("512Mi"),
            timeout_seconds: 120,
            ..ResourceLimits::default()
        };
        let from_limits = ExecutionRequest::new("print(1)").with_resource_limits(limits.clone());
        assert_eq!(from_limits.timeout_seconds(), 120);
        assert_eq!(from_limits.resource_limits().timeout_seconds, 120);

        let explicit = ExecutionRequest::new("print(1)")
            .with_resource_limits(limits)
            .with_timeout_seconds(5);
        assert_eq!(explicit.timeout_seconds(), 5);
        assert_eq!(explicit.resource_limits().timeout_seconds, 5);
        assert_eq!(explicit.resource_limits().memory_limit.as_str(), "512Mi");
    }

    #[test]
    fn test_default_limits_do_not_replace_explicit_ones() {
        let operator = ResourceLimits {
            cpu_limit: Quantity::new("1"),
            timeout_seconds: 90,
            ..ResourceLimits::default()
        };
        let filled = ExecutionRequest::new("print(1)").with_default_limits(&operator);
        assert_eq!(filled.resource_limits(), operator);

        let own = ResourceLimits {
            cpu_limit: Quantity::new("2"),
            ..ResourceLimits::default()
        };
        let kept = ExecutionRequest::new("print(1)")
            .with_resource_limits(own.clone())
            .with_default_limits(&operator);
        assert_eq!(kept.resource_limits().cpu_limit, own.cpu_limit);
    }

    #[test]
    fn test_failure_kind_partition() {
        assert!(FailureKind::RuntimeFault.is_retryable());
        assert!(FailureKind::ResourceExhausted.is_retryable());
        assert!(!FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::LimitExceeded.is_retryable());
        assert!(!FailureKind::Fatal.is_retryable());
    }

    #[test]
    fn test_timeout_failure_sets_timeout_status() {
        let result = ExecutionResult::failure("req", FailureKind::Timeout, -1, "too slow");
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
    }
}
