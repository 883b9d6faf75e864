//! Where heavy-tier results go once the unit finishes.
//!
//! The runner stores the full result through a `ResultSink` and then tells
//! whoever is waiting through a `CompletionNotifier`. Neither step is retried
//! here; a transport that needs redelivery provides it itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::core_types::{ExecutionResult, ExecutionStatus};
use crate::errors::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionNotification {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub status: ExecutionStatus,
    pub exit_code: i64,
    pub duration_ms: u64,
    pub result_location: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CompletionNotification {
    pub fn for_result(result: &ExecutionResult, result_location: Option<String>) -> Self {
        Self {
            request_id: result.request_id.clone(),
            job_id: result.job_id.clone(),
            status: result.status,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            result_location,
            completed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persists the result and returns where it can be fetched from.
    async fn store(&self, result: &ExecutionResult) -> Result<String, TransportError>;
}

#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), TransportError>;
}

/// Writes each result as `<request_id>.json` under a directory.
#[derive(Debug, Clone)]
pub struct FileResultSink {
    dir: PathBuf,
}

impl FileResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Request ids come from callers; keep them from escaping the directory.
    fn file_name(request_id: &str) -> String {
        let stem: String = request_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}.json", stem)
    }
}

#[async_trait]
impl ResultSink for FileResultSink {
    async fn store(&self, result: &ExecutionResult) -> Result<String, TransportError> {
        fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(result)?;

        let path = self.dir.join(Self::file_name(&result.request_id));
        let partial = path.with_extension("json.partial");
        fs::write(&partial, body).await?;
        fs::rename(&partial, &path).await?;

        log::info!(
            "request_id={} result stored at {}",
            result.request_id,
            path.display()
        );
        Ok(path.display().to_string())
    }
}

/// POSTs the notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), TransportError> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        log::info!(
            "request_id={} completion notification delivered to {}",
            notification.request_id,
            self.url
        );
        Ok(())
    }
}

/// Notifier for deployments without a listener: the log line is the event.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl CompletionNotifier for LogNotifier {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), TransportError> {
        log::info!(
            "request_id={} completed status={} exit_code={} duration_ms={} result={}",
            notification.request_id,
            notification.status,
            notification.exit_code,
            notification.duration_ms,
            notification.result_location.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}
