use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

pub mod http;

pub use http::HttpJobService;

/// Options for starting a transcription.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// URLs the remote service notifies; the job id is appended as the last path segment.
    pub webhooks: Vec<String>,
    /// Extra query arguments such as `lm.uri` or `hints.words`.
    pub args: Vec<(String, String)>,
}

impl StartOptions {
    pub fn with_webhooks(webhooks: Vec<String>) -> Self {
        Self {
            webhooks,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    pub(crate) fn query(&self) -> Vec<(String, String)> {
        self.webhooks
            .iter()
            .map(|url| ("webhook".to_string(), url.clone()))
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultFormat {
    #[default]
    Json,
    Csv,
}

/// Reachability probe the remote service runs against the webhook listener.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookValidation {
    #[serde(skip)]
    pub host: String,
    #[serde(skip)]
    pub port: u16,
    pub token: String,
    /// Self-signed certificate the remote side must trust, in PEM.
    #[serde(rename = "crt", skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip)]
    pub timeout: Option<u64>,
    #[serde(skip)]
    pub retries: Option<u32>,
}

/// Operations of the remote transcription service used by the client.
#[async_trait]
pub trait JobService: Send + Sync + 'static {
    async fn list(&self, batch: Option<&str>) -> Result<Value>;

    /// Uploads an audio file and returns the job id assigned by the service.
    async fn upload(&self, path: &Path, batch: Option<&str>) -> Result<String>;

    async fn start(&self, job_id: &str, options: &StartOptions) -> Result<Value>;

    async fn status(&self, job_id: &str) -> Result<Value>;

    async fn result(&self, job_id: &str, format: ResultFormat) -> Result<Value>;

    async fn delete(&self, job_id: &str, delete_on_disk: bool) -> Result<Value>;

    /// Externally visible address of this host as seen by the service.
    async fn whoami(&self) -> Result<String>;

    /// Asks the service to reach the listener; `true` when it succeeded.
    async fn validate_webhook(&self, validation: &WebhookValidation) -> Result<bool>;
}

/// Job ids are 24 hexadecimal digits.
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id.len() == 24 && job_id.chars().all(|c| c.is_ascii_hexdigit())
}
