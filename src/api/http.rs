use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Method, RequestBuilder};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{is_valid_job_id, JobService, ResultFormat, StartOptions, WebhookValidation};
use crate::error::{Error, Result};
use crate::utils::http::{ensure_success, last_path_segment};

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
}

/// `JobService` over the transcription server's REST API.
#[derive(Debug, Clone)]
pub struct HttpJobService {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl HttpJobService {
    /// Basic auth is only used when both username and password are non-empty.
    pub fn new(base_url: &str, username: Option<&str>, password: Option<&str>) -> Self {
        let credentials = match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            _ => None,
        };

        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probes the audio file listing until the service answers, up to
    /// `retries` attempts spaced by `period`.
    pub async fn wait_until_available(&self, retries: u32, period: Duration) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.list(None).await {
                Ok(_) => {
                    info!("Transcription server available at {}", self.base_url);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Exception on API list request: {}", e);
                    warn!("Retry {} of {}", attempt, retries);
                    attempt += 1;
                    if attempt > retries {
                        return Err(Error::ApiUnavailable { retries });
                    }
                    sleep(period).await;
                }
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!("{} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        }
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value> {
        let response = ensure_success(builder.send().await?).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn send_text(&self, builder: RequestBuilder) -> Result<String> {
        let response = ensure_success(builder.send().await?).await?;
        Ok(response.text().await?)
    }

    pub async fn get_audiofile(&self, job_id: &str) -> Result<Value> {
        self.send_json(self.request(Method::GET, &format!("audiofile/{}", job_id)))
            .await
    }

    pub async fn create_audiofile(&self, file_name: &str) -> Result<Value> {
        self.send_json(self.request(Method::GET, &format!("audiofile/create/{}", file_name)))
            .await
    }

    pub async fn create_batch(&self, batch: &str) -> Result<Value> {
        self.send_json(self.request(Method::GET, &format!("audiofile/create/batch/{}", batch)))
            .await
    }

    pub async fn delete_batch(&self, batch: &str, delete_on_disk: bool) -> Result<Value> {
        let mut builder = self.request(Method::DELETE, &format!("audiofile/delete/batch/{}", batch));
        if delete_on_disk {
            builder = builder.query(&[("deleteOnDisk", "true")]);
        }
        self.send_json(builder).await
    }

    pub async fn start_batch(
        &self,
        batch: &str,
        word_hints: Option<&str>,
        lm_url: Option<&str>,
    ) -> Result<Value> {
        let mut query = Vec::new();
        if let Some(lm_url) = lm_url {
            query.push(("lm.uri", lm_url));
        }
        if let Some(word_hints) = word_hints {
            query.push(("hints.words", word_hints));
        }
        let builder = self
            .request(Method::GET, &format!("transcription/start/batch/{}", batch))
            .query(&query);
        self.send_json(builder).await
    }

    pub async fn status_batch(&self, batch: &str) -> Result<Value> {
        self.send_json(self.request(Method::GET, &format!("transcription/status/batch/{}", batch)))
            .await
    }

    pub async fn reset(&self, job_id: &str, hard: bool) -> Result<Value> {
        self.reset_path(&format!("transcription/reset/audiofile/{}", job_id), hard)
            .await
    }

    pub async fn reset_batch(&self, batch: &str, hard: bool) -> Result<Value> {
        self.reset_path(&format!("transcription/reset/batch/{}", batch), hard)
            .await
    }

    async fn reset_path(&self, path: &str, hard: bool) -> Result<Value> {
        let mut builder = self.request(Method::GET, path);
        if hard {
            builder = builder.query(&[("hard", "true")]);
        }
        self.send_json(builder).await
    }

    /// Batch results; `format` is passed through, e.g. `csv`.
    pub async fn result_batch(&self, batch: &str, format: Option<&str>) -> Result<String> {
        let mut builder = self.request(Method::GET, &format!("transcription/result/batch/{}", batch));
        if let Some(format) = format {
            builder = builder.query(&[("format", format)]);
        }
        self.send_text(builder).await
    }

    /// Queries a collection; the response is newline-delimited.
    pub async fn query_collection(
        &self,
        collection: &str,
        query: &[(&str, &str)],
        project: &[&str],
    ) -> Result<Vec<String>> {
        let projection: Vec<(&str, &str)> = project.iter().map(|field| ("project", *field)).collect();
        let builder = self
            .request(Method::GET, &format!("query/collection/{}", collection))
            .query(query)
            .query(&projection);
        let text = self.send_text(builder).await?;
        Ok(text
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn list(&self, batch: Option<&str>) -> Result<Value> {
        let path = match batch {
            Some(batch) => format!("audiofile/list/batch/{}", batch),
            None => "audiofile/list/".to_string(),
        };
        self.send_json(self.request(Method::GET, &path)).await
    }

    async fn upload(&self, path: &Path, batch: Option<&str>) -> Result<String> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Validation(format!("{:?} is not a file", path)))?;
        let bytes = tokio::fs::read(path).await?;
        info!("Uploading {:?} ({} bytes)", path, bytes.len());

        let mut form = multipart::Form::new().part("files", multipart::Part::bytes(bytes).file_name(file_name));
        if let Some(batch) = batch {
            form = form.text("batch", batch.to_string());
        }

        let response = self
            .send_json(self.request(Method::POST, "audiofile/upload/").multipart(form))
            .await?;

        let location = response
            .as_object()
            .and_then(|object| object.values().next())
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation(format!("unexpected upload response: {}", response)))?;
        let job_id = last_path_segment(location)
            .filter(|id| is_valid_job_id(id))
            .ok_or_else(|| Error::Validation(format!("invalid job id in {}", location)))?;
        Ok(job_id.to_string())
    }

    async fn start(&self, job_id: &str, options: &StartOptions) -> Result<Value> {
        let builder = self
            .request(Method::GET, &format!("transcription/start/audiofile/{}", job_id))
            .query(&options.query());
        self.send_json(builder).await
    }

    async fn status(&self, job_id: &str) -> Result<Value> {
        self.send_json(self.request(Method::GET, &format!("transcription/status/audiofile/{}", job_id)))
            .await
    }

    async fn result(&self, job_id: &str, format: ResultFormat) -> Result<Value> {
        let builder = self.request(Method::GET, &format!("transcription/result/audiofile/{}", job_id));
        match format {
            ResultFormat::Json => self.send_json(builder).await,
            ResultFormat::Csv => {
                let text = self.send_text(builder.query(&[("format", "csv")])).await?;
                Ok(Value::String(text))
            }
        }
    }

    async fn delete(&self, job_id: &str, delete_on_disk: bool) -> Result<Value> {
        let mut builder = self.request(Method::DELETE, &format!("audiofile/delete/{}", job_id));
        if delete_on_disk {
            builder = builder.query(&[("deleteOnDisk", "true")]);
        }
        self.send_json(builder).await
    }

    async fn whoami(&self) -> Result<String> {
        let response = self.send_json(self.request(Method::GET, "webhook/whoami")).await?;
        response
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Validation(format!("unexpected whoami response: {}", response)))
    }

    async fn validate_webhook(&self, validation: &WebhookValidation) -> Result<bool> {
        let path = format!("webhook/validate/{}/{}", validation.host, validation.port);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(timeout) = validation.timeout {
            query.push(("timeout", timeout.to_string()));
        }
        if let Some(retries) = validation.retries {
            query.push(("retries", retries.to_string()));
        }

        let builder = if validation.certificate.is_some() {
            self.request(Method::POST, &path).query(&query).json(validation)
        } else {
            self.request(Method::GET, &path).query(&query)
        };

        let response = self.send_json(builder).await?;
        Ok(response.as_bool().unwrap_or(false))
    }
}
