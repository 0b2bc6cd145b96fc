use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Serialize)]
pub struct HttpResponse<T> {
    pub code: u16,
    pub message: String,
    pub body: T,
}

impl<T> HttpResponse<T> {
    pub fn new(code: u16, message: String, body: T) -> Self {
        Self { code, message, body }
    }
}

/// Turns a non-2xx response into `Error::RemoteService`, keeping the body for diagnostics.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    warn!("Request to {} failed with status {}: {}", url, status, body);
    Err(Error::RemoteService {
        status: status.as_u16(),
        body,
    })
}

/// Extracts the job id from an upload response path such as `/audiofile/<id>`.
pub fn last_path_segment(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
}
