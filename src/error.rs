use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::utils::http::HttpResponse;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Webhook delivery without the current validation token.
    #[error("invalid or missing webhook token")]
    Authentication,

    #[error("failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate error: {0}")]
    Certificate(String),

    /// The remote service could not reach the webhook listener.
    #[error("{0} not reachable by the transcription server")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("transcription server returned {status}: {body}")]
    RemoteService { status: u16, body: String },

    #[error("transcription server unavailable after {retries} retries")]
    ApiUnavailable { retries: u32 },

    /// The listener has not been validated since its last (re)start.
    #[error("webhook listener is not validated")]
    NotReady,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Audio(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Authentication => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let response = HttpResponse::new(status.as_u16(), self.to_string(), String::new());
        (status, Json(response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Authentication.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            Error::Validation("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Certificate("missing".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_connection_message() {
        let err = Error::Connection("10.0.0.5:8443".into());
        assert_eq!(
            err.to_string(),
            "10.0.0.5:8443 not reachable by the transcription server"
        );
    }
}
