use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::callback::RouteTable;
use crate::completion::{CompletionTracker, ROOT_CHANNEL};
use crate::error::Error;
use crate::utils::http::HttpResponse;

/// State of one listener generation. Never mutated after the generation starts.
pub(crate) struct GenerationState {
    pub generation: u64,
    pub token: String,
    pub routes: RouteTable,
    pub tracker: Arc<dyn CompletionTracker>,
}

pub(crate) fn router(state: Arc<GenerationState>) -> Router {
    Router::new()
        .route("/:job_id", post(root_webhook))
        .route("/:callback/:job_id", post(named_webhook))
        .with_state(state)
}

/// Parses the body and checks its `token` against the generation's token.
fn authenticate(state: &GenerationState, body: &[u8]) -> Result<Value, Error> {
    let payload: Value = serde_json::from_slice(body).map_err(|_| Error::Authentication)?;
    match payload.get("token").and_then(Value::as_str) {
        Some(token) if token == state.token => Ok(payload),
        _ => Err(Error::Authentication),
    }
}

fn ok() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn root_webhook(
    State(state): State<Arc<GenerationState>>,
    Path(job_id): Path<String>,
    body: Bytes,
) -> Response {
    if let Err(e) = authenticate(&state, &body) {
        warn!(
            "Rejected root webhook for job {} on generation {}",
            job_id, state.generation
        );
        return e.into_response();
    }

    if !state.tracker.signal(&job_id, ROOT_CHANNEL) {
        debug!("Root webhook for job {} had nothing to signal", job_id);
    }
    ok()
}

async fn named_webhook(
    State(state): State<Arc<GenerationState>>,
    Path((name, job_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let payload = match authenticate(&state, &body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                "Rejected webhook {} for job {} on generation {}",
                name, job_id, state.generation
            );
            return e.into_response();
        }
    };

    let Some(callback) = state.routes.get(&name) else {
        debug!("No callback route named {}", name);
        let response = HttpResponse::new(404, format!("no callback named {}", name), String::new());
        return (StatusCode::NOT_FOUND, Json(response)).into_response();
    };

    // Runs detached from the request, so a dropped connection or a restart
    // cutting the request short still ends with the channel signaled.
    let dispatch = tokio::spawn({
        let state = state.clone();
        let job_id = job_id.clone();
        let name = name.clone();
        async move {
            let outcome = AssertUnwindSafe(callback.on_notification(&job_id, &payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("callback {} panicked", name)));
            state.tracker.signal(&job_id, &name);
            outcome
        }
    });

    let outcome = dispatch
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("callback {} task failed: {}", name, e)));

    match outcome {
        Ok(()) => ok(),
        Err(e) => {
            error!("Callback {} failed for job {}: {:#}", name, job_id, e);
            let response = HttpResponse::new(500, format!("callback {} failed", name), e.to_string());
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}
