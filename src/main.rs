#![allow(clippy::uninlined_format_args)]

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::{error, info};

use trd_rs::{utils::logger, ClientConfig, FunctionCallback, TranscriptionClient, LOG_PATH, WAIT_TIMEOUT};

#[tokio::main]
async fn main() -> Result<()> {
    trd_rs::init_env();
    let _guard = logger::init(LOG_PATH.clone())?;

    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        bail!("usage: trd-rs <audio file>...");
    }

    let config = ClientConfig::from_env()?;
    info!("Connecting to transcription server at {}", config.api_url);
    let client = TranscriptionClient::new(config).await?;

    client
        .register_callback(
            FunctionCallback::new(|job_id: &str, payload: &Value| {
                info!("Job {} notified: {}", job_id, payload);
                Ok(())
            }),
            Some("log"),
        )
        .await?;

    let mut failed = 0;
    for file in &files {
        match client.transcribe(file, *WAIT_TIMEOUT, true).await {
            Ok(outcome) => match outcome.result {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => info!("No result yet for job {}", outcome.submission.job_id),
            },
            Err(e) => {
                error!("Failed to transcribe {}: {}", file, e);
                failed += 1;
            }
        }
    }

    client.stop().await;
    info!("Done, {} of {} files failed", failed, files.len());

    if failed > 0 {
        bail!("{} files failed", failed);
    }
    Ok(())
}
