pub mod api;
pub mod callback;
pub mod cert;
pub mod client;
pub mod completion;
pub mod error;
pub mod utils;
pub mod web;

use std::env;

use once_cell::sync::Lazy;

pub use callback::{CallbackId, FunctionCallback, WebhookCallback};
pub use client::{ClientConfig, Submission, TranscribeOutcome, TranscriptionClient};
pub use completion::WaitTimeout;
pub use error::{Error, Result};
pub use web::Protocol;

const TRD_LOG_PATH: &str = "./logs";

pub static LOG_PATH: Lazy<String> = Lazy::new(|| {
    match env::var("TRD_LOG_PATH") {
        Ok(path) => path,
        Err(_) => dotenv::var("TRD_LOG_PATH").unwrap_or_else(|_| TRD_LOG_PATH.to_string()),
    }
});

/// Wait timeout in seconds for the command line client. `0` waits
/// indefinitely, negative values do not wait, unset follows the audio length.
pub static WAIT_TIMEOUT: Lazy<Option<WaitTimeout>> = Lazy::new(|| {
    let value = match env::var("TRD_WAIT_TIMEOUT") {
        Ok(value) => Some(value),
        Err(_) => dotenv::var("TRD_WAIT_TIMEOUT").ok(),
    };
    value
        .and_then(|value| value.trim().parse::<f64>().ok())
        .map(WaitTimeout::from_secs_f64)
});

pub fn init_env() {
    dotenv::dotenv().ok();

    if let Err(e) = std::fs::create_dir_all(LOG_PATH.as_str()) {
        eprintln!("Failed to create log directory: {}", e);
    }
}
