use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::web::Protocol;

pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;
pub const DEFAULT_API_RETRIES: u32 = 60;
pub const DEFAULT_API_RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the transcription server API.
    pub api_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Host advertised to the server. Resolved through `whoami` when unset.
    pub webhook_host: Option<String>,
    pub webhook_port: u16,
    /// Local address the listener binds to.
    pub webhook_listener: IpAddr,
    pub webhook_protocol: Protocol,
    /// Operator-supplied certificate and key, set together or not at all.
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub api_retries: u32,
    pub api_retry_period: Duration,
    /// Passed to the server's webhook validation, in seconds.
    pub validation_timeout: Option<u64>,
    pub validation_retries: Option<u32>,
}

impl ClientConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            username: None,
            password: None,
            webhook_host: None,
            webhook_port: DEFAULT_WEBHOOK_PORT,
            webhook_listener: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            webhook_protocol: Protocol::Https,
            cert_path: None,
            key_path: None,
            api_retries: DEFAULT_API_RETRIES,
            api_retry_period: DEFAULT_API_RETRY_PERIOD,
            validation_timeout: None,
            validation_retries: None,
        }
    }

    /// Reads `TRD_*` variables from the environment, falling back to `.env`.
    ///
    /// `TRD_API_URL` is required; everything else keeps the defaults of [`ClientConfig::new`].
    pub fn from_env() -> Result<Self> {
        let api_url = env_var("TRD_API_URL")
            .ok_or_else(|| Error::Validation("TRD_API_URL is not set".into()))?;
        let mut config = Self::new(api_url);

        config.username = env_var("TRD_USERNAME");
        config.password = env_var("TRD_PASSWORD");
        config.webhook_host = env_var("TRD_WEBHOOK_HOST");
        if let Some(port) = env_var("TRD_WEBHOOK_PORT") {
            config.webhook_port = parse("TRD_WEBHOOK_PORT", &port)?;
        }
        if let Some(listener) = env_var("TRD_WEBHOOK_LISTENER") {
            config.webhook_listener = parse("TRD_WEBHOOK_LISTENER", &listener)?;
        }
        if let Some(protocol) = env_var("TRD_WEBHOOK_PROTOCOL") {
            config.webhook_protocol = protocol.parse()?;
        }
        config.cert_path = env_var("TRD_CERT_PATH").map(PathBuf::from);
        config.key_path = env_var("TRD_KEY_PATH").map(PathBuf::from);
        if let Some(retries) = env_var("TRD_API_RETRIES") {
            config.api_retries = parse("TRD_API_RETRIES", &retries)?;
        }
        if let Some(period) = env_var("TRD_API_RETRY_PERIOD") {
            config.api_retry_period = parse_period("TRD_API_RETRY_PERIOD", &period)?;
        }

        Ok(config)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_webhook(mut self, host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        self.webhook_host = Some(host.into());
        self.webhook_port = port;
        self.webhook_protocol = protocol;
        self
    }

    pub fn with_listener(mut self, address: IpAddr) -> Self {
        self.webhook_listener = address;
        self
    }

    pub fn with_certificate(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    let value = match env::var(name) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(name).ok(),
    };
    value.filter(|value| !value.is_empty())
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Validation(format!("{} has an invalid value: {}", name, value)))
}

/// Seconds as a `Duration`; negative values clamp to zero, values a
/// `Duration` cannot hold are rejected.
fn parse_period(name: &str, value: &str) -> Result<Duration> {
    let secs: f64 = parse(name, value)?;
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_err(|_| Error::Validation(format!("{} is out of range: {}", name, value)))
}
