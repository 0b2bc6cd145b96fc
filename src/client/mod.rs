use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::{HttpJobService, JobService, ResultFormat, StartOptions, WebhookValidation};
use crate::callback::{CallbackId, CallbackRegistry, WebhookCallback};
use crate::cert::{create_self_signed_cert, TlsMaterial};
use crate::completion::{CompletionTracker, InMemoryCompletionTracker, WaitTimeout, ROOT_CHANNEL};
use crate::error::{Error, Result};
use crate::web::{ListenerIdentity, Protocol, WebhookListener};

pub mod config;

pub use config::ClientConfig;

/// Lower bound of the automatic timeout.
pub const MIN_AUTO_TIMEOUT: Duration = Duration::from_secs(30);

/// A job accepted by the transcription server.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    /// Completion channels the job waits on, fixed at submission.
    pub channels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TranscribeOutcome {
    pub submission: Submission,
    /// `None` when the result was not awaited or the wait timed out.
    pub result: Option<Value>,
}

/// Submits audio files and learns about their completion through webhooks
/// served by an embedded listener.
pub struct TranscriptionClient {
    service: Arc<dyn JobService>,
    tracker: Arc<dyn CompletionTracker>,
    callbacks: CallbackRegistry,
    listener: WebhookListener,
    /// Self-signed certificate shared with the server during validation.
    certificate: Option<String>,
    cert_dir: StdMutex<Option<TempDir>>,
    validation_timeout: Option<u64>,
    validation_retries: Option<u32>,
    /// Serializes callback changes with the restarts they trigger.
    reconfigure: Mutex<()>,
    ready: AtomicBool,
}

impl TranscriptionClient {
    /// Connects to the server at `config.api_url`, waiting for it to come up,
    /// then starts and validates the webhook listener.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let service = HttpJobService::new(
            &config.api_url,
            config.username.as_deref(),
            config.password.as_deref(),
        );
        service
            .wait_until_available(config.api_retries, config.api_retry_period)
            .await?;

        Self::with_components(
            config,
            Arc::new(service),
            Arc::new(InMemoryCompletionTracker::new()),
        )
        .await
    }

    pub async fn with_service(config: ClientConfig, service: Arc<dyn JobService>) -> Result<Self> {
        Self::with_components(config, service, Arc::new(InMemoryCompletionTracker::new())).await
    }

    pub async fn with_components(
        config: ClientConfig,
        service: Arc<dyn JobService>,
        tracker: Arc<dyn CompletionTracker>,
    ) -> Result<Self> {
        let supplied = TlsMaterial::from_pair(config.cert_path.clone(), config.key_path.clone())?;

        let host = match &config.webhook_host {
            Some(host) => host.clone(),
            None => {
                let host = service.whoami().await?;
                info!("Webhook host resolved to {}", host);
                host
            }
        };

        let (tls, certificate, cert_dir) = match (config.webhook_protocol, supplied) {
            (Protocol::Http, _) => (None, None, None),
            (Protocol::Https, Some(material)) => (Some(material), None, None),
            (Protocol::Https, None) => {
                let dir = tempfile::Builder::new().prefix("trd-webhook-").tempdir()?;
                let material = TlsMaterial::in_dir(dir.path());
                let pem = generate_certificate(host.clone(), material.clone()).await?;
                (Some(material), Some(pem), Some(dir))
            }
        };

        let identity = ListenerIdentity {
            host,
            port: config.webhook_port,
            bind_address: config.webhook_listener,
            protocol: config.webhook_protocol,
            tls,
        };

        let client = Self {
            listener: WebhookListener::new(identity, tracker.clone()),
            service,
            tracker,
            callbacks: CallbackRegistry::new(),
            certificate,
            cert_dir: StdMutex::new(cert_dir),
            validation_timeout: config.validation_timeout,
            validation_retries: config.validation_retries,
            reconfigure: Mutex::new(()),
            ready: AtomicBool::new(false),
        };
        client.rebuild().await?;
        Ok(client)
    }

    pub fn service(&self) -> &Arc<dyn JobService> {
        &self.service
    }

    pub fn tracker(&self) -> &Arc<dyn CompletionTracker> {
        &self.tracker
    }

    /// Whether the listener passed validation since its last restart.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn webhook_token(&self) -> Option<String> {
        self.listener.token()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tls_material(&self) -> Option<&TlsMaterial> {
        self.listener.identity().tls.as_ref()
    }

    pub fn certificate_pem(&self) -> Option<&str> {
        self.certificate.as_deref()
    }

    pub fn callbacks(&self) -> Vec<String> {
        self.callbacks.names()
    }

    /// Port the server should call; with port 0 the one pinned by the first bind.
    fn advertised_port(&self) -> u16 {
        self.listener.port()
    }

    pub fn webhook_root(&self) -> String {
        let identity = self.listener.identity();
        format!(
            "{}://{}:{}",
            identity.protocol,
            identity.host,
            self.advertised_port()
        )
    }

    /// Restarts the listener with the current callbacks and validates it again.
    async fn rebuild(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        let token = self.listener.restart(self.callbacks.route_table()).await?;
        self.validate(token).await?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, token: String) -> Result<()> {
        let host = self.listener.identity().host.clone();
        let port = self.advertised_port();
        let validation = WebhookValidation {
            host: host.clone(),
            port,
            token,
            certificate: self.certificate.clone(),
            timeout: self.validation_timeout,
            retries: self.validation_retries,
        };

        match self.service.validate_webhook(&validation).await {
            Ok(true) => {
                info!("Webhook {}:{} validated by the transcription server", host, port);
                Ok(())
            }
            Ok(false) => Err(Error::Connection(format!("{}:{}", host, port))),
            Err(e) => {
                error!("Webhook validation request failed: {}", e);
                Err(Error::Connection(format!("{}:{}", host, port)))
            }
        }
    }

    /// Registers a callback served on `POST /<name>/<job_id>` and restarts the
    /// listener. Jobs submitted afterwards also wait for this callback.
    pub async fn register_callback<C>(&self, callback: C, name: Option<&str>) -> Result<String>
    where
        C: WebhookCallback + 'static,
    {
        let _guard = self.reconfigure.lock().await;
        let name = self.callbacks.register(Arc::new(callback), name)?;
        self.rebuild().await?;
        Ok(name)
    }

    /// Removes callbacks and restarts the listener. Jobs still waiting on a
    /// removed callback have that channel released.
    pub async fn unregister_callback(&self, ids: &[CallbackId]) -> Result<Vec<String>> {
        let _guard = self.reconfigure.lock().await;
        let removed = self.callbacks.unregister(ids);
        self.release_removed(&removed);
        self.rebuild().await?;
        Ok(removed)
    }

    pub async fn unregister_all(&self) -> Result<Vec<String>> {
        let _guard = self.reconfigure.lock().await;
        let removed = self.callbacks.unregister_all();
        self.release_removed(&removed);
        self.rebuild().await?;
        Ok(removed)
    }

    fn release_removed(&self, removed: &[String]) {
        for name in removed {
            let released = self.tracker.release(name);
            if released > 0 {
                warn!("Released {} pending {} channels after unregistering", released, name);
            }
        }
    }

    /// Uploads `path` and starts its transcription without waiting.
    pub async fn submit(&self, path: impl AsRef<Path>) -> Result<Submission> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        let path = path.as_ref();
        let job_id = self.service.upload(path, None).await?;

        let _guard = self.reconfigure.lock().await;
        // A restart may have failed validation while we waited for the lock.
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        let root = self.webhook_root();
        let callback_names = self.callbacks.names();

        let mut channels = vec![ROOT_CHANNEL.to_string()];
        channels.extend(callback_names.iter().cloned());
        let mut webhooks = vec![root.clone()];
        webhooks.extend(callback_names.iter().map(|name| format!("{}/{}", root, name)));

        // Channels exist before the server can call back.
        self.tracker.register(&job_id, &channels);
        if let Err(e) = self
            .service
            .start(&job_id, &StartOptions::with_webhooks(webhooks))
            .await
        {
            self.tracker.forget(&job_id);
            return Err(e);
        }

        info!("Submitted {:?} as job {}", path, job_id);
        Ok(Submission {
            job_id,
            submitted_at: Utc::now(),
            channels,
        })
    }

    /// Submits `path` and waits for its result.
    ///
    /// `None` picks the timeout from the audio length (at least 30 seconds).
    /// `WaitTimeout::NoWait` returns right after submission.
    pub async fn transcribe(
        &self,
        path: impl AsRef<Path>,
        timeout: Option<WaitTimeout>,
        delete_after: bool,
    ) -> Result<TranscribeOutcome> {
        let path = path.as_ref();
        let timeout = timeout.unwrap_or_else(|| auto_timeout(path));

        let submission = self.submit(path).await?;
        if timeout == WaitTimeout::NoWait {
            return Ok(TranscribeOutcome {
                submission,
                result: None,
            });
        }

        let result = self
            .wait_result(&submission.job_id, timeout, delete_after)
            .await?;
        Ok(TranscribeOutcome { submission, result })
    }

    /// Waits for every channel of the job, then fetches its result. Returns
    /// `None` when the timeout elapses first.
    pub async fn wait_result(
        &self,
        job_id: &str,
        timeout: WaitTimeout,
        delete_after: bool,
    ) -> Result<Option<Value>> {
        if !self.tracker.await_all(job_id, timeout).await {
            info!("Timed out waiting for job {}", job_id);
            return Ok(None);
        }

        let result = self.service.result(job_id, ResultFormat::Json).await?;
        if delete_after {
            self.service.delete(job_id, false).await?;
        }
        Ok(Some(result))
    }

    pub async fn status(&self, job_id: &str) -> Result<Value> {
        self.service.status(job_id).await
    }

    /// Stops the listener and removes a generated certificate. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.listener.stop().await;

        let cert_dir = self.cert_dir.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(dir) = cert_dir {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => info!("Removed certificate directory {:?}", path),
                Err(e) => warn!("Failed to remove certificate directory {:?}: {}", path, e),
            }
        }
    }
}

async fn generate_certificate(host: String, material: TlsMaterial) -> Result<String> {
    tokio::task::spawn_blocking(move || create_self_signed_cert(&host, &material))
        .await
        .map_err(|e| Error::Certificate(format!("certificate task failed: {}", e)))?
}

/// `max(30 s, audio duration)` for WAV input, 30 s when the duration is unknown.
pub fn auto_timeout(path: &Path) -> WaitTimeout {
    match audio_duration(path) {
        Ok(duration) => WaitTimeout::PerChannel(duration.max(MIN_AUTO_TIMEOUT)),
        Err(e) => {
            warn!("Cannot read duration of {:?}, using {:?}: {}", path, MIN_AUTO_TIMEOUT, e);
            WaitTimeout::PerChannel(MIN_AUTO_TIMEOUT)
        }
    }
}

pub fn audio_duration(path: &Path) -> Result<Duration> {
    let reader = hound::WavReader::open(path)?;
    let sample_rate = reader.spec().sample_rate;
    if sample_rate == 0 {
        return Err(Error::Validation(format!("{:?} has a zero sample rate", path)));
    }
    Ok(Duration::from_secs_f64(
        reader.duration() as f64 / sample_rate as f64,
    ))
}
