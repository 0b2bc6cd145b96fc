//! Embedded webhook receiver.
//!
//! Every (re)start builds a new generation: a fresh validation token, an
//! immutable route table and its own server task. Restarting stops the old
//! generation before binding the new one, so requests during the swap are
//! refused at the socket and never see a partially built table.

use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::callback::RouteTable;
use crate::cert::TlsMaterial;
use crate::completion::CompletionTracker;
use crate::error::{Error, Result};

mod handlers;

use handlers::GenerationState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(Error::Validation(format!("invalid protocol: {}", other))),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.scheme())
    }
}

/// Where the listener binds and how the remote service should reach it.
#[derive(Debug, Clone)]
pub struct ListenerIdentity {
    /// Host advertised in webhook URLs.
    pub host: String,
    pub port: u16,
    pub bind_address: IpAddr,
    pub protocol: Protocol,
    pub tls: Option<TlsMaterial>,
}

impl ListenerIdentity {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Stopped,
    Starting,
    Running,
}

struct RunningServer {
    generation: u64,
    handle: Handle,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct ActiveGeneration {
    generation: u64,
    token: String,
    local_addr: SocketAddr,
}

pub struct WebhookListener {
    identity: ListenerIdentity,
    tracker: Arc<dyn CompletionTracker>,
    server: Mutex<Option<RunningServer>>,
    active: StdMutex<Option<ActiveGeneration>>,
    status: StdMutex<ListenerStatus>,
    generation: AtomicU64,
    /// Port resolved by the first bind; later generations reuse it so webhook
    /// URLs handed out earlier stay valid.
    bound_port: AtomicU16,
    shutdown_grace: Duration,
}

fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Fails only when another provider is already installed, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

impl WebhookListener {
    pub fn new(identity: ListenerIdentity, tracker: Arc<dyn CompletionTracker>) -> Self {
        Self {
            identity,
            tracker,
            server: Mutex::new(None),
            active: StdMutex::new(None),
            status: StdMutex::new(ListenerStatus::Stopped),
            generation: AtomicU64::new(0),
            bound_port: AtomicU16::new(0),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// How long a stopping generation waits for in-flight requests.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn identity(&self) -> &ListenerIdentity {
        &self.identity
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of the running generation, `None` while stopped.
    pub fn generation(&self) -> Option<u64> {
        self.active().map(|active| active.generation)
    }

    /// Validation token of the running generation.
    pub fn token(&self) -> Option<String> {
        self.active().map(|active| active.token)
    }

    /// Address the running generation is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active().map(|active| active.local_addr)
    }

    fn active(&self) -> Option<ActiveGeneration> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_status(&self, status: ListenerStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn set_active(&self, active: Option<ActiveGeneration>) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = active;
    }

    /// Starts a generation serving `routes`, stopping a running one first.
    /// Returns the new validation token.
    pub async fn start(&self, routes: RouteTable) -> Result<String> {
        self.restart(routes).await
    }

    /// Stops the current generation and starts a new one with a fresh token.
    /// Tokens of earlier generations are rejected from here on.
    pub async fn restart(&self, routes: RouteTable) -> Result<String> {
        let mut server = self.server.lock().await;
        if let Some(running) = server.take() {
            self.shutdown(running).await;
        }

        self.set_status(ListenerStatus::Starting);
        match self.launch(routes).await {
            Ok((running, active)) => {
                let token = active.token.clone();
                *server = Some(running);
                self.set_active(Some(active));
                self.set_status(ListenerStatus::Running);
                Ok(token)
            }
            Err(e) => {
                error!("Webhook listener failed to start: {}", e);
                self.set_status(ListenerStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Stops the running generation and releases its socket. Idempotent.
    pub async fn stop(&self) {
        let mut server = self.server.lock().await;
        match server.take() {
            Some(running) => self.shutdown(running).await,
            None => {
                self.set_active(None);
                self.set_status(ListenerStatus::Stopped);
            }
        }
    }

    async fn shutdown(&self, running: RunningServer) {
        self.set_active(None);
        running.handle.graceful_shutdown(Some(self.shutdown_grace));
        if let Err(e) = running.task.await {
            warn!("Webhook server task ended abnormally: {}", e);
        }
        self.set_status(ListenerStatus::Stopped);
        info!("Webhook listener generation {} stopped", running.generation);
    }

    /// Configured port, or the one pinned by the first bind when configured with 0.
    pub fn port(&self) -> u16 {
        match self.identity.port {
            0 => self.bound_port.load(Ordering::SeqCst),
            port => port,
        }
    }

    async fn launch(&self, routes: RouteTable) -> Result<(RunningServer, ActiveGeneration)> {
        let addr = SocketAddr::new(self.identity.bind_address, self.port());
        let listener = StdTcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;
        self.bound_port.store(local_addr.port(), Ordering::SeqCst);

        let tls_config = match self.identity.protocol {
            Protocol::Http => None,
            Protocol::Https => Some(self.load_tls().await?),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = Uuid::new_v4().to_string();
        let route_names = routes.names();
        let state = Arc::new(GenerationState {
            generation,
            token: token.clone(),
            routes,
            tracker: self.tracker.clone(),
        });
        let app = handlers::router(state).into_make_service();

        let handle = Handle::new();
        let task = match tls_config {
            None => {
                let server = axum_server::from_tcp(listener).handle(handle.clone());
                tokio::spawn(async move {
                    if let Err(e) = server.serve(app).await {
                        error!("Webhook server error: {}", e);
                    }
                })
            }
            Some(config) => {
                let server = axum_server::from_tcp_rustls(listener, config).handle(handle.clone());
                tokio::spawn(async move {
                    if let Err(e) = server.serve(app).await {
                        error!("Webhook server error: {}", e);
                    }
                })
            }
        };

        info!(
            "Webhook listener generation {} serving {}://{} with callbacks {:?}",
            generation, self.identity.protocol, local_addr, route_names
        );

        Ok((
            RunningServer {
                generation,
                handle,
                task,
            },
            ActiveGeneration {
                generation,
                token,
                local_addr,
            },
        ))
    }

    async fn load_tls(&self) -> Result<RustlsConfig> {
        install_crypto_provider();
        let material = self
            .identity
            .tls
            .as_ref()
            .ok_or_else(|| Error::Certificate("https listener without certificate material".into()))?;
        RustlsConfig::from_pem_file(&material.cert_path, &material.key_path)
            .await
            .map_err(|e| {
                Error::Certificate(format!(
                    "cannot load {:?} / {:?}: {}",
                    material.cert_path, material.key_path, e
                ))
            })
    }
}

impl Drop for WebhookListener {
    fn drop(&mut self) {
        if let Some(running) = self.server.get_mut().take() {
            running.handle.shutdown();
            info!(
                "Webhook listener generation {} shut down on drop",
                running.generation
            );
        }
    }
}

#[cfg(test)]
mod tests;
