//! Lifecycle Manager
//!
//! Owns the listener and the background serving task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{create_router, AppState};
use crate::auth::AuthGuard;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::events::{tracing_sink, LogSink, RequestObserver};
use crate::store::BlobStore;

/// Address family of the bound listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    IPv4,
    IPv6,
}

impl AddressFamily {
    fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::IPv4,
            SocketAddr::V6(v6) if v6.ip().to_ipv4_mapped().is_some() => AddressFamily::IPv4,
            SocketAddr::V6(_) => AddressFamily::IPv6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::IPv4 => f.write_str("IPv4"),
            AddressFamily::IPv6 => f.write_str("IPv6"),
        }
    }
}

/// What `start` reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Bound IP address
    pub address: String,
    /// Base URL clients should use
    pub url: String,
    pub family: AddressFamily,
    pub port: u16,
    pub local_addr: SocketAddr,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<std::io::Result<()>>,
}

/// Blob storage emulation server
pub struct BlobsServer {
    config: ServerConfig,
    /// Built on construction, shared once the server first starts
    pending: Option<AppState>,
    state: Option<Arc<AppState>>,
    running: Option<Running>,
}

impl BlobsServer {
    /// Create a server. The token is moved into the auth guard and dropped
    /// from the configuration.
    pub fn new(mut config: ServerConfig) -> Self {
        let guard = AuthGuard::new(config.token.take());
        let pending = AppState {
            store: BlobStore::new(config.directory.clone()),
            guard,
            observer: None,
            logger: tracing_sink(),
            debug: config.debug,
            max_body_bytes: config.max_body_bytes,
            port: AtomicU16::new(config.port),
        };

        Self {
            config,
            pending: Some(pending),
            state: None,
            running: None,
        }
    }

    /// Observer notified once per dispatched request. Has no effect after
    /// the first `start`.
    pub fn with_observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        if let Some(pending) = self.pending.as_mut() {
            pending.observer = Some(observer);
        }
        self
    }

    /// Sink for debug request logging. Has no effect after the first `start`.
    pub fn with_logger(mut self, logger: LogSink) -> Self {
        if let Some(pending) = self.pending.as_mut() {
            pending.logger = logger;
        }
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn shared_state(&mut self) -> Result<Arc<AppState>> {
        if let Some(pending) = self.pending.take() {
            self.state = Some(Arc::new(pending));
        }
        self.state
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::Server("server state unavailable".into()))
    }

    /// Create the storage root, bind and start serving in the background
    pub async fn start(&mut self) -> Result<ServerInfo> {
        if self.running.is_some() {
            return Err(Error::Server("server already started".into()));
        }

        let state = self.shared_state()?;
        state.store.ensure_root().await?;

        let bind_address = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind_address)
            .await
            .map_err(|e| Error::Server(format!("failed to bind {}: {}", bind_address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Server(format!("failed to read bound address: {}", e)))?;

        state.port.store(local_addr.port(), Ordering::Relaxed);
        let app = create_router(Arc::clone(&state));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
        });

        self.running = Some(Running {
            shutdown: shutdown_tx,
            handle,
        });

        let info = ServerInfo {
            address: local_addr.ip().to_string(),
            url: format!("http://localhost:{}", local_addr.port()),
            family: AddressFamily::of(&local_addr),
            port: local_addr.port(),
            local_addr,
        };

        tracing::info!(
            "Blob server listening on {} ({}), storing under {}",
            local_addr,
            info.family,
            state.store.root().display()
        );

        Ok(info)
    }

    /// Stop accepting connections and wait for in-flight requests.
    /// Does nothing if the server is not running.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        running
            .handle
            .await
            .map_err(|e| Error::Server(format!("server task failed: {}", e)))?
            .map_err(|e| Error::Server(format!("HTTP server error: {}", e)))?;

        tracing::info!("Blob server stopped");
        Ok(())
    }
}
