//! TCP acceptor: binds (or adopts an inherited listener for), accepts, and
//! spawns one [`ClientHandler`] per connection. Graceful shutdown on
//! `SIGHUP`/`SIGTERM`.

use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::client_handler::ClientHandler;
use crate::config::Config;
use crate::middleware::MiddlewareRegistry;

/// Environment variable carrying a comma-separated list of inherited
/// listening file descriptors, as a process supervisor doing graceful
/// restarts would set. Only the first entry is adopted.
const INHERITED_LISTENER_ENV: &str = "LISTEN_FDS_FIRST";

pub struct Server {
    config: Arc<Config>,
    middleware: Arc<MiddlewareRegistry>,
    server_tls: Arc<rustls::ServerConfig>,
    origin_tls: Arc<rustls::ClientConfig>,
    next_id: AtomicU64,
    live_connections: Arc<AtomicI64>,
}

impl Server {
    pub fn new(
        config: Config,
        middleware: MiddlewareRegistry,
        server_tls: rustls::ServerConfig,
        origin_tls: rustls::ClientConfig,
    ) -> Self {
        Server {
            config: Arc::new(config),
            middleware: Arc::new(middleware),
            server_tls: Arc::new(server_tls),
            origin_tls: Arc::new(origin_tls),
            next_id: AtomicU64::new(1),
            live_connections: Arc::new(AtomicI64::new(0)),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        info!(addr = %self.config.listen_addr, "listening");

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    self.spawn_handler(socket, peer_addr.to_string());
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, shutting down acceptor");
                    return Ok(());
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down acceptor");
                    return Ok(());
                }
            }
        }
    }

    async fn bind(&self) -> Result<TcpListener> {
        if let Some(listener) = inherited_listener()? {
            info!("adopted inherited listener");
            return Ok(listener);
        }

        TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))
    }

    fn spawn_handler(&self, socket: tokio::net::TcpStream, src_ip: String) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live_connections.fetch_add(1, Ordering::SeqCst);

        let handler = ClientHandler::new(
            id,
            self.config.clone(),
            self.middleware.clone(),
            self.server_tls.clone(),
            self.origin_tls.clone(),
            self.live_connections.clone(),
        );

        tokio::spawn(async move {
            if let Err(e) = handler.handle(socket, src_ip).await {
                error!(conn = id, error = ?e, "connection ended with error");
            }
        });
    }
}

/// Adopt the first file descriptor named by [`INHERITED_LISTENER_ENV`], if
/// set, as a already-bound, already-listening socket.
fn inherited_listener() -> Result<Option<TcpListener>> {
    let Ok(raw) = std::env::var(INHERITED_LISTENER_ENV) else {
        return Ok(None);
    };

    let fd: RawFd = raw
        .split(',')
        .next()
        .unwrap_or(&raw)
        .trim()
        .parse()
        .with_context(|| format!("invalid {INHERITED_LISTENER_ENV} value {raw:?}"))?;

    // SAFETY: the supervisor that set `LISTEN_FDS_FIRST` is contractually
    // responsible for `fd` being a valid, already-bound TCP listener handed
    // off exclusively to this process.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;

    Ok(Some(TcpListener::from_std(std_listener)?))
}
