//! Binary entry-point for the FTP intercepting reverse proxy.

mod client_handler;
mod client_writer;
mod codec;
mod config;
mod context;
mod error;
mod handlers;
mod middleware;
mod proxy_leg;
mod result;
mod server;
mod stream;
mod tls;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use middleware::MiddlewareRegistry;
use server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let (cli, cfg) = config::load_config()?;

    let log_level = cli.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("configuration loaded from {:?}", cli.config);
    info!(listen = %cfg.listen_addr, remote = %cfg.remote_addr, "starting ftpbridge");

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default rustls crypto provider"))?;

    let server_tls = tls::build_server_config(&cfg.tls)?;
    let origin_tls = tls::build_client_config(&cfg.tls)?;

    let middleware = register_middleware();

    let server = Server::new(cfg, middleware, server_tls, origin_tls);
    if let Err(e) = server.run().await {
        error!(error = ?e, "server exited with error");
        return Err(e);
    }

    Ok(())
}

/// Hook point for operators embedding this proxy: register verb middleware
/// here. Empty by default.
fn register_middleware() -> MiddlewareRegistry {
    MiddlewareRegistry::new()
}
