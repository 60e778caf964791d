//! Binary entry-point for the multi-protocol forward proxy.

mod auth;
mod config;
mod dispatch;
mod error;
mod http_proxy;
mod model;
mod peekable;
mod rewrite;
mod sni;
mod socks5;
mod tls;
mod tunnel;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let (cli, cfg) = config::load_config()?;

    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!(listen = %cfg.listen_addr, auth = cfg.credential.is_some(), tls = cfg.cert_bundle.is_some(), "configuration loaded");

    let dispatcher = dispatch::Dispatcher::new(cfg)?;
    if let Err(e) = dispatcher.run().await {
        error!(error = %e, "proxy exited with error");
        std::process::exit(1);
    }

    Ok(())
}
