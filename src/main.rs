use std::path::PathBuf;

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod balance;
mod catalog;
mod config;
mod dedup;
mod error;
mod payment;
mod proxy;
mod relay;
mod router;
mod signer;
mod strip;
mod traffic;
mod upstream;

pub use config::Config;
pub use error::ProxyError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clawrouter=info,tower_http=warn".into()),
        )
        .init();

    // Optional config file; everything has defaults, so running without one
    // is the common case for the standalone binary.
    let config = match std::env::var("CLAWROUTER_CONFIG").map(PathBuf::from) {
        Ok(path) => Config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        Err(_) => Config::default(),
    };

    let wallet_key = config::wallet_key_from_env()
        .context("WALLET_KEY must be set (0x-prefixed hex) when running standalone")?;

    let handle = proxy::start(proxy::ProxyOptions {
        config,
        wallet_key: Some(wallet_key),
        balance_probe: None,
    })
    .await?;

    info!(
        url = %handle.base_url(),
        wallet = %handle.wallet_address(),
        "clawrouter ready"
    );

    shutdown_signal().await;
    info!("shutdown signal received");
    handle.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
