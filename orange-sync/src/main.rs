use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use orange_sync::registry::LoggingCacheSink;
use orange_sync::{InMemoryRegistry, SyncConfig, SyncHandler, SyncOptions, SyncTiming, TlsBundle};

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (ORANGE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("ORANGE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("orange_sync=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = SyncConfig::parse();
    config.validate().context("invalid configuration")?;

    let tls = TlsBundle::load(&config.cert_dir)
        .with_context(|| format!("failed to load certificates from {}", config.cert_dir.display()))?;

    let registry = Arc::new(InMemoryRegistry::from_specs(&config.modules));
    let sink = Arc::new(LoggingCacheSink);

    let identity = config.identity();
    tracing::info!(
        name = %identity.name,
        env = %identity.environment,
        priority = identity.priority,
        port = config.sync_port,
        "starting sync node"
    );

    let handler = SyncHandler::start(SyncOptions {
        identity,
        timing: SyncTiming::default(),
        bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.sync_port)),
        my_address: config.my_address.clone(),
        peers: config.peers.clone(),
        preferred_modules: config.preferred_modules.clone(),
        tls,
        registry,
        sink,
        cache_file: config.cache_file.clone(),
    })
    .await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");
    handler.shutdown();
    Ok(())
}
