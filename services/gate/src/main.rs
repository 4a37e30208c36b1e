//! edgegate
//!
//! Source-restricted transparent TCP forwarder.
//!
//! This service:
//! - Resolves the backend address at startup (optionally re-resolving it)
//! - Builds the admission index from the local allow list, prefix lists and ASNs
//! - Accepts plaintext and TLS connections on two listeners
//! - Relays admitted connections to the backend without inspecting them

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edgegate::config::{Config, LogFormat};
use edgegate::destination::{self, Destination};
use edgegate::proxy::{BufferPool, DialResolver, ListenerConfig, ServerGroup};
use edgegate::sources;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.default_filter().into()),
    );
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Starting edgegate");

    let shutdown = CancellationToken::new();

    let addr = destination::discover_ipv4(&config.destination_host).await?;
    let destination = Arc::new(Destination::new(addr));
    info!(
        destination_host = %config.destination_host,
        destination = %addr,
        "Destination resolved"
    );

    if let Some(interval) = config.resolve_interval() {
        destination::spawn_refresh(
            Arc::clone(&destination),
            config.destination_host.clone(),
            interval,
            shutdown.clone(),
        );
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("edgegate/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let index = Arc::new(sources::build_index(&config.range_sources(), &client).await?);

    let listener = |port: u16, destination_port: u16| {
        let resolver = DialResolver::new(Arc::clone(&destination), destination_port)
            .with_connect_timeout(config.connect_timeout());
        ListenerConfig::new(config.host.clone(), port, Arc::clone(&index), Arc::new(resolver))
            .verbose(config.verbose)
    };
    let listeners = [
        listener(config.port, config.destination_port),
        listener(config.port_tls, config.destination_port_tls),
    ];

    let group = ServerGroup::bind(listeners, Arc::new(BufferPool::new())).await?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    return;
                }
            }
            shutdown.cancel();
        }
    });

    group.run(shutdown).await?;

    info!("edgegate shutdown complete");
    Ok(())
}
