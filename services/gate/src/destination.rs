//! Backend address discovery.
//!
//! The backend is found by resolving a hostname at startup. The address is
//! held in an [`ArcSwap`] so an optional refresh loop can replace it while
//! resolvers read it without locking. Updates are whole-snapshot stores.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The current backend address.
#[derive(Debug)]
pub struct Destination {
    current: ArcSwap<IpAddr>,
}

impl Destination {
    /// Create a destination pointing at `addr`.
    pub fn new(addr: IpAddr) -> Self {
        Self {
            current: ArcSwap::from_pointee(addr),
        }
    }

    /// Current backend address.
    pub fn current(&self) -> IpAddr {
        **self.current.load()
    }

    /// Atomically replace the backend address.
    pub fn replace(&self, addr: IpAddr) {
        self.current.store(Arc::new(addr));
    }
}

/// Resolve `host` and return its first IPv4 address.
pub async fn discover_ipv4(host: &str) -> Result<IpAddr> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("failed to resolve destination host {}", host))?;

    addrs
        .map(|addr| addr.ip())
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| anyhow!("failed to find a destination IPv4 for {}", host))
}

/// Periodically re-resolve `host` and swap the result into `destination`.
///
/// A failed lookup keeps the previous address. Stops when `shutdown` fires.
pub fn spawn_refresh(
    destination: Arc<Destination>,
    host: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; startup already resolved.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Destination refresh stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match discover_ipv4(&host).await {
                Ok(addr) if addr != destination.current() => {
                    info!(host = %host, destination = %addr, "Destination address changed");
                    destination.replace(addr);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(host = %host, error = %e, "Destination refresh failed");
                }
            }
        }
    })
}
