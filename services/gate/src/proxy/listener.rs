//! TCP acceptor and per-connection handling.
//!
//! An [`Acceptor`] owns one listening socket. For every inbound connection it
//! runs the admission check against the prefix index inline, then hands the
//! connection to its own task which resolves the destination and runs the
//! relay. Nothing that happens to a single connection reaches the accept
//! loop; only a failing `accept()` ends it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use edgegate_networking::{NetworkError, PrefixIndex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::buffer_pool::BufferPool;
use super::relay::Relay;
use super::resolver::Resolver;
use crate::error::ProxyError;

/// Configuration for one listener. Fixed once the acceptor is bound.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Host to bind to (IP literal or name).
    pub host: String,
    /// Port to bind to.
    pub port: u16,
    /// Prefixes whose sources are admitted.
    pub index: Arc<PrefixIndex>,
    /// Produces the backend connection for admitted sources.
    pub resolver: Arc<dyn Resolver>,
    /// Emit listening/accept/reject/relay-error lines at info level.
    pub verbose: bool,
    /// Cancel in-flight relays when the acceptor is shut down.
    pub abort_relays_on_shutdown: bool,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        index: Arc<PrefixIndex>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            index,
            resolver,
            verbose: false,
            abort_relays_on_shutdown: false,
        }
    }

    /// Enable or disable per-connection logging.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Cancel established relays on shutdown instead of letting them drain.
    pub fn abort_relays_on_shutdown(mut self, abort: bool) -> Self {
        self.abort_relays_on_shutdown = abort;
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("prefixes", &self.index.len())
            .field("verbose", &self.verbose)
            .field("abort_relays_on_shutdown", &self.abort_relays_on_shutdown)
            .finish_non_exhaustive()
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Connections admitted by the prefix index.
    pub connections_accepted: AtomicU64,
    /// Connections from sources outside every prefix.
    pub connections_rejected: AtomicU64,
    /// Connections whose source address could not be checked.
    pub connections_unusable: AtomicU64,
    /// Admitted connections whose destination could not be resolved.
    pub resolve_failed: AtomicU64,
    /// Relays currently running.
    pub relays_active: AtomicU64,
    /// Relays finished, successfully or not.
    pub relays_completed: AtomicU64,
    /// Relays that ended with an error.
    pub relay_errors: AtomicU64,
    /// Bytes relayed from sources to destinations.
    pub bytes_to_destination: AtomicU64,
    /// Bytes relayed from destinations back to sources.
    pub bytes_from_destination: AtomicU64,
}

/// Outcome of the admission check for one source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Source is inside a registered prefix.
    Admitted,
    /// Source is outside every registered prefix.
    Rejected,
    /// Source address cannot be checked.
    Unusable(NetworkError),
}

/// State shared between the accept loop and its connection tasks.
///
/// Connection tasks hold this rather than the acceptor, so the listening
/// socket closes as soon as the accept loop ends.
struct Shared {
    config: ListenerConfig,
    pool: Arc<BufferPool>,
    stats: Arc<ListenerStats>,
}

/// Accepts connections on one listening socket.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Acceptor {
    /// Bind the configured address.
    pub async fn bind(config: ListenerConfig, pool: Arc<BufferPool>) -> Result<Self, ProxyError> {
        let addr = config.bind_addr();
        let bind_err = |source: io::Error| ProxyError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        if config.verbose {
            info!(bind_addr = %local_addr, prefixes = config.index.len(), "Listening");
        } else {
            debug!(bind_addr = %local_addr, prefixes = config.index.len(), "Listening");
        }

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                config,
                pool,
                stats: Arc::new(ListenerStats::default()),
            }),
        })
    }

    /// The address this acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Listener statistics. Stays readable after the acceptor stops.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Check a source address against the prefix index.
    pub fn admit(&self, peer_addr: SocketAddr) -> Admission {
        self.shared.admit(peer_addr)
    }

    /// Accept connections until `shutdown` fires or `accept()` fails.
    ///
    /// Returns `Ok` on shutdown. In-flight relays keep running unless the
    /// listener was configured with `abort_relays_on_shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        let local_addr = self.local_addr;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(bind_addr = %local_addr, "Listener stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer_addr) = accepted.map_err(|source| ProxyError::Accept {
                addr: local_addr,
                source,
            })?;

            if !self.shared.check_admission(peer_addr) {
                drop(stream);
                continue;
            }

            let shared = Arc::clone(&self.shared);
            let relay_scope = shared
                .config
                .abort_relays_on_shutdown
                .then(|| shutdown.clone());

            tokio::spawn(
                async move { shared.handle_connection(stream, peer_addr, relay_scope).await }
                    .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }
    }
}

impl Shared {
    fn admit(&self, peer_addr: SocketAddr) -> Admission {
        match self.config.index.contains(peer_addr.ip()) {
            Ok(true) => Admission::Admitted,
            Ok(false) => Admission::Rejected,
            Err(e) => Admission::Unusable(e),
        }
    }

    /// Run the admission check, record it and log it. Returns true to admit.
    fn check_admission(&self, peer_addr: SocketAddr) -> bool {
        let verbose = self.config.verbose;

        match self.admit(peer_addr) {
            Admission::Admitted => {
                self.stats
                    .connections_accepted
                    .fetch_add(1, Ordering::Relaxed);
                if verbose {
                    info!(peer_addr = %peer_addr, "accept");
                }
                true
            }
            Admission::Rejected => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                if verbose {
                    info!(peer_addr = %peer_addr, "reject");
                }
                false
            }
            Admission::Unusable(e) => {
                self.stats
                    .connections_unusable
                    .fetch_add(1, Ordering::Relaxed);
                debug!(peer_addr = %peer_addr, error = %e, "reject: unusable source address");
                false
            }
        }
    }

    /// Resolve the destination and relay until both directions finish.
    async fn handle_connection(
        &self,
        source: TcpStream,
        peer_addr: SocketAddr,
        relay_scope: Option<CancellationToken>,
    ) {
        let verbose = self.config.verbose;

        let destination = match self.config.resolver.resolve(&source).await {
            Ok(destination) => destination,
            Err(e) => {
                self.stats.resolve_failed.fetch_add(1, Ordering::Relaxed);
                if verbose {
                    warn!(peer_addr = %peer_addr, error = %e, "Destination resolution failed");
                } else {
                    debug!(peer_addr = %peer_addr, error = %e, "Destination resolution failed");
                }
                return;
            }
        };

        self.stats.relays_active.fetch_add(1, Ordering::Relaxed);

        let mut relay = Relay::new(Arc::clone(&self.pool));
        if let Some(scope) = &relay_scope {
            relay = relay.with_cancellation(scope);
        }

        match relay.run(source, destination).await {
            Ok(transferred) => {
                self.stats
                    .bytes_to_destination
                    .fetch_add(transferred.to_destination, Ordering::Relaxed);
                self.stats
                    .bytes_from_destination
                    .fetch_add(transferred.from_destination, Ordering::Relaxed);
                debug!(
                    bytes_to_destination = transferred.to_destination,
                    bytes_from_destination = transferred.from_destination,
                    "Connection closed"
                );
            }
            Err(e) => {
                self.stats.relay_errors.fetch_add(1, Ordering::Relaxed);
                if verbose {
                    warn!(peer_addr = %peer_addr, error = %e, "Relay error");
                } else {
                    debug!(peer_addr = %peer_addr, error = %e, "Relay error");
                }
            }
        }

        self.stats.relays_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.relays_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bind `config` and accept until `shutdown` fires or `accept()` fails.
pub async fn run_acceptor(
    config: ListenerConfig,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
) -> Result<(), ProxyError> {
    Acceptor::bind(config, pool).await?.run(shutdown).await
}
