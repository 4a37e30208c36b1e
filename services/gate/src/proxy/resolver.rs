//! Destination resolution.
//!
//! A [`Resolver`] turns an admitted source connection into a live connection
//! to the backend. Each listener gets its own resolver so plaintext and TLS
//! traffic can go to different backend ports.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::destination::Destination;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Produces a destination connection for an admitted source connection.
///
/// Called from the per-connection task, so a slow resolver only delays the
/// connection it is resolving. Implementations must not block indefinitely.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, source: &TcpStream) -> io::Result<TcpStream>;
}

/// Dials the current backend address on a fixed port.
#[derive(Debug, Clone)]
pub struct DialResolver {
    destination: Arc<Destination>,
    port: u16,
    connect_timeout: Duration,
}

impl DialResolver {
    /// Create a resolver dialing `destination` on `port`.
    pub fn new(destination: Arc<Destination>, port: u16) -> Self {
        Self {
            destination,
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the backend connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The address the next resolution would dial.
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.destination.current(), self.port)
    }
}

#[async_trait]
impl Resolver for DialResolver {
    async fn resolve(&self, _source: &TcpStream) -> io::Result<TcpStream> {
        let addr = self.target();
        debug!(backend_addr = %addr, "Connecting to backend");

        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        (stream, listener)
    }

    #[tokio::test]
    async fn test_dial_resolver_connects_to_current_destination() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();

        let destination = Arc::new(Destination::new("127.0.0.1".parse().unwrap()));
        let resolver = DialResolver::new(destination, port);
        assert_eq!(resolver.target(), backend.local_addr().unwrap());

        let (source, _source_listener) = loopback_pair().await;
        let dst = resolver.resolve(&source).await.unwrap();
        assert_eq!(dst.peer_addr().unwrap(), backend.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_dial_resolver_follows_replaced_destination() {
        let destination = Arc::new(Destination::new("192.0.2.1".parse().unwrap()));
        let resolver = DialResolver::new(Arc::clone(&destination), 443);

        destination.replace("198.51.100.7".parse().unwrap());
        assert_eq!(resolver.target().to_string(), "198.51.100.7:443");
    }

    #[tokio::test]
    async fn test_dial_resolver_refused() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let destination = Arc::new(Destination::new("127.0.0.1".parse().unwrap()));
        let resolver = DialResolver::new(destination, port)
            .with_connect_timeout(Duration::from_millis(500));

        let (source, _source_listener) = loopback_pair().await;
        assert!(resolver.resolve(&source).await.is_err());
    }
}
