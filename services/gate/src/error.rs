//! Server-level errors.
//!
//! Only failures of a listener itself surface as [`ProxyError`]. Everything
//! that goes wrong while handling one connection stays inside that
//! connection's task.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that stop an acceptor and, with it, the server group.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Binding or listening on the configured address failed.
    #[error("failed to listen at address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `accept()` failed on a bound listener.
    #[error("error accepting new connection on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// An acceptor task panicked or was aborted.
    #[error("acceptor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
