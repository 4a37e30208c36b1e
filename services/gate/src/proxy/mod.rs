//! Source-restricted TCP forwarding.
//!
//! This module provides:
//! - Acceptors that admit connections by source prefix
//! - Destination resolution for admitted connections
//! - A bidirectional relay with half-close support
//! - Server groups running several acceptors under one lifecycle
//!
//! ## Architecture
//!
//! ```text
//! Client -> Acceptor -> PrefixIndex -> Resolver -> Relay <-> Backend
//!              |
//!          (rejected: closed without a byte)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use edgegate::proxy::{DialResolver, ListenerConfig, ServerGroup, BufferPool};
//!
//! let resolver = Arc::new(DialResolver::new(destination, 443));
//! let config = ListenerConfig::new("0.0.0.0", 8889, index, resolver);
//! let group = ServerGroup::bind([config], Arc::new(BufferPool::new())).await?;
//! group.run(shutdown).await?;
//! ```

mod buffer_pool;
mod group;
mod listener;
mod relay;
mod resolver;

pub use buffer_pool::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE};
pub use group::{run_server_group, ServerGroup};
pub use listener::{run_acceptor, Acceptor, Admission, ListenerConfig, ListenerStats};
pub use relay::{Connection, Relay, Transferred};
pub use resolver::{DialResolver, Resolver, DEFAULT_CONNECT_TIMEOUT};
