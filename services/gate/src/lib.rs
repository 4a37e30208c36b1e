//! edgegate
//!
//! Transparent TCP forwarder that only serves clients from admitted source
//! prefixes. Admitted connections are relayed byte-for-byte to a backend.

pub mod config;
pub mod destination;
pub mod error;
pub mod proxy;
pub mod sources;

pub use destination::Destination;
pub use error::ProxyError;
pub use proxy::{
    Acceptor, BufferPool, DialResolver, ListenerConfig, ListenerStats, Relay, Resolver,
    ServerGroup,
};
