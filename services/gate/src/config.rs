//! Gate configuration.
//!
//! Every flag can also be set from an `EDGEGATE_*` environment variable.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::sources::RangeSources;

/// Default prefix lists admitted in addition to the local allow list.
pub const DEFAULT_RANGE_URLS: &[&str] = &[
    "https://www.cloudflare.com/ips-v4",
    "https://www.cloudflare.com/ips-v6",
];

/// Default looking-glass base URL for ASN prefix tables.
pub const DEFAULT_ASN_BASE_URL: &str = "https://bgp.he.net";

/// Log output flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Source-restricted TCP forwarder.
#[derive(Debug, Clone, Parser)]
#[command(name = "edgegate")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host to bind both listeners to.
    #[arg(long, env = "EDGEGATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Plaintext listener port.
    #[arg(long, env = "EDGEGATE_PORT", default_value_t = 8888)]
    pub port: u16,

    /// TLS passthrough listener port.
    #[arg(long, env = "EDGEGATE_PORT_TLS", default_value_t = 8889)]
    pub port_tls: u16,

    /// Extra CIDRs to admit, comma separated.
    #[arg(long, env = "EDGEGATE_ALLOW", value_delimiter = ',')]
    pub allow: Vec<String>,

    /// Log listening, accept, reject and relay errors per connection.
    #[arg(long, env = "EDGEGATE_VERBOSE")]
    pub verbose: bool,

    /// Hostname resolved to find the backend.
    #[arg(long, env = "EDGEGATE_DESTINATION_HOST", default_value = "www.cloudflare.com")]
    pub destination_host: String,

    /// Backend port for plaintext connections.
    #[arg(long, env = "EDGEGATE_DESTINATION_PORT", default_value_t = 80)]
    pub destination_port: u16,

    /// Backend port for TLS connections.
    #[arg(long, env = "EDGEGATE_DESTINATION_PORT_TLS", default_value_t = 443)]
    pub destination_port_tls: u16,

    /// Re-resolve the backend hostname this often. Off when unset or zero.
    #[arg(long, env = "EDGEGATE_RESOLVE_INTERVAL_SECS")]
    pub resolve_interval_secs: Option<u64>,

    /// Backend connect timeout in milliseconds.
    #[arg(long, env = "EDGEGATE_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub connect_timeout_ms: u64,

    /// Prefix list URLs, one CIDR per line.
    #[arg(
        long = "range-url",
        env = "EDGEGATE_RANGE_URLS",
        value_delimiter = ',',
        default_values = DEFAULT_RANGE_URLS
    )]
    pub range_urls: Vec<String>,

    /// Autonomous systems whose announced prefixes are admitted.
    #[arg(
        long = "asn",
        env = "EDGEGATE_ASN",
        value_delimiter = ',',
        default_value = "13335"
    )]
    pub asns: Vec<u32>,

    /// Base URL of the ASN prefix tables.
    #[arg(long, env = "EDGEGATE_ASN_BASE_URL", default_value = DEFAULT_ASN_BASE_URL)]
    pub asn_base_url: String,

    /// Only admit the local allow list; skip fetching prefix lists and ASNs.
    #[arg(long, env = "EDGEGATE_NO_REMOTE_RANGES")]
    pub no_remote_ranges: bool,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, env = "EDGEGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "EDGEGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    /// Where the admitted prefixes come from.
    pub fn range_sources(&self) -> RangeSources {
        RangeSources {
            allow: self
                .allow
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            list_urls: self.range_urls.clone(),
            asns: self.asns.clone(),
            asn_base_url: self.asn_base_url.clone(),
            fetch_remote: !self.no_remote_ranges,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn resolve_interval(&self) -> Option<Duration> {
        self.resolve_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Filter directives used when RUST_LOG is unset.
    pub fn default_filter(&self) -> String {
        if self.verbose {
            format!("{},edgegate=debug,edgegate_networking=debug", self.log_level)
        } else {
            self.log_level.clone()
        }
    }
}
