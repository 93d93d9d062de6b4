//! Configuration types for the circumambient proxy.

mod listen;
mod sink;
mod upstream;

use std::path::Path;

use serde::{Deserialize, Serialize};

// Re-export all types for library consumers
pub use listen::{parse_listen_addr, MetricsConfig};
pub use sink::{RedisConfig, SinkConfig, SinkKind};
pub use upstream::{parse_upstream_uri, ConnectionPoolConfig};

/// Errors raised while assembling or validating configuration.
///
/// Every variant is fatal: the proxy refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing listen address (use --in <host:port>)")]
    MissingListen,

    #[error("missing upstream address (use --out <host:port>)")]
    MissingUpstream,

    #[error("invalid listen address '{address}': {reason}")]
    InvalidListen { address: String, reason: String },

    #[error("invalid upstream address '{address}': {reason}")]
    InvalidUpstream { address: String, reason: String },

    #[error("invalid broker configuration: {0}")]
    InvalidBroker(String),

    #[error("invalid sink configuration: {0}")]
    InvalidSink(String),

    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    /// Missing required addresses are usage errors rather than bad values.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, ConfigError::MissingListen | ConfigError::MissingUpstream)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Local address the proxy accepts clients on (`host:port` or `:port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Fixed backend every request is forwarded to (`host:port` or `http://host:port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    #[serde(default)]
    pub sink: SinkConfig,

    /// HTTP client pool settings for the upstream connection
    #[serde(default)]
    pub upstream_pool: ConnectionPoolConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.upstream_uri()?;
        self.sink.validate()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        let listen = self.listen.as_deref().ok_or(ConfigError::MissingListen)?;
        parse_listen_addr(listen)
    }

    pub fn upstream_uri(&self) -> Result<hyper::Uri, ConfigError> {
        let upstream = self
            .upstream
            .as_deref()
            .ok_or(ConfigError::MissingUpstream)?;
        parse_upstream_uri(upstream)
    }
}
