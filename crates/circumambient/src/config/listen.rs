//! Listen address and metrics configuration.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

/// Parse a listen address.
///
/// Accepts `host:port`, `ip:port` and the bare `:port` form, which binds
/// every interface.
pub fn parse_listen_addr(address: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidListen {
        address: address.to_string(),
        reason,
    };

    let candidate = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };

    candidate
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("address did not resolve".to_string()))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Port for the Prometheus `/metrics` endpoint; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}
