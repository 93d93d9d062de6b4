//! Telemetry sink configuration.

use super::ConfigError;
use serde::{Deserialize, Serialize};

/// Which sink receives telemetry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Write each record to the process log
    Console,
    /// Publish each record to a Redis pub/sub channel
    #[default]
    Redis,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Console => "console",
            SinkKind::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default)]
    pub redis: RedisConfig,
    /// Records allowed to wait on or occupy the sink at once; further records are dropped
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            redis: RedisConfig::default(),
            max_pending: default_max_pending(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pending == 0 {
            return Err(ConfigError::InvalidSink(
                "max_pending must be at least 1".to_string(),
            ));
        }
        if self.kind == SinkKind::Redis {
            self.redis.validate()?;
        }
        Ok(())
    }
}

fn default_max_pending() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Broker address: `host:port`, `:port`, or a `redis://` URL
    #[serde(default = "default_redis_address")]
    pub address: String,
    #[serde(default = "default_redis_channel")]
    pub channel: String,
    /// Maximum number of concurrently open broker connections
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: u32,
    /// Timeout for dialing a new broker connection
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a publish waits for a free connection when the pool is exhausted
    #[serde(default = "default_redis_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            channel: default_redis_channel(),
            pool_size: default_redis_pool_size(),
            connect_timeout_ms: default_redis_connect_timeout_ms(),
            checkout_timeout_ms: default_redis_checkout_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// Connection URL understood by the redis client.
    ///
    /// `:6379` dials the local host, like the usual `host:port` dial
    /// convention where an empty host means localhost.
    pub fn url(&self) -> String {
        let address = self.address.trim();
        if address.contains("://") {
            address.to_string()
        } else if address.starts_with(':') {
            format!("redis://127.0.0.1{address}")
        } else {
            format!("redis://{address}")
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::InvalidBroker(
                "broker address must not be empty".to_string(),
            ));
        }
        if self.channel.is_empty() {
            return Err(ConfigError::InvalidBroker(
                "channel name must not be empty".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidBroker(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.checkout_timeout_ms == 0 {
            return Err(ConfigError::InvalidBroker(
                "checkout_timeout_ms must be greater than zero".to_string(),
            ));
        }
        redis::Client::open(self.url()).map_err(|e| {
            ConfigError::InvalidBroker(format!("broker address '{}': {e}", self.address))
        })?;
        Ok(())
    }
}

fn default_redis_address() -> String {
    ":6379".to_string()
}

fn default_redis_channel() -> String {
    "requests".to_string()
}

fn default_redis_pool_size() -> u32 {
    3
}

fn default_redis_connect_timeout_ms() -> u64 {
    1000
}

fn default_redis_checkout_timeout_ms() -> u64 {
    1000
}
