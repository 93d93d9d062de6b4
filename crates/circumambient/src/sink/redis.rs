use super::pool::build_pool;
use super::Sink;
use crate::config::{RedisConfig, SinkKind};
use crate::metrics;
use anyhow::{Context, Result};
use redis::{Connection, ConnectionLike};
use std::time::Duration;
use tracing::{debug, error, info};

/// Publishes each payload to a Redis pub/sub channel.
///
/// Uses a blocking Redis client behind an r2d2 pool. Broker connections are
/// dialed lazily on the first publish, so an unreachable broker does not stop
/// the proxy from starting; it only causes records to be dropped.
///
/// # Compatibility
///
/// - Redis 6.x, 7.x: Fully supported
/// - Valkey: Likely compatible but not officially supported
pub struct RedisSink {
    pool: r2d2::Pool<RedisConnectionManager>,
    channel: String,
}

/// Dials broker connections for the pool
pub struct RedisConnectionManager {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisConnectionManager {
    fn new(client: redis::Client, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
        }
    }
}

impl r2d2::ManageConnection for RedisConnectionManager {
    type Connection = Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.client.get_connection_with_timeout(self.connect_timeout)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query(conn)
    }

    // The client marks a connection closed after an I/O error; r2d2 then
    // drops it on return instead of handing it out again.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

impl RedisSink {
    /// Create a new Redis sink. No connection is opened here.
    pub fn new(config: &RedisConfig) -> Result<Self> {
        config.validate()?;
        let url = config.url();
        let client = redis::Client::open(url.as_str()).context("Failed to parse Redis URL")?;

        let manager =
            RedisConnectionManager::new(client, Duration::from_millis(config.connect_timeout_ms));
        let pool = build_pool(
            manager,
            config.pool_size,
            Duration::from_millis(config.checkout_timeout_ms),
        );

        info!(
            "Publishing telemetry to Redis channel '{}' at {} (pool_size={})",
            config.channel, url, config.pool_size
        );

        Ok(Self {
            pool,
            channel: config.channel.clone(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish one payload, returning the number of subscribers that received it.
    pub fn publish(&self, payload: &[u8]) -> Result<i64> {
        let mut conn = self
            .pool
            .get()
            .context("Failed to get Redis connection from pool")?;

        let message = String::from_utf8_lossy(payload);
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel())
            .arg(message.as_ref())
            .query(&mut *conn)
            .context("Redis PUBLISH failed")?;

        Ok(receivers)
    }
}

impl Sink for RedisSink {
    fn send(&self, payload: &[u8]) {
        match self.publish(payload) {
            Ok(receivers) => {
                debug!(
                    "Published telemetry to '{}' ({} subscribers)",
                    self.channel(),
                    receivers
                );
                metrics::record_dispatch(self.kind(), true);
            }
            Err(e) => {
                error!(
                    "Failed to publish telemetry to '{}': {:#}",
                    self.channel(),
                    e
                );
                metrics::record_dispatch(self.kind(), false);
            }
        }
    }

    fn kind(&self) -> &'static str {
        SinkKind::Redis.as_str()
    }
}
