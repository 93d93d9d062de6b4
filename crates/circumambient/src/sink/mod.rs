//! Telemetry sinks.
//!
//! A sink takes one serialized telemetry record and delivers it somewhere.
//! Two sinks exist:
//! - [`LogSink`] writes the record to the process log
//! - [`RedisSink`] publishes it on a Redis pub/sub channel through a pooled connection
//!
//! The sink is chosen once at startup by [`create_sink`] and shared by every
//! request handler.

mod log;
mod pool;
mod redis;

pub use self::log::LogSink;
pub use self::pool::build_pool;
pub use self::redis::{RedisConnectionManager, RedisSink};

use crate::config::{SinkConfig, SinkKind};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Destination for serialized telemetry records.
///
/// `send` is synchronous and may block on network I/O. It never reports
/// failure to the caller: a record that cannot be delivered is logged and
/// dropped.
pub trait Sink: Send + Sync {
    /// Deliver one payload
    fn send(&self, payload: &[u8]);

    /// Short name used in logs and metrics
    fn kind(&self) -> &'static str;
}

/// Create a Sink based on configuration
///
/// # Arguments
/// * `config` - SinkConfig from proxy configuration
///
/// # Returns
/// * `Arc<dyn Sink>` - sink shared by all request handlers
pub fn create_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    match config.kind {
        SinkKind::Console => {
            tracing::info!("Writing telemetry to the log");
            Ok(Arc::new(LogSink))
        }
        SinkKind::Redis => {
            let sink = RedisSink::new(&config.redis).context("Failed to create Redis sink")?;
            Ok(Arc::new(sink))
        }
    }
}
