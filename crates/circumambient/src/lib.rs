// Library exports for the binary and integration tests

pub mod config;
pub mod metrics;
pub mod proxy;
pub mod sink;
pub mod telemetry;
