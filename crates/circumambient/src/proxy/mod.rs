//! Proxy server module.
//!
//! This module provides the reverse proxy that forwards every request to one
//! fixed upstream and reports a telemetry record per request.
//!
//! # Module Structure
//!
//! - `server` - ProxyServer struct and main run loop
//! - `handler` - Per-request timing and telemetry hand-off
//! - `forwarding` - Request forwarding to the upstream
//! - `headers` - Hop-by-hop stripping and `X-Forwarded-For`
//! - `client` - HTTP client creation and configuration
//! - `network` - Network listener utilities (SO_REUSEPORT)

mod client;
mod context;
mod forwarding;
mod handler;
mod headers;
mod network;
mod response_ext;
mod server;


pub use forwarding::{error_response, upstream_target};
pub use network::create_reusable_listener;
pub use server::ProxyServer;
