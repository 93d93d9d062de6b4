//! ProxyServer struct and main run loop.
//!
//! This module contains the ProxyServer struct which holds all state,
//! and the main run loop that accepts connections and handles requests.

use super::client::{create_http_client, HttpClient};
use super::context::RequestHandlerContext;
use super::handler::handle_request;
use super::network::create_reusable_listener;
use crate::config::Config;
use crate::sink::Sink;
use crate::telemetry::{TelemetryBody, TelemetryDispatcher};
use anyhow::Context;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// The main proxy server struct.
pub struct ProxyServer {
    listen_addr: SocketAddr,
    upstream_uri: Uri,
    http_client: HttpClient,
    dispatcher: TelemetryDispatcher,
}

impl ProxyServer {
    /// Create a new ProxyServer from configuration and an already built sink.
    pub fn new(config: &Config, sink: Arc<dyn Sink>) -> Result<Self, anyhow::Error> {
        let listen_addr = config.listen_addr()?;
        let upstream_uri = config.upstream_uri()?;
        config.sink.validate()?;
        let http_client = create_http_client(&config.upstream_pool);
        let dispatcher = TelemetryDispatcher::new(sink, config.sink.max_pending);

        Ok(Self {
            listen_addr,
            upstream_uri,
            http_client,
            dispatcher,
        })
    }

    /// Bind the configured listen address and serve until an accept error.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let listener = create_reusable_listener(self.listen_addr)
            .with_context(|| format!("Failed to bind {}", self.listen_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), anyhow::Error> {
        info!(
            "started proxy on {} to {}, telemetry sink: {}",
            listener.local_addr()?,
            self.upstream_uri,
            self.dispatcher.sink_kind()
        );

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle_request_internal(req, remote_addr).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!(
                        "Error serving HTTP connection from {}: {}",
                        remote_addr, err
                    );
                }
            });
        }
    }

    /// Internal request handler that builds the context and delegates to handler module.
    async fn handle_request_internal(
        &self,
        req: hyper::Request<hyper::body::Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<hyper::Response<TelemetryBody>, Infallible> {
        let ctx = RequestHandlerContext {
            http_client: &self.http_client,
            upstream_uri: &self.upstream_uri,
            dispatcher: &self.dispatcher,
            remote_addr,
        };

        handle_request(&ctx, req).await
    }
}
