use crate::proxy::client::HttpClient;
use crate::telemetry::TelemetryDispatcher;
use hyper::Uri;
use std::net::SocketAddr;

/// Context for handling a request, containing all necessary state.
pub struct RequestHandlerContext<'a> {
    pub http_client: &'a HttpClient,
    pub upstream_uri: &'a Uri,
    pub dispatcher: &'a TelemetryDispatcher,
    pub remote_addr: SocketAddr,
}
