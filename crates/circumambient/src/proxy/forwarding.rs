//! Request forwarding logic for the proxy server.
//!
//! Requests and responses are streamed through without buffering. The
//! request line and headers are rewritten for the upstream; bodies are
//! passed through as-is.

use super::client::HttpClient;
use super::headers::{upstream_request_headers, ProxyHeadersExt};
use super::response_ext::ResponseExt;
use crate::metrics;
use http_body_util::combinators::BoxBody;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, Uri};
use std::net::SocketAddr;
use tracing::{debug, error};

/// Helper function to create an error response.
pub fn error_response(status: u16, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() =
        hyper::StatusCode::from_u16(status).unwrap_or(hyper::StatusCode::BAD_GATEWAY);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Rebase a request target onto the upstream's scheme and authority.
pub fn upstream_target(upstream: &Uri, request: &Uri) -> Result<Uri, hyper::http::Error> {
    let path_and_query = request
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    let mut builder = Uri::builder();
    if let Some(scheme) = upstream.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = upstream.authority() {
        builder = builder.authority(authority.clone());
    }
    builder.path_and_query(path_and_query).build()
}

/// Forward a request with streaming body (no buffering).
///
/// Upstream failures become a `502 Bad Gateway` JSON response; nothing is
/// retried.
pub async fn forward_request_streaming(
    http_client: &HttpClient,
    req: Request<hyper::body::Incoming>,
    upstream_uri: &Uri,
    remote_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (parts, body) = req.into_parts();

    let full_uri = match upstream_target(upstream_uri, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            error!("Failed to build upstream URI for {}: {}", parts.uri, e);
            return error_response(502, "Bad Gateway").into_boxed();
        }
    };

    debug!("Forwarding (streaming) to: {}", full_uri);

    let mut upstream_req = Request::new(BoxBody::new(body));
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = full_uri;
    *upstream_req.version_mut() = parts.version;
    *upstream_req.headers_mut() = upstream_request_headers(&parts.headers, remote_addr.ip());

    match http_client.request(upstream_req).await {
        Ok(upstream_response) => {
            let (mut parts, body) = upstream_response.into_parts();
            parts.headers.strip_hop_by_hop();
            Response::from_parts(parts, BoxBody::new(body))
        }
        Err(e) => {
            error!("Failed to forward request to upstream: {}", e);
            metrics::record_upstream_error();
            error_response(502, "Bad Gateway").into_boxed()
        }
    }
}
