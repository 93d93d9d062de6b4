//! Per-request handling: log, time, forward, then report telemetry.

use super::context::RequestHandlerContext;
use super::forwarding::forward_request_streaming;
use crate::telemetry::{RequestInfo, TelemetryBody, TelemetryTap};
use hyper::{Request, Response};
use std::convert::Infallible;
use tracing::info;

/// Handle an incoming request by forwarding it to the upstream.
///
/// The start time is taken before anything else. The telemetry record is
/// dispatched by the returned body once the upstream response has been fully
/// streamed to the client, so the sink never delays or alters the response.
/// If this future is dropped while the upstream call is pending (the client
/// disconnected), the tap fires from its drop instead.
pub async fn handle_request(
    ctx: &RequestHandlerContext<'_>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<TelemetryBody>, Infallible> {
    let tap = TelemetryTap::start(RequestInfo::from_request(&req), ctx.dispatcher.clone());

    info!("{} {}", req.method(), req.uri());

    let response =
        forward_request_streaming(ctx.http_client, req, ctx.upstream_uri, ctx.remote_addr).await;

    Ok(TelemetryBody::wrap(response, tap))
}
