//! Prometheus metrics for circumambient.
//!
//! Tracks proxied requests, upstream failures and telemetry delivery.
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec, Encoder,
    HistogramVec, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static! {
    /// Total number of requests proxied, labelled by the status returned to the client
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "circumambient_requests_total",
        "Total number of requests processed by the proxy",
        &["method", "status"]
    )
    .unwrap();

    /// Time from request start until the response was fully forwarded
    pub static ref REQUEST_DURATION_MS: HistogramVec = register_histogram_vec!(
        "circumambient_request_duration_ms",
        "Request duration including streaming the upstream response",
        &["method"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap();

    /// Upstream requests that failed before a response arrived
    pub static ref UPSTREAM_ERRORS_TOTAL: Counter = register_counter!(
        "circumambient_upstream_errors_total",
        "Total number of requests that could not reach the upstream"
    )
    .unwrap();

    /// Telemetry records handed to a sink
    pub static ref TELEMETRY_DISPATCH_TOTAL: CounterVec = register_counter_vec!(
        "circumambient_telemetry_dispatch_total",
        "Total number of telemetry records delivered or dropped by the sink",
        &["sink", "result"]  // result: ok|error
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Helper to record a finished request
pub fn record_request(method: &str, status: u16, duration_ms: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
    REQUEST_DURATION_MS
        .with_label_values(&[method])
        .observe(duration_ms);
}

pub fn record_upstream_error() {
    UPSTREAM_ERRORS_TOTAL.inc();
}

/// Helper to record one sink delivery attempt
pub fn record_dispatch(sink: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    TELEMETRY_DISPATCH_TOTAL
        .with_label_values(&[sink, result])
        .inc();
}

/// Serve `GET /metrics` on the given listener until the task is dropped.
pub async fn serve_metrics(listener: TcpListener) -> Result<(), anyhow::Error> {
    info!("Metrics available on http://{}/metrics", listener.local_addr()?);

    loop {
        let (stream, remote_addr) = listener.accept().await?;

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                Ok::<_, Infallible>(metrics_response(req.method(), req.uri().path()))
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(
                    "Error serving metrics connection from {}: {}",
                    remote_addr, err
                );
            }
        });
    }
}

fn metrics_response(method: &Method, path: &str) -> Response<Full<Bytes>> {
    let (status, content_type, body) = if method == Method::GET && path == "/metrics" {
        (
            StatusCode::OK,
            "text/plain; version=0.0.4",
            Bytes::from(collect_metrics()),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"not found"),
        )
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}
