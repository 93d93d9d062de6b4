//! Dispatching telemetry once a request is over.
//!
//! The proxy returns the upstream response to hyper immediately and lets it
//! stream. [`TelemetryBody`] wraps that response body and fires the
//! [`TelemetryTap`] when the body ends or errors. The tap also fires when it
//! is dropped unfinished, which covers a client that goes away mid-response
//! and a handler future cancelled while the upstream call is still pending.
//! Its state is taken on first use, so each request produces exactly one
//! record.

use super::record::{RequestInfo, TelemetryRecord};
use crate::metrics;
use crate::sink::Sink;
use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::Response;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, warn};

/// Hands serialized records to the sink with a bound on outstanding deliveries.
///
/// Sinks may block on network I/O, so inside a tokio runtime each delivery
/// runs on the blocking pool while holding one of `max_pending` permits. When
/// every permit is taken (a stalled broker) the record is dropped and logged
/// instead of queued. Outside a runtime the sink is called inline.
#[derive(Clone)]
pub struct TelemetryDispatcher {
    sink: Arc<dyn Sink>,
    permits: Arc<Semaphore>,
    max_pending: usize,
}

impl TelemetryDispatcher {
    pub fn new(sink: Arc<dyn Sink>, max_pending: usize) -> Self {
        Self {
            sink,
            permits: Arc::new(Semaphore::new(max_pending)),
            max_pending,
        }
    }

    pub fn sink_kind(&self) -> &'static str {
        self.sink.kind()
    }

    /// Deliver one payload. Returns `false` if it was dropped.
    pub fn dispatch(&self, payload: Vec<u8>) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.sink.send(&payload);
            return true;
        };

        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                let sink = Arc::clone(&self.sink);
                handle.spawn_blocking(move || {
                    sink.send(&payload);
                    drop(permit);
                });
                true
            }
            Err(_) => {
                warn!(
                    "Telemetry sink '{}' has {} deliveries pending, dropping record",
                    self.sink.kind(),
                    self.max_pending
                );
                metrics::record_dispatch(self.sink.kind(), false);
                false
            }
        }
    }
}

struct TapState {
    info: RequestInfo,
    started_at: DateTime<Utc>,
    started: Instant,
    status: Option<u16>,
    dispatcher: TelemetryDispatcher,
}

impl TapState {
    fn finish(self) {
        let elapsed = self.started.elapsed();
        let record = TelemetryRecord::capture(&self.info, self.started_at, elapsed);

        if let Some(status) = self.status {
            metrics::record_request(
                self.info.method.as_str(),
                status,
                elapsed.as_secs_f64() * 1000.0,
            );
        }

        match record.to_json() {
            Ok(payload) => {
                self.dispatcher.dispatch(payload);
            }
            Err(e) => error!("Failed to serialize telemetry record: {}", e),
        }
    }
}

/// Timing and metadata captured at request start.
///
/// Fires on [`finish`](Self::finish) or on drop, whichever comes first.
pub struct TelemetryTap {
    state: Option<TapState>,
}

impl TelemetryTap {
    pub fn start(info: RequestInfo, dispatcher: TelemetryDispatcher) -> Self {
        Self {
            state: Some(TapState {
                info,
                started_at: Utc::now(),
                started: Instant::now(),
                status: None,
                dispatcher,
            }),
        }
    }

    /// Build the record and hand it to the sink.
    pub fn finish(mut self) {
        self.fire();
    }

    fn set_status(&mut self, status: u16) {
        if let Some(state) = self.state.as_mut() {
            state.status = Some(status);
        }
    }

    fn fire(&mut self) {
        if let Some(state) = self.state.take() {
            state.finish();
        }
    }
}

impl Drop for TelemetryTap {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Response body that reports telemetry when streaming is over.
pub struct TelemetryBody {
    inner: BoxBody<Bytes, hyper::Error>,
    tap: TelemetryTap,
}

impl TelemetryBody {
    /// Attach a tap to a response, recording its status for metrics.
    pub fn wrap(
        response: Response<BoxBody<Bytes, hyper::Error>>,
        mut tap: TelemetryTap,
    ) -> Response<TelemetryBody> {
        tap.set_status(response.status().as_u16());
        response.map(|inner| TelemetryBody { inner, tap })
    }
}

impl Body for TelemetryBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.tap.fire();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};
    use hyper::Request;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl CollectingSink {
        fn records(&self) -> Vec<TelemetryRecord> {
            self.payloads
                .lock()
                .unwrap()
                .iter()
                .map(|p| serde_json::from_slice(p).unwrap())
                .collect()
        }
    }

    impl Sink for CollectingSink {
        fn send(&self, payload: &[u8]) {
            self.payloads.lock().unwrap().push(payload.to_vec());
        }

        fn kind(&self) -> &'static str {
            "collecting"
        }
    }

    fn tap_for(target: &str, sink: &Arc<CollectingSink>) -> TelemetryTap {
        let req = Request::builder()
            .method("GET")
            .uri(target)
            .header("x-test", "a")
            .header("x-test", "b")
            .body(())
            .unwrap();
        let sink: Arc<dyn Sink> = sink.clone();
        TelemetryTap::start(
            RequestInfo::from_request(&req),
            TelemetryDispatcher::new(sink, 16),
        )
    }

    fn response(body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::new(BoxBody::new(
            Full::new(Bytes::from(body)).map_err(|never: Infallible| match never {}),
        ))
    }

    #[test]
    fn test_finish_outside_runtime_sends_inline() {
        let sink = Arc::new(CollectingSink::default());
        tap_for("/foo?x=1", &sink).finish();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].url.path, "/foo");
        assert_eq!(records[0].url.query, "x=1");
        assert_eq!(records[0].headers.get("x-test").unwrap(), "a, b");
    }

    #[tokio::test]
    async fn test_body_fires_once_after_full_read() {
        let sink = Arc::new(CollectingSink::default());
        let wrapped = TelemetryBody::wrap(response("hello"), tap_for("/", &sink));

        let bytes = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        wait_for_records(&sink, 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_body_fires_on_early_drop() {
        let sink = Arc::new(CollectingSink::default());
        let wrapped = TelemetryBody::wrap(response("never read"), tap_for("/", &sink));
        assert!(sink.records().is_empty());

        drop(wrapped);
        assert_eq!(sink.records().len(), 1);
    }

    #[test]
    fn test_record_timestamp_plus_duration_not_after_dispatch() {
        let sink = Arc::new(CollectingSink::default());
        let tap = tap_for("/", &sink);
        std::thread::sleep(std::time::Duration::from_millis(2));
        tap.finish();
        let dispatched = Utc::now().timestamp_nanos_opt().unwrap();

        let record = &sink.records()[0];
        assert!(record.duration >= 2_000_000);
        assert!(record.timestamp + record.duration as i64 <= dispatched);
    }

    #[test]
    fn test_tap_fires_when_dropped_unfinished() {
        let sink = Arc::new(CollectingSink::default());
        let tap = tap_for("/cancelled?x=2", &sink);
        assert!(sink.records().is_empty());

        drop(tap);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url.path, "/cancelled");
    }

    #[test]
    fn test_finish_does_not_fire_again_on_drop() {
        let sink = Arc::new(CollectingSink::default());
        tap_for("/", &sink).finish();
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_tap_fires_when_future_is_cancelled() {
        let sink = Arc::new(CollectingSink::default());
        let tap = tap_for("/pending", &sink);

        let pending = tokio::spawn(async move {
            let _tap = tap;
            std::future::pending::<()>().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        pending.abort();
        let _ = pending.await;

        wait_for_records(&sink, 1).await;
        assert_eq!(sink.records()[0].url.path, "/pending");
    }

    /// Blocks every delivery until the gate is released.
    #[derive(Default)]
    struct GatedSink {
        gate: Mutex<()>,
        delivered: AtomicUsize,
    }

    impl Sink for GatedSink {
        fn send(&self, _payload: &[u8]) {
            let _open = self.gate.lock().unwrap();
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }

        fn kind(&self) -> &'static str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_stalled_sink_holds_at_most_max_pending() {
        let sink = Arc::new(GatedSink::default());
        let dispatcher = TelemetryDispatcher::new(sink.clone(), 2);

        let accepted = {
            let _closed = sink.gate.lock().unwrap();
            (0..5)
                .filter(|_| dispatcher.dispatch(b"{}".to_vec()))
                .count()
        };
        assert_eq!(accepted, 2);

        for _ in 0..200 {
            if sink.delivered.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);

        // Permits come back once deliveries finish.
        let mut accepted_again = false;
        for _ in 0..200 {
            if dispatcher.dispatch(b"{}".to_vec()) {
                accepted_again = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(accepted_again);
    }

    #[test]
    fn test_dispatch_outside_runtime_is_inline() {
        let sink = Arc::new(GatedSink::default());
        let dispatcher = TelemetryDispatcher::new(sink.clone(), 1);
        assert!(dispatcher.dispatch(b"{}".to_vec()));
        assert!(dispatcher.dispatch(b"{}".to_vec()));
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.sink_kind(), "gated");
    }

    #[test]
    fn test_wrap_preserves_status() {
        let sink = Arc::new(CollectingSink::default());
        let mut upstream = response("");
        *upstream.status_mut() = hyper::StatusCode::BAD_GATEWAY;
        let wrapped = TelemetryBody::wrap(upstream, tap_for("/", &sink));
        assert_eq!(wrapped.status(), 502);
    }

    /// Dispatch inside a runtime goes through the blocking pool.
    async fn wait_for_records(sink: &CollectingSink, count: usize) {
        for _ in 0..200 {
            if sink.records().len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {count} telemetry records");
    }
}
