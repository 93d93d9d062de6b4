//! Per-request telemetry capture.
//!
//! - `record` - the [`TelemetryRecord`] value and its JSON encoding
//! - `tap` - timing around forwarding and hand-off to the sink

mod record;
mod tap;

pub use record::{join_headers, RequestInfo, TelemetryRecord, UrlParts};
pub use tap::{TelemetryBody, TelemetryDispatcher, TelemetryTap};
