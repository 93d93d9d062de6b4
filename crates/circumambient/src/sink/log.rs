use super::Sink;
use crate::config::SinkKind;
use crate::metrics;
use tracing::info;

/// Writes each payload to the process log.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn send(&self, payload: &[u8]) {
        info!(target: "circumambient::telemetry", "{}", String::from_utf8_lossy(payload));
        metrics::record_dispatch(self.kind(), true);
    }

    fn kind(&self) -> &'static str {
        SinkKind::Console.as_str()
    }
}
