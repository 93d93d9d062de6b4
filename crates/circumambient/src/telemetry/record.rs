//! Telemetry record construction and serialization.
//!
//! A [`TelemetryRecord`] is built once per proxied request from the request
//! line and headers only. Bodies are never inspected.

use chrono::{DateTime, Utc};
use hyper::{HeaderMap, Method, Request, Uri};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Extracted request metadata
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestInfo {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }
}

/// Request target split into its raw components.
///
/// Nothing is percent-decoded: each field is the exact substring that
/// appeared in the request target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlParts {
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl UrlParts {
    /// Split a request target at the first `#`, then at the first `?`.
    pub fn from_target(target: &str) -> Self {
        let (rest, fragment) = target.split_once('#').unwrap_or((target, ""));
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        Self {
            path: path.to_string(),
            query: query.to_string(),
            fragment: fragment.to_string(),
        }
    }

    /// Decompose a parsed URI. Absolute-form targets keep only path and query.
    pub fn from_uri(uri: &Uri) -> Self {
        match uri.path_and_query() {
            Some(pq) => Self::from_target(pq.as_str()),
            None => Self::from_target(uri.path()),
        }
    }
}

/// One proxied request, as published to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub method: String,
    pub url: UrlParts,
    pub headers: BTreeMap<String, String>,
    /// Request start, nanoseconds since the Unix epoch
    pub timestamp: i64,
    /// Nanoseconds from request start until the response was fully forwarded
    pub duration: u64,
}

impl TelemetryRecord {
    pub fn capture(info: &RequestInfo, started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        Self {
            method: info.method.as_str().to_string(),
            url: UrlParts::from_uri(&info.uri),
            headers: join_headers(&info.headers),
            timestamp: started_at.timestamp_nanos_opt().unwrap_or_default(),
            duration: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Compact JSON encoding of the record.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Collapse a header map to one string per name.
///
/// Repeated headers are joined with `", "` in the order they were received.
/// Values that are not valid UTF-8 are decoded lossily.
pub fn join_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .map(|name| {
            let joined = headers
                .get_all(name)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()))
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), joined)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use hyper::header::{HeaderName, HeaderValue};
    use proptest::prelude::*;
    use serde_json::json;

    fn info(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestInfo {
        let mut builder = Request::builder().method(method).uri(target);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        RequestInfo::from_request(&builder.body(()).unwrap())
    }

    #[test]
    fn test_url_parts_from_target_with_fragment() {
        let parts = UrlParts::from_target("/foo?x=1#frag");
        assert_eq!(parts.path, "/foo");
        assert_eq!(parts.query, "x=1");
        assert_eq!(parts.fragment, "frag");
    }

    #[test]
    fn test_url_parts_keeps_raw_encoding() {
        let parts = UrlParts::from_target("/a%20b?q=%2F&r=a+b#x%41");
        assert_eq!(parts.path, "/a%20b");
        assert_eq!(parts.query, "q=%2F&r=a+b");
        assert_eq!(parts.fragment, "x%41");
    }

    #[test]
    fn test_url_parts_question_mark_inside_fragment() {
        let parts = UrlParts::from_target("/p#frag?not-query");
        assert_eq!(parts.path, "/p");
        assert_eq!(parts.query, "");
        assert_eq!(parts.fragment, "frag?not-query");
    }

    #[test]
    fn test_url_parts_empty_components() {
        assert_eq!(UrlParts::from_target("/"), UrlParts {
            path: "/".to_string(),
            ..Default::default()
        });
        let parts = UrlParts::from_target("/p?");
        assert_eq!(parts.query, "");
    }

    #[test]
    fn test_url_parts_from_absolute_uri() {
        let uri: Uri = "http://example.com/foo?x=1".parse().unwrap();
        let parts = UrlParts::from_uri(&uri);
        assert_eq!(parts.path, "/foo");
        assert_eq!(parts.query, "x=1");
        assert_eq!(parts.fragment, "");
    }

    #[test]
    fn test_repeated_headers_joined_in_order() {
        let info = info("GET", "/foo?x=1", &[("X-Test", "a"), ("X-Test", "b")]);
        let headers = join_headers(&info.headers);
        assert_eq!(headers.get("x-test").map(String::as_str), Some("a, b"));
    }

    #[test]
    fn test_empty_header_value_kept() {
        let info = info("GET", "/", &[("x-empty", "")]);
        let headers = join_headers(&info.headers);
        assert_eq!(headers.get("x-empty").map(String::as_str), Some(""));
    }

    #[test]
    fn test_non_utf8_header_value_is_lossy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-bin"),
            HeaderValue::from_bytes(b"ok\xff").unwrap(),
        );
        let joined = join_headers(&headers);
        assert_eq!(joined.get("x-bin").unwrap(), "ok\u{fffd}");
    }

    #[test]
    fn test_capture_record() {
        let info = info(
            "GET",
            "/foo?x=1",
            &[("X-Test", "a"), ("X-Test", "b"), ("Accept", "*/*")],
        );
        let started_at = DateTime::from_timestamp(1_700_000_000, 42).unwrap();
        let record = TelemetryRecord::capture(&info, started_at, Duration::from_micros(1500));

        assert_eq!(record.method, "GET");
        assert_eq!(record.url.path, "/foo");
        assert_eq!(record.url.query, "x=1");
        assert_eq!(record.timestamp, 1_700_000_000_000_000_042);
        assert_eq!(record.duration, 1_500_000);
    }

    #[test]
    fn test_serialized_payload_has_all_fields() {
        let info = info("POST", "/submit", &[("X-Test", "a"), ("X-Test", "b")]);
        let started_at = DateTime::from_timestamp(1, 0).unwrap();
        let record = TelemetryRecord::capture(&info, started_at, Duration::from_nanos(7));

        let payload: serde_json::Value =
            serde_json::from_slice(&record.to_json().unwrap()).unwrap();
        assert_json_eq!(
            payload,
            json!({
                "method": "POST",
                "url": {"path": "/submit", "query": "", "fragment": ""},
                "headers": {"x-test": "a, b"},
                "timestamp": 1_000_000_000i64,
                "duration": 7
            })
        );
    }

    #[test]
    fn test_serialized_payload_is_compact() {
        let info = info("GET", "/", &[]);
        let record = TelemetryRecord::capture(&info, Utc::now(), Duration::ZERO);
        let payload = String::from_utf8(record.to_json().unwrap()).unwrap();
        assert!(!payload.contains('\n'));
        assert!(payload.contains("\"headers\":{}"));
    }

    proptest! {
        #[test]
        fn prop_url_parts_roundtrip(
            path in "/[a-zA-Z0-9/%._-]{0,24}",
            query in "[a-zA-Z0-9=&%+._-]{0,24}",
            fragment in "[a-zA-Z0-9=&%?._-]{0,24}",
        ) {
            let target = format!("{path}?{query}#{fragment}");
            let parts = UrlParts::from_target(&target);
            prop_assert_eq!(parts.path, path);
            prop_assert_eq!(parts.query, query);
            prop_assert_eq!(parts.fragment, fragment);
        }

        #[test]
        fn prop_repeated_values_joined(values in prop::collection::vec("[a-z0-9]{0,8}", 1..6)) {
            let mut headers = HeaderMap::new();
            for value in &values {
                headers.append(
                    HeaderName::from_static("x-multi"),
                    HeaderValue::from_str(value).unwrap(),
                );
            }
            let joined = join_headers(&headers);
            prop_assert_eq!(joined.get("x-multi").unwrap(), &values.join(", "));
        }

        #[test]
        fn prop_duration_nanos_preserved(nanos in 0u64..u64::MAX / 2) {
            let info = info("GET", "/", &[]);
            let record = TelemetryRecord::capture(&info, Utc::now(), Duration::from_nanos(nanos));
            prop_assert_eq!(record.duration, nanos);
        }
    }
}
