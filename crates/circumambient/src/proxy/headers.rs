//! Header rewriting applied between client and upstream.
//!
//! Hop-by-hop headers describe a single connection and are not forwarded in
//! either direction. `Host` is forwarded as the client sent it, and the client
//! address is appended to `X-Forwarded-For`.

use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::HeaderMap;
use std::net::IpAddr;

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
pub static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Extension trait for preparing header maps for the next hop.
pub trait ProxyHeadersExt {
    /// Remove connection-scoped headers, including any named in `Connection`.
    fn strip_hop_by_hop(&mut self);

    /// Append the client address to `X-Forwarded-For`.
    fn append_forwarded_for(&mut self, client: IpAddr);
}

impl ProxyHeadersExt for HeaderMap {
    fn strip_hop_by_hop(&mut self) {
        let listed: Vec<HeaderName> = self
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
            .collect();

        for name in listed {
            self.remove(name);
        }

        for name in [
            &CONNECTION,
            &KEEP_ALIVE,
            &PROXY_CONNECTION,
            &TE,
            &TRAILER,
            &TRANSFER_ENCODING,
            &UPGRADE,
            &PROXY_AUTHENTICATE,
            &PROXY_AUTHORIZATION,
        ] {
            self.remove(name);
        }
    }

    fn append_forwarded_for(&mut self, client: IpAddr) {
        let prior: Vec<&str> = self
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();

        let forwarded = if prior.is_empty() {
            client.to_string()
        } else {
            format!("{}, {client}", prior.join(", "))
        };

        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            self.insert(X_FORWARDED_FOR.clone(), value);
        }
    }
}

/// Headers to send upstream for an inbound request.
pub fn upstream_request_headers(inbound: &HeaderMap, client: IpAddr) -> HeaderMap {
    let mut headers = inbound.clone();
    headers.strip_hop_by_hop();
    headers.append_forwarded_for(client);
    headers
}
