//! Header sanitisation for both proxy directions
//!
//! Hop-by-hop headers are meaningful only on a single connection segment
//! and must not cross the proxy. Inbound attribution headers are stripped
//! unconditionally before injection so clients can never spoof their
//! attributed IP.

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

/// Headers that never cross the proxy, in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client-controlled attribution headers, stripped before injection.
const ATTRIBUTION: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-real-ip",
];

/// Prepare inbound request headers for the upstream.
///
/// Strips hop-by-hop and inbound attribution headers plus `host` (the
/// forwarder sets its own), then injects the X-Forwarded set. With
/// `append_forwarded_for`, the original inbound `X-Forwarded-For` chain is
/// preserved and the client IP appended, for deployments behind another
/// trusted proxy.
pub fn sanitize_request_headers(
    headers: &mut HeaderMap,
    client_ip: IpAddr,
    scheme: &str,
    host: &str,
    append_forwarded_for: bool,
) {
    let inbound_chain = if append_forwarded_for {
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    } else {
        None
    };

    for name in HOP_BY_HOP.iter().chain(ATTRIBUTION.iter()) {
        headers.remove(*name);
    }
    headers.remove(header::HOST);

    let client = client_ip.to_string();

    let forwarded_for = match inbound_chain {
        Some(chain) if !chain.is_empty() => format!("{chain}, {client}"),
        _ => client.clone(),
    };
    if let Ok(v) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), v);
    }
    if let Ok(v) = HeaderValue::from_str(scheme) {
        headers.insert(HeaderName::from_static("x-forwarded-proto"), v);
    }
    if let Ok(v) = HeaderValue::from_str(host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&client) {
        headers.insert(HeaderName::from_static("x-real-ip"), v);
    }
}

/// Strip hop-by-hop headers from an upstream response. Everything else is
/// relayed bit-exactly.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IpAddr {
        "203.0.113.9".parse().unwrap()
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("Expires"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        sanitize_request_headers(&mut headers, client(), "https", "proxy.example.com", false);

        for name in HOP_BY_HOP {
            assert!(!headers.contains_key(*name), "{name} should be stripped");
        }
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_spoofed_attribution_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6"));
        headers.insert("x-real-ip", HeaderValue::from_static("6.6.6.6"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("gopher"));

        sanitize_request_headers(&mut headers, client(), "https", "proxy.example.com", false);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(
            headers.get("x-forwarded-host").unwrap(),
            "proxy.example.com"
        );
    }

    #[test]
    fn test_append_mode_keeps_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));

        sanitize_request_headers(&mut headers, client(), "http", "proxy.example.com", true);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.1, 203.0.113.9"
        );
    }

    #[test]
    fn test_host_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("evil.example.com"));

        sanitize_request_headers(&mut headers, client(), "http", "proxy.example.com", false);

        assert!(!headers.contains_key(header::HOST));
    }

    #[test]
    fn test_response_preserved_except_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        sanitize_response_headers(&mut headers);

        assert!(!headers.contains_key("connection"));
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert_eq!(headers.get("etag").unwrap(), "\"abc\"");
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }
}
