//! Upstream forwarding engine
//!
//! Streams a matched request to its upstream and the upstream's response
//! back to the client over pooled keep-alive connections. Policies come
//! from the route snapshot the caller captured, so a hot reload mid-request
//! never changes the deadline or caps of an in-flight forward.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use dashmap::DashMap;
use http_body_util::Limited;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::config::ForwarderConfig;
use crate::error::ProxyError;
use crate::headers::{sanitize_request_headers, sanitize_response_headers};
use crate::routing::Route;

/// Keep-alive connections idle out of the pool after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Idle connections retained per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 100;

type HttpClient = Client<HttpConnector, Body>;
type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// Pooled upstream clients plus per-host admission.
pub struct Forwarder {
    http_client: HttpClient,
    https_client: HttpsClient,
    /// In-flight cap per upstream authority
    host_permits: DashMap<String, Arc<Semaphore>>,
}

impl Forwarder {
    /// Build the pooled clients. The connect deadline is baked into the
    /// connector at startup.
    pub fn new(connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let http_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector.clone());

        // The wrapped connector must accept https URIs itself
        let mut tls_inner = connector;
        tls_inner.enforce_http(false);
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native root certificates")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(tls_inner);

        let https_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(https_connector);

        Self {
            http_client,
            https_client,
            host_permits: DashMap::new(),
        }
    }

    /// Forward one request to its matched route and relay the response.
    #[allow(clippy::too_many_arguments)]
    pub async fn forward(
        &self,
        method: Method,
        uri: &Uri,
        mut headers: HeaderMap,
        body: Body,
        route: &Route,
        client_ip: IpAddr,
        scheme: &'static str,
        inbound_host: &str,
        config: &ForwarderConfig,
        body_cap: u64,
    ) -> Result<Response<Body>, ProxyError> {
        let upstream_url = build_upstream_url(route, uri.path(), uri.query())
            .map_err(|e| ProxyError::Internal(format!("bad upstream url: {e}")))?;

        sanitize_request_headers(
            &mut headers,
            client_ip,
            scheme,
            inbound_host,
            config.append_forwarded_for,
        );

        // Per-host in-flight cap; the permit is held for the header exchange
        let authority = authority_of(&upstream_url);
        let semaphore = self
            .host_permits
            .entry(authority)
            .or_insert_with(|| Arc::new(Semaphore::new(config.max_concurrent_per_host.max(1) as usize)))
            .clone();
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Internal("host semaphore closed".to_string()))?;

        // Cap length-unknown bodies mid-stream; declared lengths were
        // already rejected by the guard
        let capped_body = Body::new(Limited::new(body, body_cap as usize));

        let deadline = Duration::from_secs(config.timeout_seconds);
        let total_secs = config.timeout_seconds;

        let response = tokio::time::timeout(
            deadline,
            self.forward_with_redirects(method, upstream_url, headers, capped_body, config, body_cap),
        )
        .await
        .map_err(|_| ProxyError::UpstreamTimeout(total_secs))??;

        let (mut parts, incoming) = response.into_parts();
        sanitize_response_headers(&mut parts.headers);

        Ok(Response::from_parts(parts, Body::new(incoming)))
    }

    /// Issue the request, following a bounded number of upstream redirects.
    async fn forward_with_redirects(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Body,
        config: &ForwarderConfig,
        body_cap: u64,
    ) -> Result<Response<hyper::body::Incoming>, ProxyError> {
        let mut response = self
            .send(method.clone(), &url, headers.clone(), body, body_cap)
            .await?;

        let mut current_url = url;
        let mut hops = 0;

        while hops < config.max_redirects {
            let Some((next_method, next_url)) =
                redirect_target(&method, response.status(), response.headers(), &current_url)
            else {
                break;
            };

            debug!("following upstream redirect to {}", next_url);
            hops += 1;
            current_url = next_url;

            response = self
                .send(
                    next_method,
                    &current_url,
                    headers.clone(),
                    Body::empty(),
                    body_cap,
                )
                .await?;
        }

        Ok(response)
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        headers: HeaderMap,
        body: Body,
        body_cap: u64,
    ) -> Result<Response<hyper::body::Incoming>, ProxyError> {
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e| ProxyError::Internal(format!("bad upstream uri: {e}")))?;

        let mut request = Request::builder().method(method).uri(uri);
        if let Some(h) = request.headers_mut() {
            *h = headers;
        }
        let request = request
            .body(body)
            .map_err(|e| ProxyError::Internal(format!("failed to build request: {e}")))?;

        let result = if url.scheme() == "https" {
            self.https_client.request(request).await
        } else {
            self.http_client.request(request).await
        };

        result.map_err(|e| classify_client_error(&e, url, body_cap))
    }
}

/// Map a hyper client failure onto the error taxonomy. The mid-stream body
/// cap surfaces as a length-limit error buried in the source chain.
fn classify_client_error(
    error: &hyper_util::client::legacy::Error,
    url: &Url,
    body_cap: u64,
) -> ProxyError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        if err.is::<http_body_util::LengthLimitError>() {
            return ProxyError::BodyTooLarge(body_cap);
        }
        source = err.source();
    }

    warn!(
        "upstream request to {} failed: {}",
        url.host_str().unwrap_or("?"),
        error
    );
    ProxyError::UpstreamConnect(error.to_string())
}

/// Build the upstream URL: base + inbound path (optionally prefix-stripped)
/// + query. The base's own path is preserved, so `http://u/sub` with
/// inbound `/api/x` forwards to `http://u/sub/api/x`.
pub fn build_upstream_url(
    route: &Route,
    path: &str,
    query: Option<&str>,
) -> Result<Url, url::ParseError> {
    let effective = if route.strip_path {
        let stripped = path.strip_prefix(route.path_prefix.as_str()).unwrap_or(path);
        if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{stripped}")
        }
    } else {
        path.to_string()
    };

    let mut target = format!(
        "{}{}",
        route.upstream_base.as_str().trim_end_matches('/'),
        effective
    );
    if let Some(q) = query {
        target.push('?');
        target.push_str(q);
    }

    Url::parse(&target)
}

fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Decide whether (and how) to follow a redirect response.
///
/// 301/302/303 re-issue as a bodyless GET. 307/308 preserve the method but
/// the original streaming body is already consumed, so they are only
/// followed for GET/HEAD; anything else is relayed to the client verbatim.
fn redirect_target(
    original_method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
    current: &Url,
) -> Option<(Method, Url)> {
    let location = headers
        .get(header::LOCATION)
        .and_then(|v: &HeaderValue| v.to_str().ok())?;
    let next = current.join(location).ok()?;
    if !matches!(next.scheme(), "http" | "https") {
        return None;
    }

    match status {
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER => {
            Some((Method::GET, next))
        }
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            if matches!(*original_method, Method::GET | Method::HEAD) =>
        {
            Some((original_method.clone(), next))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, target: &str, strip: bool) -> Route {
        Route {
            path_prefix: prefix.to_string(),
            upstream_base: Url::parse(target).unwrap(),
            strip_path: strip,
            resolved: Vec::new(),
        }
    }

    #[test]
    fn test_upstream_url_no_strip() {
        let r = route("/api", "http://u1.example.com", false);
        let url = build_upstream_url(&r, "/api/v1/x", None).unwrap();
        assert_eq!(url.as_str(), "http://u1.example.com/api/v1/x");
    }

    #[test]
    fn test_upstream_url_catch_all() {
        let r = route("/", "http://u.example.com", false);
        let url = build_upstream_url(&r, "/anything", None).unwrap();
        assert_eq!(url.as_str(), "http://u.example.com/anything");
    }

    #[test]
    fn test_upstream_url_strip_path() {
        let r = route("/api", "http://u.example.com", true);
        let url = build_upstream_url(&r, "/api/v1/x", None).unwrap();
        assert_eq!(url.as_str(), "http://u.example.com/v1/x");

        // Stripping the whole path leaves the root
        let url = build_upstream_url(&r, "/api", None).unwrap();
        assert_eq!(url.as_str(), "http://u.example.com/");
    }

    #[test]
    fn test_upstream_url_strip_catch_all() {
        let r = route("/", "http://u.example.com:8080", true);
        let url = build_upstream_url(&r, "/sub/page", None).unwrap();
        assert_eq!(url.as_str(), "http://u.example.com:8080/sub/page");
    }

    #[test]
    fn test_upstream_url_preserves_query() {
        let r = route("/api", "http://u.example.com", false);
        let url = build_upstream_url(&r, "/api/search", Some("q=rust&page=2")).unwrap();
        assert_eq!(url.as_str(), "http://u.example.com/api/search?q=rust&page=2");
    }

    #[test]
    fn test_upstream_url_base_with_path() {
        let r = route("/svc", "http://u.example.com/sub/", false);
        let url = build_upstream_url(&r, "/svc/x", None).unwrap();
        assert_eq!(url.as_str(), "http://u.example.com/sub/svc/x");
    }

    #[test]
    fn test_redirect_get_followed() {
        let current = Url::parse("http://u.example.com/a").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/b"));

        let (method, next) =
            redirect_target(&Method::GET, StatusCode::FOUND, &headers, &current).unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(next.as_str(), "http://u.example.com/b");
    }

    #[test]
    fn test_redirect_post_becomes_get_on_303() {
        let current = Url::parse("http://u.example.com/submit").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://u.example.com/done"),
        );

        let (method, _) =
            redirect_target(&Method::POST, StatusCode::SEE_OTHER, &headers, &current).unwrap();
        assert_eq!(method, Method::GET);
    }

    #[test]
    fn test_redirect_post_307_not_followed() {
        // The streamed body is gone; relay the 307 to the client instead
        let current = Url::parse("http://u.example.com/submit").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("/retry"));

        assert!(redirect_target(
            &Method::POST,
            StatusCode::TEMPORARY_REDIRECT,
            &headers,
            &current
        )
        .is_none());
    }

    #[test]
    fn test_redirect_non_http_scheme_ignored() {
        let current = Url::parse("http://u.example.com/a").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("ftp://elsewhere.example.com/"),
        );

        assert!(redirect_target(&Method::GET, StatusCode::FOUND, &headers, &current).is_none());
    }

    #[test]
    fn test_redirect_without_location_ignored() {
        let current = Url::parse("http://u.example.com/a").unwrap();
        assert!(
            redirect_target(&Method::GET, StatusCode::FOUND, &HeaderMap::new(), &current).is_none()
        );
    }

    #[test]
    fn test_authority_includes_default_port() {
        assert_eq!(
            authority_of(&Url::parse("http://u.example.com/x").unwrap()),
            "u.example.com:80"
        );
        assert_eq!(
            authority_of(&Url::parse("https://u.example.com:8443/").unwrap()),
            "u.example.com:8443"
        );
    }
}
