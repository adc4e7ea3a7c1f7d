//! Data-plane request pipeline
//!
//! Pipeline order: admission rate limit → body-size guard → route match →
//! forward, with the audit recorder wrapped around the whole surface. Each
//! request captures the live snapshot exactly once and keeps it for its
//! entire lifetime, so a concurrent reload never splits a request across
//! two configurations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use tracing::{debug, warn};

use crate::audit::AuditStore;
use crate::auth::AuthGate;
use crate::config::{ConfigManager, CorsConfig};
use crate::error::ProxyError;
use crate::forwarder::Forwarder;
use crate::rate_limit::{AdminRateLimiter, SlidingWindowLimiter};
use crate::routing::RouteSnapshot;

/// Shared state wired through every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigManager>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub admin_limiter: Arc<AdminRateLimiter>,
    pub audit: AuditStore,
    pub auth: Arc<AuthGate>,
    pub forwarder: Arc<Forwarder>,
    pub start_time: Instant,
    /// Scheme of the listener this state serves ("http" or "https")
    pub scheme: &'static str,
}

impl AppState {
    /// Run the validated reload path and push the new policy values into
    /// the limiters. Returns the new snapshot.
    pub async fn reload(&self) -> anyhow::Result<Arc<RouteSnapshot>> {
        let snapshot = self.config.reload().await?;
        self.limiter
            .update_budget(snapshot.rate_limit.requests_per_minute);
        self.admin_limiter.update_settings(
            snapshot.admin_rate_limit.attempts_per_window,
            snapshot.admin_rate_limit.window_seconds,
            snapshot.admin_rate_limit.block_seconds,
        );
        Ok(snapshot)
    }

    /// Same state bound to the other listener scheme.
    pub fn with_scheme(&self, scheme: &'static str) -> Self {
        let mut state = self.clone();
        state.scheme = scheme;
        state
    }
}

/// Fallback handler: everything that is not the proxy's own surface is
/// routed to a matched upstream or answered 404.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response<Body> {
    let snapshot = state.config.snapshot();
    let client_ip = client_addr.ip();

    // Admission: per-IP sliding window against the global budget
    if !state.limiter.admit(client_ip, Instant::now()) {
        warn!("rate limit exceeded for {}", client_ip);
        let stats = state.limiter.stats(client_ip, Instant::now());
        let retry = 60u64.saturating_sub(stats.oldest_age_secs.unwrap_or(0)).max(1);
        return ProxyError::RateLimited(retry).into_response();
    }

    // Declared body size; length-unknown bodies are capped mid-stream by
    // the forwarder
    let cap = snapshot.body_size.max_bytes;
    if let Err(e) = check_declared_length(request.headers(), cap) {
        warn!("oversized request from {} rejected", client_ip);
        return e.into_response();
    }

    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    // CORS preflight is answered from policy without touching any upstream
    let origin = parts
        .headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if parts.method == Method::OPTIONS
        && origin.is_some()
        && parts
            .headers
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    {
        return cors_preflight(&snapshot.cors, origin.as_deref().unwrap_or_default());
    }

    let Some(route) = snapshot.match_route(&path) else {
        debug!("no route matched for {}", path);
        return ProxyError::NoRoute.into_response();
    };

    let inbound_host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let result = state
        .forwarder
        .forward(
            parts.method,
            &parts.uri,
            parts.headers,
            body,
            route,
            client_ip,
            state.scheme,
            &inbound_host,
            &snapshot.forwarder,
            cap,
        )
        .await;

    match result {
        Ok(mut response) => {
            if let Some(origin) = origin {
                apply_cors_headers(response.headers_mut(), &snapshot.cors, &origin);
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

/// Reject declared lengths above the cap before any upstream work.
pub fn check_declared_length(headers: &HeaderMap, max_bytes: u64) -> Result<(), ProxyError> {
    if let Some(declared) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if declared > max_bytes {
            return Err(ProxyError::BodyTooLarge(max_bytes));
        }
    }
    Ok(())
}

/// Answer an OPTIONS preflight from the configured policy.
fn cors_preflight(cors: &CorsConfig, origin: &str) -> Response<Body> {
    if !cors.allows_origin(origin) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();

    set_allow_origin(headers, cors, origin);

    if !cors.methods.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&cors.methods.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, v);
        }
    }
    if !cors.headers.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&cors.headers.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, v);
        }
    }

    response
}

/// Decorate a proxied response for an allowed origin.
fn apply_cors_headers(headers: &mut HeaderMap, cors: &CorsConfig, origin: &str) {
    if !cors.allows_origin(origin) {
        return;
    }
    set_allow_origin(headers, cors, origin);
}

fn set_allow_origin(headers: &mut HeaderMap, cors: &CorsConfig, origin: &str) {
    // With credentials the wildcard is forbidden, so echo the origin; the
    // loader already rejected credentials + ["*"]
    let value = if cors.allows_any_origin() && !cors.credentials {
        HeaderValue::from_static("*")
    } else {
        match HeaderValue::from_str(origin) {
            Ok(v) => v,
            Err(_) => return,
        }
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    headers.insert(header::VARY, HeaderValue::from_static("origin"));

    if cors.credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

/// Liveness probe.
pub async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "healthy" }))
}
