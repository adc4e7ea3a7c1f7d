//! Admin, audit, and auth HTTP surface
//!
//! Every operation here is rate-limited per `(client, operation)` before
//! authentication, then gated on any of the three credential kinds. The
//! login and refresh endpoints only take the limiter (they are how callers
//! obtain credentials in the first place). Mutating operations additionally
//! record an admin-action audit event.

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::audit::{AuditQuery, AuditStats, EventKind};
use crate::auth::{decode_basic, ApiKeyInfo, Identity, NewApiKey, TokenKind, TokenPair};
use crate::error::ProxyError;
use crate::proxy::AppState;
use crate::rate_limit::{AdminCheck, WindowStats};
use crate::routing::RouteView;

/// Build the authenticated admin/audit/key-management router.
pub fn admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/admin/reload", post(reload_handler))
        .route("/admin/routes", get(routes_handler))
        .route("/admin/config", get(config_handler))
        .route("/admin/status", get(status_handler))
        .route("/admin/ratelimit/clear/:ip", post(clear_rate_limit_handler))
        .route("/admin/ratelimit/stats/:ip", get(rate_limit_stats_handler))
        .route("/audit/logs", get(audit_logs_handler))
        .route("/audit/stats", get(audit_stats_handler))
        .route("/auth/keys", get(list_keys_handler).post(create_key_handler))
        .route("/auth/keys/:id/revoke", post(revoke_key_handler))
        .route("/auth/keys/:id", delete(delete_key_handler))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(state, admin_gate))
}

/// Build the credential-issuing router (rate-limited, not auth-gated).
pub fn token_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .layer(middleware::from_fn_with_state(state, rate_limit_gate))
}

/// Operation name used as the admin-limiter key for a surface path.
fn operation_name(path: &str) -> &'static str {
    if path.starts_with("/admin/reload") {
        "reload"
    } else if path.starts_with("/admin/routes") {
        "list_routes"
    } else if path.starts_with("/admin/config") {
        "get_config"
    } else if path.starts_with("/admin/status") {
        "status"
    } else if path.starts_with("/admin/ratelimit/clear") {
        "clear_rate_limit"
    } else if path.starts_with("/admin/ratelimit/stats") {
        "rate_limit_stats"
    } else if path.starts_with("/audit/logs") {
        "audit_logs"
    } else if path.starts_with("/audit/stats") {
        "audit_stats"
    } else if path.starts_with("/auth/keys") {
        "manage_keys"
    } else if path.starts_with("/auth/login") {
        "login"
    } else if path.starts_with("/auth/refresh") {
        "refresh"
    } else {
        "admin"
    }
}

/// Pre-auth limiter applied to every surface operation. Every attempt
/// counts, so credential brute force is throttled before the gate runs.
async fn rate_limit_gate(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_addr.ip();
    let op = operation_name(request.uri().path());

    match state.admin_limiter.check(ip, op, Instant::now()) {
        AdminCheck::Ok => next.run(request).await,
        AdminCheck::BlockedFor(secs) => ProxyError::RateLimited(secs).into_response(),
    }
}

/// Limiter plus the auth gate; the resolved identity is handed to handlers
/// through request extensions.
async fn admin_gate(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_addr.ip();
    let op = operation_name(request.uri().path());

    if let AdminCheck::BlockedFor(secs) = state.admin_limiter.check(ip, op, Instant::now()) {
        return ProxyError::RateLimited(secs).into_response();
    }

    match state.auth.authenticate(request.headers(), ip) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(_) => ProxyError::Unauthorized.into_response(),
    }
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Auth endpoints
// ---------------------------------------------------------------------------

/// Exchange a basic credential for an access/refresh token pair.
async fn login_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<TokenPair>, ProxyError> {
    let ip = client_addr.ip();

    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(ProxyError::Unauthorized)?;

    let (username, password) = decode_basic(encoded).ok_or(ProxyError::Unauthorized)?;

    if !state.auth.credentials.verify(&username, &password) {
        warn!("failed login attempt for '{}' from {}", username, ip);
        return Err(ProxyError::Unauthorized);
    }

    let pair = state
        .auth
        .tokens
        .issue_pair(&username)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    state
        .audit
        .admin_action(ip, "login", None, user_agent(&headers));
    info!("user '{}' logged in from {}", username, ip);

    Ok(Json(pair))
}

/// Issue a fresh pair from a refresh token. Access tokens are not accepted
/// here, and refresh tokens are not accepted anywhere else.
async fn refresh_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TokenPair>, ProxyError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ProxyError::Unauthorized)?;

    let subject = state
        .auth
        .tokens
        .verify(token, TokenKind::Refresh)
        .map_err(|_| ProxyError::Unauthorized)?;

    let pair = state
        .auth
        .tokens
        .issue_pair(&subject)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    Ok(Json(pair))
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    name: String,
}

async fn list_keys_handler(State(state): State<AppState>) -> Result<Json<Vec<ApiKeyInfo>>, ProxyError> {
    state
        .auth
        .keys
        .list()
        .map(Json)
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Create a key; the secret appears in this response and never again.
async fn create_key_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Json<NewApiKey>, ProxyError> {
    if body.name.trim().is_empty() {
        return Err(ProxyError::Validation("key name must not be empty".to_string()));
    }

    let key = state
        .auth
        .keys
        .generate(body.name.trim())
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    state.audit.admin_action(
        client_addr.ip(),
        "create_api_key",
        Some(format!("key_id={} name={}", key.key_id, key.name)),
        user_agent(&headers),
    );

    Ok(Json(key))
}

#[derive(Serialize)]
struct KeyActionResponse {
    status: &'static str,
    key_id: String,
}

async fn revoke_key_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<Json<KeyActionResponse>, ProxyError> {
    let found = state
        .auth
        .keys
        .revoke(&key_id)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    if !found {
        return Err(ProxyError::Validation(format!("unknown key: {key_id}")));
    }

    state.audit.admin_action(
        client_addr.ip(),
        "revoke_api_key",
        Some(format!("key_id={key_id}")),
        user_agent(&headers),
    );

    Ok(Json(KeyActionResponse {
        status: "revoked",
        key_id,
    }))
}

async fn delete_key_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> Result<Json<KeyActionResponse>, ProxyError> {
    let found = state
        .auth
        .keys
        .delete(&key_id)
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    if !found {
        return Err(ProxyError::Validation(format!("unknown key: {key_id}")));
    }

    state.audit.admin_action(
        client_addr.ip(),
        "delete_api_key",
        Some(format!("key_id={key_id}")),
        user_agent(&headers),
    );

    Ok(Json(KeyActionResponse {
        status: "deleted",
        key_id,
    }))
}

// ---------------------------------------------------------------------------
// Admin endpoints
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ReloadResponse {
    status: &'static str,
    message: String,
    routes_count: usize,
}

/// Re-read the config document; atomic swap on success, old snapshot
/// retained on failure.
async fn reload_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Extension(identity): Extension<Identity>,
) -> Result<Json<ReloadResponse>, ProxyError> {
    let ip = client_addr.ip();

    match state.reload().await {
        Ok(snapshot) => {
            state.audit.admin_action(
                ip,
                "reload",
                Some(format!(
                    "outcome=applied routes={} by={}",
                    snapshot.route_count(),
                    identity.subject()
                )),
                user_agent(&headers),
            );
            Ok(Json(ReloadResponse {
                status: "success",
                message: "configuration reloaded".to_string(),
                routes_count: snapshot.route_count(),
            }))
        }
        Err(e) => {
            error!("configuration reload failed: {e:#}");
            state.audit.admin_action(
                ip,
                "reload",
                Some(format!("outcome=rejected reason={e}")),
                user_agent(&headers),
            );
            Err(ProxyError::Internal("configuration reload failed".to_string()))
        }
    }
}

async fn routes_handler(State(state): State<AppState>) -> Json<Vec<RouteView>> {
    Json(state.config.snapshot().route_views())
}

async fn config_handler(State(state): State<AppState>) -> Json<crate::config::ProxyConfig> {
    Json((*state.config.document()).clone())
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    routes_count: usize,
    rate_limit: RateLimitStatus,
    audit: AuditStatus,
}

#[derive(Serialize)]
struct RateLimitStatus {
    requests_per_minute: u32,
    window_seconds: u64,
    tracked_ips: usize,
}

#[derive(Serialize)]
struct AuditStatus {
    dropped_events: u64,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.config.snapshot();
    Json(StatusResponse {
        status: "running",
        version: crate::VERSION,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        routes_count: snapshot.route_count(),
        rate_limit: RateLimitStatus {
            requests_per_minute: snapshot.rate_limit.requests_per_minute,
            window_seconds: 60,
            tracked_ips: state.limiter.tracked_ips(),
        },
        audit: AuditStatus {
            dropped_events: state.audit.dropped_events(),
        },
    })
}

/// Gate a path parameter that must be an IP literal.
fn parse_ip_literal(raw: &str) -> Result<IpAddr, ProxyError> {
    static IP_SHAPE: OnceLock<Regex> = OnceLock::new();
    let shape = IP_SHAPE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f:.]{1,45}$").expect("static regex"));

    if !shape.is_match(raw) {
        return Err(ProxyError::Validation(format!("invalid IP address: {raw}")));
    }
    raw.parse::<IpAddr>()
        .map_err(|_| ProxyError::Validation(format!("invalid IP address: {raw}")))
}

#[derive(Serialize)]
struct ClearRateLimitResponse {
    status: &'static str,
    ip: String,
}

async fn clear_rate_limit_handler(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(ip): Path<String>,
) -> Result<Json<ClearRateLimitResponse>, ProxyError> {
    let target = parse_ip_literal(&ip)?;

    state.limiter.clear(target);

    state.audit.admin_action(
        client_addr.ip(),
        "clear_rate_limit",
        Some(format!("ip={target}")),
        user_agent(&headers),
    );

    Ok(Json(ClearRateLimitResponse {
        status: "cleared",
        ip: target.to_string(),
    }))
}

async fn rate_limit_stats_handler(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<Json<WindowStats>, ProxyError> {
    let target = parse_ip_literal(&ip)?;
    Ok(Json(state.limiter.stats(target, Instant::now())))
}

// ---------------------------------------------------------------------------
// Audit endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogsParams {
    limit: Option<u32>,
    offset: Option<u32>,
    kind: Option<String>,
    client_ip: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ProxyError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ProxyError::Validation(format!("invalid timestamp: {raw}")))
}

async fn audit_logs_handler(
    State(state): State<AppState>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<crate::audit::AuditRecord>>, ProxyError> {
    let kind = match params.kind.as_deref() {
        Some(raw) => Some(EventKind::parse(raw).ok_or_else(|| {
            ProxyError::Validation("kind must be 'request' or 'admin-action'".to_string())
        })?),
        None => None,
    };

    let client_ip = match params.client_ip.as_deref() {
        Some(raw) => Some(parse_ip_literal(raw)?),
        None => None,
    };

    let query = AuditQuery {
        kind,
        client_ip,
        start: params.start.as_deref().map(parse_timestamp).transpose()?,
        end: params.end.as_deref().map(parse_timestamp).transpose()?,
        limit: params.limit.unwrap_or(100).clamp(1, 1000),
        offset: params.offset.unwrap_or(0),
    };

    state.audit.query(&query).map(Json).map_err(|e| {
        error!("audit query failed: {e}");
        ProxyError::Internal("audit query failed".to_string())
    })
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    /// Trailing window in hours (default 24)
    window_hours: Option<u32>,
}

async fn audit_stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<AuditStats>, ProxyError> {
    let window = params.window_hours.unwrap_or(24).clamp(1, 24 * 30);
    state.audit.stats(window).map(Json).map_err(|e| {
        error!("audit stats failed: {e}");
        ProxyError::Internal("audit stats failed".to_string())
    })
}
