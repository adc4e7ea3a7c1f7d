//! Integration tests for Vantage Proxy
//!
//! These tests verify end-to-end wiring across modules:
//! - Configuration loading, compilation, and hot reload
//! - Snapshot isolation under reload
//! - Audit store lifecycle across the public API
//! - Auth gate composition

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use vantage_proxy::audit::AuditQuery;
use vantage_proxy::auth::{AdminCredentials, AuthGate, KeyStore, TokenService};
use vantage_proxy::config::AuditConfig;
use vantage_proxy::{AuditStore, ConfigManager, ProxyConfig, SlidingWindowLimiter};

fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_config_load_and_match() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[server]
http_port = 18080

[[routes]]
path = "/api"
target = "http://198.51.100.10:3000"

[[routes]]
path = "/"
target = "http://198.51.100.11:8080"

[rate_limit]
requests_per_minute = 42
"#,
    );

    let manager = ConfigManager::load(&path).await.unwrap();
    let snapshot = manager.snapshot();

    assert_eq!(snapshot.route_count(), 2);
    assert_eq!(snapshot.rate_limit.requests_per_minute, 42);

    // Longest prefix wins; catch-all takes the rest
    let api = snapshot.match_route("/api/v1/users").unwrap();
    assert_eq!(api.upstream_base.host_str(), Some("198.51.100.10"));
    let rest = snapshot.match_route("/anything/else").unwrap();
    assert_eq!(rest.upstream_base.host_str(), Some("198.51.100.11"));
}

#[tokio::test]
async fn test_snapshot_isolation_across_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[[routes]]
path = "/api"
target = "http://198.51.100.10:3000"
"#,
    );

    let manager = Arc::new(ConfigManager::load(&path).await.unwrap());

    // An "in-flight request" captures the snapshot before the reload
    let captured = manager.snapshot();
    let captured_target = captured
        .match_route("/api/x")
        .unwrap()
        .upstream_base
        .to_string();

    std::fs::write(
        &path,
        r#"
[[routes]]
path = "/api"
target = "http://198.51.100.99:3000"
"#,
    )
    .unwrap();
    manager.reload().await.unwrap();

    // New requests see the new upstream; the captured snapshot is unchanged
    let fresh = manager.snapshot();
    assert_eq!(
        fresh.match_route("/api/x").unwrap().upstream_base.host_str(),
        Some("198.51.100.99")
    );
    assert_eq!(
        captured.match_route("/api/x").unwrap().upstream_base.to_string(),
        captured_target
    );
}

#[tokio::test]
async fn test_reload_rejection_is_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[[routes]]
path = "/api"
target = "http://198.51.100.10:3000"

[[routes]]
path = "/static"
target = "http://198.51.100.11:8080"
"#,
    );

    let manager = ConfigManager::load(&path).await.unwrap();

    // Two valid routes plus one SSRF-rejected target: nothing may change
    std::fs::write(
        &path,
        r#"
[[routes]]
path = "/api"
target = "http://198.51.100.20:3000"

[[routes]]
path = "/static"
target = "http://198.51.100.21:8080"

[[routes]]
path = "/internal"
target = "http://169.254.169.254"
"#,
    )
    .unwrap();

    assert!(manager.reload().await.is_err());

    let live = manager.snapshot();
    assert_eq!(live.route_count(), 2);
    assert_eq!(
        live.match_route("/api/x").unwrap().upstream_base.host_str(),
        Some("198.51.100.10")
    );
}

#[tokio::test]
async fn test_data_plane_limit_trip() {
    // Budget 5: six requests inside one second, sixth rejected
    let limiter = SlidingWindowLimiter::new(5);
    let ip: IpAddr = "1.2.3.4".parse().unwrap();
    let t0 = Instant::now();

    for i in 0..5 {
        assert!(limiter.admit(ip, t0 + Duration::from_millis(i * 100)));
    }
    assert!(!limiter.admit(ip, t0 + Duration::from_millis(900)));
}

#[tokio::test]
async fn test_audit_round_trip_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = AuditStore::open(
        dir.path().join("audit.db"),
        &AuditConfig {
            queue_capacity: 128,
            batch_max: 100,
            batch_interval_ms: 5,
        },
    )
    .unwrap();

    let client: IpAddr = "203.0.113.5".parse().unwrap();
    store.record_request(client, "GET", "/api/v1/x", 502, 3.1, None);
    store.admin_action(client, "reload", Some("outcome=rejected".to_string()), None);
    store.shutdown().await;

    let rows = store
        .query(&AuditQuery {
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].action.as_deref(), Some("reload"));
    assert!(rows[0]
        .details
        .as_deref()
        .unwrap()
        .contains("outcome=rejected"));
    assert_eq!(rows[1].status_code, Some(502));
}

#[tokio::test]
async fn test_auth_gate_end_to_end() {
    use axum::http::{header, HeaderMap, HeaderValue};
    use base64::Engine;

    let key_dir = tempfile::tempdir().unwrap();
    let gate = AuthGate::new(
        AdminCredentials::new("operator", "correct-horse"),
        TokenService::new("integration-signing-key"),
        KeyStore::open(key_dir.path().join("keys.db")).unwrap(),
    );
    let ip: IpAddr = "127.0.0.1".parse().unwrap();

    // Login flow: basic -> token pair -> bearer works on the gate
    let basic = base64::engine::general_purpose::STANDARD.encode("operator:correct-horse");
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Basic {basic}")).unwrap(),
    );
    let identity = gate.authenticate(&headers, ip).unwrap();
    assert_eq!(identity.subject(), "operator");

    let pair = gate.tokens.issue_pair(identity.subject()).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", pair.access_token)).unwrap(),
    );
    assert!(gate.authenticate(&headers, ip).is_ok());

    // Key flow: generated key works until revoked
    let key = gate.keys.generate("integration").unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", HeaderValue::from_str(&key.api_key).unwrap());
    assert!(gate.authenticate(&headers, ip).is_ok());

    gate.keys.revoke(&key.key_id).unwrap();
    assert!(gate.authenticate(&headers, ip).is_err());
}

#[test]
fn test_default_document_is_valid() {
    let config = ProxyConfig::default();
    assert!(config.validate_static().is_ok());
    assert_eq!(config.server.http_port, 8000);
    assert_eq!(config.server.shutdown_grace_secs, 30);
}
