//! Unit tests for configuration parsing and validation from the public API

use vantage_proxy::config::ProxyConfig;

#[test]
fn test_minimal_document_overrides_defaults() {
    let config = ProxyConfig::from_toml(
        r#"
[server]
bind_address = "127.0.0.1"
http_port = 18443

[admin_rate_limit]
attempts_per_window = 3
window_seconds = 60
block_seconds = 120
"#,
    )
    .unwrap();

    assert_eq!(config.server.bind_address, "127.0.0.1");
    assert_eq!(config.server.http_port, 18443);
    assert_eq!(config.admin_rate_limit.attempts_per_window, 3);
    assert_eq!(config.admin_rate_limit.window_seconds, 60);
    assert_eq!(config.admin_rate_limit.block_seconds, 120);

    // Untouched sections keep their defaults
    assert_eq!(config.rate_limit.requests_per_minute, 100);
    assert_eq!(config.body_size.max_bytes, 10 * 1024 * 1024);
    assert_eq!(config.forwarder.max_redirects, 5);
}

#[test]
fn test_empty_document_is_valid() {
    let config = ProxyConfig::from_toml("").unwrap();
    assert!(config.routes.is_empty());
    assert!(!config.cors.credentials);
    assert!(config.cors.allows_any_origin());
}

#[test]
fn test_route_entries_parse_in_order() {
    let config = ProxyConfig::from_toml(
        r#"
[[routes]]
path = "/a"
target = "http://198.51.100.1"

[[routes]]
path = "/b"
target = "http://198.51.100.2"
strip_path = true
"#,
    )
    .unwrap();

    assert_eq!(config.routes.len(), 2);
    assert_eq!(config.routes[0].path, "/a");
    assert!(!config.routes[0].strip_path);
    assert_eq!(config.routes[1].path, "/b");
    assert!(config.routes[1].strip_path);
}

#[test]
fn test_invalid_documents_rejected() {
    // Unparseable TOML
    assert!(ProxyConfig::from_toml("routes = {").is_err());

    // Route without a scheme
    assert!(ProxyConfig::from_toml(
        r#"
[[routes]]
path = "/x"
target = "198.51.100.1:8080"
"#
    )
    .is_err());

    // Zero data-plane budget
    assert!(ProxyConfig::from_toml(
        r#"
[rate_limit]
requests_per_minute = 0
"#
    )
    .is_err());
}
