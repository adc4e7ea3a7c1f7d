//! Vantage Proxy - lightweight L7 reverse proxy
//!
//! A reverse proxy that:
//! - Routes requests by longest-prefix match over a hot-reloadable table
//! - Enforces per-client admission (sliding-window rate limits, body caps)
//! - Gates upstream targets through an SSRF validator at install time
//! - Persists a durable, queryable audit trail of requests and admin actions
//! - Exposes an authenticated admin/audit surface (shared secret, session
//!   tokens, long-lived API keys)

pub mod admin;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod listener;
pub mod proxy;
pub mod rate_limit;
pub mod routing;
pub mod ssrf;

// Re-export commonly used types
pub use audit::{AuditStore, EventKind};
pub use auth::{AdminCredentials, AuthGate, KeyStore, TokenService};
pub use config::{ConfigManager, ProxyConfig};
pub use error::ProxyError;
pub use forwarder::Forwarder;
pub use listener::build_app;
pub use proxy::AppState;
pub use rate_limit::{AdminRateLimiter, SlidingWindowLimiter};
pub use routing::{Route, RouteSnapshot};
pub use ssrf::SsrfValidator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
