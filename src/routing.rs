//! Route table snapshots with longest-prefix matching
//!
//! A `RouteSnapshot` is an immutable view of the route table plus every
//! policy value that was in force when the configuration was loaded. The
//! live snapshot sits behind an `ArcSwap` in the config manager; each
//! request loads it once and keeps that `Arc` for its whole lifetime, so a
//! concurrent reload never changes what an in-flight request observes.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use url::Url;

use crate::config::{
    AdminRateLimitConfig, BodySizeConfig, CorsConfig, ForwarderConfig, RateLimitConfig,
};

/// A single compiled route entry.
#[derive(Debug, Clone)]
pub struct Route {
    /// Path prefix to match; always starts with `/`
    pub path_prefix: String,
    /// Upstream base URL (scheme + authority, no query/fragment)
    pub upstream_base: Url,
    /// Drop the matched prefix before forwarding
    pub strip_path: bool,
    /// Addresses the upstream host resolved to at install time
    pub resolved: Vec<IpAddr>,
}

/// Serializable route view for the admin surface (no resolved addresses).
#[derive(Debug, Clone, Serialize)]
pub struct RouteView {
    pub path: String,
    pub target: String,
    pub strip_path: bool,
}

impl From<&Route> for RouteView {
    fn from(r: &Route) -> Self {
        Self {
            path: r.path_prefix.clone(),
            target: r.upstream_base.to_string(),
            strip_path: r.strip_path,
        }
    }
}

/// Immutable snapshot of the route table and its policies.
#[derive(Debug)]
pub struct RouteSnapshot {
    /// Routes ordered by prefix length descending; stable sort keeps
    /// insertion order for equal lengths so earlier routes win ties.
    routes: Vec<Route>,
    pub rate_limit: RateLimitConfig,
    pub admin_rate_limit: AdminRateLimitConfig,
    pub body_size: BodySizeConfig,
    pub cors: CorsConfig,
    pub forwarder: ForwarderConfig,
}

impl RouteSnapshot {
    /// Build a snapshot from validated routes and policy values.
    pub fn new(
        mut routes: Vec<Route>,
        rate_limit: RateLimitConfig,
        admin_rate_limit: AdminRateLimitConfig,
        body_size: BodySizeConfig,
        cors: CorsConfig,
        forwarder: ForwarderConfig,
    ) -> Arc<Self> {
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Arc::new(Self {
            routes,
            rate_limit,
            admin_rate_limit,
            body_size,
            cors,
            forwarder,
        })
    }

    /// Longest-prefix match over the table.
    ///
    /// `/foo` matches prefix `/foo` and prefix `/`, but not `/foo/`.
    /// The list is sorted longest-first, so the first hit wins.
    pub fn match_route(&self, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| path.starts_with(r.path_prefix.as_str()))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn route_views(&self) -> Vec<RouteView> {
        self.routes.iter().map(RouteView::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AdminRateLimitConfig, BodySizeConfig, CorsConfig, ForwarderConfig, RateLimitConfig,
    };

    fn route(prefix: &str, target: &str) -> Route {
        Route {
            path_prefix: prefix.to_string(),
            upstream_base: Url::parse(target).unwrap(),
            strip_path: false,
            resolved: Vec::new(),
        }
    }

    fn snapshot(routes: Vec<Route>) -> Arc<RouteSnapshot> {
        RouteSnapshot::new(
            routes,
            RateLimitConfig::default(),
            AdminRateLimitConfig::default(),
            BodySizeConfig::default(),
            CorsConfig::default(),
            ForwarderConfig::default(),
        )
    }

    #[test]
    fn test_longest_prefix_wins() {
        let snap = snapshot(vec![
            route("/", "http://u2.example.com"),
            route("/api", "http://u1.example.com"),
        ]);

        let hit = snap.match_route("/api/v1/x").unwrap();
        assert_eq!(hit.path_prefix, "/api");

        let hit = snap.match_route("/other").unwrap();
        assert_eq!(hit.path_prefix, "/");
    }

    #[test]
    fn test_catch_all_only() {
        let snap = snapshot(vec![route("/", "http://u.example.com")]);
        assert!(snap.match_route("/anything").is_some());
        assert!(snap.match_route("/").is_some());
    }

    #[test]
    fn test_no_match() {
        let snap = snapshot(vec![route("/api", "http://u.example.com")]);
        assert!(snap.match_route("/other").is_none());
    }

    #[test]
    fn test_segment_boundary() {
        // /foo matches prefix /foo but not /foo/
        let snap = snapshot(vec![route("/foo/", "http://u.example.com")]);
        assert!(snap.match_route("/foo").is_none());
        assert!(snap.match_route("/foo/bar").is_some());

        let snap = snapshot(vec![route("/foo", "http://u.example.com")]);
        assert!(snap.match_route("/foo").is_some());
        assert!(snap.match_route("/foobar").is_some());
    }

    #[test]
    fn test_tie_break_insertion_order() {
        // Two routes with equal-length prefixes: the earlier one wins.
        let snap = snapshot(vec![
            route("/aa", "http://first.example.com"),
            route("/ab", "http://second.example.com"),
            route("/ab", "http://shadowed.example.com"),
        ]);

        let hit = snap.match_route("/ab/x").unwrap();
        assert_eq!(hit.upstream_base.host_str(), Some("second.example.com"));
    }

    #[test]
    fn test_match_is_deterministic() {
        let snap = snapshot(vec![
            route("/api", "http://u1.example.com"),
            route("/api/v2", "http://u2.example.com"),
            route("/", "http://u3.example.com"),
        ]);

        let first = snap.match_route("/api/v2/users").unwrap().path_prefix.clone();
        for _ in 0..10 {
            assert_eq!(snap.match_route("/api/v2/users").unwrap().path_prefix, first);
        }
        assert_eq!(first, "/api/v2");
    }
}
