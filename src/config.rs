//! Configuration module with TOML parsing and hot-reload support
//!
//! The parsed document is compiled into an immutable [`RouteSnapshot`]
//! (routes plus the policy values in force at load time). The live snapshot
//! sits in an `ArcSwap`; a reload builds and validates a complete new
//! snapshot before atomically swapping it in, so no request ever observes a
//! partially-applied configuration. Concurrent reloads are serialised by a
//! mutex. Validation is all-or-nothing: any bad route, SSRF rejection, or
//! policy conflict rejects the whole document and the old snapshot stays
//! live.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::routing::{Route, RouteSnapshot};
use crate::ssrf::SsrfValidator;

/// Main proxy configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    pub rate_limit: RateLimitConfig,
    pub body_size: BodySizeConfig,
    pub cors: CorsConfig,
    pub admin_rate_limit: AdminRateLimitConfig,
    pub forwarder: ForwarderConfig,
    pub ssrf: SsrfConfig,
    pub audit: AuditConfig,
}

/// Server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    pub bind_address: String,
    /// Plain HTTP port
    pub http_port: u16,
    /// HTTPS port (0 = disabled; requires a supplied cert and key)
    pub https_port: u16,
    /// Grace period for in-flight requests on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
            https_port: 0,
            shutdown_grace_secs: 30,
        }
    }
}

/// One route in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Path prefix; must start with `/`
    pub path: String,
    /// Upstream base URL (http(s)://host[:port])
    pub target: String,
    /// Drop the matched prefix when forwarding
    #[serde(default)]
    pub strip_path: bool,
}

/// Data-plane rate limiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-IP budget over a 60s sliding window
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
        }
    }
}

/// Request body cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BodySizeConfig {
    pub max_bytes: u64,
}

impl Default for BodySizeConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// CORS policy applied to proxied responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub credentials: bool,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            credentials: false,
            methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
                "PATCH".to_string(),
                "OPTIONS".to_string(),
            ],
            headers: vec!["*".to_string()],
        }
    }
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allows_any_origin() || self.allowed_origins.iter().any(|o| o == origin)
    }
}

/// Admin-plane rate limiting with temporary blocking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminRateLimitConfig {
    pub attempts_per_window: u32,
    pub window_seconds: u64,
    pub block_seconds: u64,
}

impl Default for AdminRateLimitConfig {
    fn default() -> Self {
        Self {
            attempts_per_window: 5,
            window_seconds: 300,
            block_seconds: 600,
        }
    }
}

/// Forwarder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Total per-request deadline
    pub timeout_seconds: u64,
    /// TCP connect deadline
    pub connect_timeout_seconds: u64,
    /// Upstream redirects to follow (0 disables)
    pub max_redirects: u32,
    /// In-flight cap per upstream host:port
    pub max_concurrent_per_host: u32,
    /// Append to an inbound X-Forwarded-For chain instead of replacing it
    pub append_forwarded_for: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            connect_timeout_seconds: 5,
            max_redirects: 5,
            max_concurrent_per_host: 200,
            append_forwarded_for: false,
        }
    }
}

/// SSRF deny-set tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SsrfConfig {
    /// Relax the RFC1918/unique-local entries for trusted private networks
    pub allow_private: bool,
    /// Additional hostnames rejected on sight
    pub blocked_hostnames: Vec<String>,
}

/// Audit queue and batching tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Bounded submission queue; overflow drops events
    pub queue_capacity: usize,
    /// Events per commit batch
    pub batch_max: usize,
    /// Commit timer when the batch is not full
    pub batch_interval_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            batch_max: 100,
            batch_interval_ms: 100,
        }
    }
}

impl ProxyConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;
        config.validate_static()?;
        Ok(config)
    }

    /// Structural validation that needs no I/O. SSRF checks run separately
    /// because they resolve DNS.
    pub fn validate_static(&self) -> anyhow::Result<()> {
        for (idx, route) in self.routes.iter().enumerate() {
            if route.path.is_empty() || !route.path.starts_with('/') {
                anyhow::bail!("route {idx}: path must start with '/': {:?}", route.path);
            }
            let url = Url::parse(&route.target)
                .map_err(|e| anyhow::anyhow!("route {idx}: invalid target: {e}"))?;
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("route {idx}: target must be http or https: {}", route.target);
            }
            if url.host_str().is_none() {
                anyhow::bail!("route {idx}: target must contain a host: {}", route.target);
            }
            if url.query().is_some() || url.fragment().is_some() {
                anyhow::bail!(
                    "route {idx}: target must not carry a query or fragment: {}",
                    route.target
                );
            }
        }

        if self.cors.credentials && self.cors.allows_any_origin() {
            anyhow::bail!(
                "cors: credentials = true is incompatible with allowed_origins = [\"*\"]"
            );
        }

        if self.rate_limit.requests_per_minute == 0 {
            anyhow::bail!("rate_limit: requests_per_minute must be positive");
        }
        if self.admin_rate_limit.attempts_per_window == 0 {
            anyhow::bail!("admin_rate_limit: attempts_per_window must be positive");
        }

        Ok(())
    }

    /// Compile the document into an immutable snapshot, running every
    /// target through the SSRF validator. Any rejection fails the whole
    /// document.
    pub async fn compile(&self) -> anyhow::Result<Arc<RouteSnapshot>> {
        self.validate_static()?;

        let validator = SsrfValidator::new(&self.ssrf);
        let mut routes = Vec::with_capacity(self.routes.len());

        for (idx, entry) in self.routes.iter().enumerate() {
            let url = Url::parse(&entry.target)?;
            let resolved = validator
                .validate(&url)
                .await
                .map_err(|e| anyhow::anyhow!("route {idx} ({}) rejected: {e}", entry.path))?;

            routes.push(Route {
                path_prefix: entry.path.clone(),
                upstream_base: url,
                strip_path: entry.strip_path,
                resolved,
            });
        }

        Ok(RouteSnapshot::new(
            routes,
            self.rate_limit,
            self.admin_rate_limit,
            self.body_size,
            self.cors.clone(),
            self.forwarder.clone(),
        ))
    }
}

/// Holds the live snapshot and drives reloads.
pub struct ConfigManager {
    config_path: PathBuf,
    /// Current parsed document (for the admin config view)
    document: ArcSwap<ProxyConfig>,
    /// Current compiled snapshot; requests load this once each
    snapshot: ArcSwap<RouteSnapshot>,
    /// Serialises reload attempts
    reload_lock: Mutex<()>,
    /// File watcher for hot-reload
    watcher: parking_lot::Mutex<Option<RecommendedWatcher>>,
}

impl ConfigManager {
    /// Load the initial configuration from `path`.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("failed to read config {config_path:?}: {e}"))?;
        let config = ProxyConfig::from_toml(&content)?;
        let snapshot = config.compile().await?;

        info!(
            "configuration loaded from {:?} ({} routes)",
            config_path,
            snapshot.route_count()
        );

        Ok(Self {
            config_path,
            document: ArcSwap::new(Arc::new(config)),
            snapshot: ArcSwap::new(snapshot),
            reload_lock: Mutex::new(()),
            watcher: parking_lot::Mutex::new(None),
        })
    }

    /// The live snapshot. Callers hold the returned `Arc` for the duration
    /// of one request.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.load_full()
    }

    /// The live parsed document (admin config view).
    pub fn document(&self) -> Arc<ProxyConfig> {
        self.document.load_full()
    }

    /// Re-read and validate the document; on success atomically swap the
    /// live snapshot. On any failure the previous snapshot stays in force.
    pub async fn reload(&self) -> anyhow::Result<Arc<RouteSnapshot>> {
        let _guard = self.reload_lock.lock().await;

        let content = std::fs::read_to_string(&self.config_path)
            .map_err(|e| anyhow::anyhow!("failed to read config {:?}: {e}", self.config_path))?;
        let config = ProxyConfig::from_toml(&content)?;
        let snapshot = config.compile().await?;

        self.document.store(Arc::new(config));
        self.snapshot.store(snapshot.clone());

        info!("configuration reloaded ({} routes)", snapshot.route_count());
        Ok(snapshot)
    }

    /// Watch the config file; each change event is delivered on the
    /// returned channel so the caller can run the validated reload path.
    pub fn start_watching(&self) -> anyhow::Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(4);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        debug!("config file change detected: {:?}", event.kind);
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!("config file watch error: {}", e),
            })?;

        watcher.watch(&self.config_path, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);
        info!("configuration file watching enabled");

        Ok(rx)
    }

    /// Stop watching the configuration file.
    pub fn stop_watching(&self) {
        *self.watcher.lock() = None;
    }
}
