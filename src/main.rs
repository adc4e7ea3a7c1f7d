//! Vantage Proxy - lightweight L7 reverse proxy
//!
//! Binary entrypoint: loads the configuration, opens the audit and key
//! stores, wires the request pipeline, binds the listeners, and handles
//! graceful shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vantage_proxy::auth::{AdminCredentials, AuthGate, KeyStore, TokenService};
use vantage_proxy::listener::{build_app, run_http, run_https};
use vantage_proxy::proxy::AppState;
use vantage_proxy::{AuditStore, ConfigManager, Forwarder};

/// Vantage Proxy - L7 reverse proxy with admission control and audit trail
#[derive(Parser, Debug)]
#[command(name = "vantage-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", env = "VANTAGE_CONFIG")]
    config: PathBuf,

    /// Override bind address
    #[arg(long, env = "LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Override HTTP port
    #[arg(long, env = "LISTEN_PORT_HTTP")]
    http_port: Option<u16>,

    /// Override HTTPS port (requires --tls-cert and --tls-key)
    #[arg(long, env = "LISTEN_PORT_HTTPS")]
    https_port: Option<u16>,

    /// TLS certificate chain (PEM)
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Audit store file path
    #[arg(long, default_value = "data/audit.db", env = "AUDIT_PATH")]
    audit_path: PathBuf,

    /// API key store file path
    #[arg(long, default_value = "data/keys.db", env = "KEY_STORE_PATH")]
    key_store_path: PathBuf,

    /// Admin username for the shared-secret credential
    #[arg(long, default_value = "admin", env = "ADMIN_USERNAME")]
    admin_username: String,

    /// Admin password (hashed at startup, never stored)
    #[arg(long, default_value = "change_this_password", env = "ADMIN_PASSWORD")]
    admin_password: String,

    /// Symmetric key for session-token signing
    #[arg(
        long,
        default_value = "change_this_signing_key",
        env = "TOKEN_SIGNING_KEY"
    )]
    token_signing_key: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VANTAGE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "VANTAGE_JSON_LOGS")]
    json_logs: bool,

    /// Watch the configuration file for changes
    #[arg(long, default_value = "true")]
    watch_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Vantage Proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    if args.admin_password == "change_this_password" {
        warn!("⚠️  Using the default admin password - set ADMIN_PASSWORD immediately!");
    }
    if args.token_signing_key == "change_this_signing_key" {
        warn!("⚠️  Using the default token signing key - set TOKEN_SIGNING_KEY immediately!");
    }

    // Load and validate the initial configuration (includes SSRF checks)
    let config_manager = Arc::new(ConfigManager::load(&args.config).await?);
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let document = config_manager.document();
    let bind_address = args
        .listen_addr
        .clone()
        .unwrap_or_else(|| document.server.bind_address.clone());
    let http_port = args.http_port.unwrap_or(document.server.http_port);
    let https_port = args.https_port.unwrap_or(document.server.https_port);
    let grace = Duration::from_secs(document.server.shutdown_grace_secs);

    // HTTPS without a supplied certificate pair is a startup error
    if https_port > 0 && (args.tls_cert.is_none() || args.tls_key.is_none()) {
        anyhow::bail!("HTTPS requested (port {https_port}) but TLS_CERT/TLS_KEY are not set");
    }

    let snapshot = config_manager.snapshot();

    // Admission state
    let limiter = Arc::new(vantage_proxy::SlidingWindowLimiter::new(
        snapshot.rate_limit.requests_per_minute,
    ));
    let admin_limiter = Arc::new(vantage_proxy::AdminRateLimiter::new(
        snapshot.admin_rate_limit.attempts_per_window,
        snapshot.admin_rate_limit.window_seconds,
        snapshot.admin_rate_limit.block_seconds,
    ));

    // Durable stores
    let audit = AuditStore::open(&args.audit_path, &document.audit)?;
    let keys = KeyStore::open(&args.key_store_path)?;

    // Auth gate
    let auth = Arc::new(AuthGate::new(
        AdminCredentials::new(args.admin_username.clone(), &args.admin_password),
        TokenService::new(&args.token_signing_key),
        keys,
    ));

    // Forwarding engine
    let forwarder = Arc::new(Forwarder::new(Duration::from_secs(
        snapshot.forwarder.connect_timeout_seconds,
    )));

    let state = AppState {
        config: config_manager.clone(),
        limiter,
        admin_limiter,
        audit: audit.clone(),
        auth,
        forwarder,
        start_time: Instant::now(),
        scheme: "http",
    };

    // Hot-reload on file change runs the same validated path as the admin
    // reload endpoint
    if args.watch_config {
        let mut change_rx = config_manager.start_watching()?;
        let watch_state = state.clone();
        tokio::spawn(async move {
            while change_rx.recv().await.is_some() {
                match watch_state.reload().await {
                    Ok(snapshot) => {
                        watch_state.audit.admin_action(
                            std::net::IpAddr::from([127, 0, 0, 1]),
                            "reload",
                            Some(format!(
                                "outcome=applied routes={} trigger=file-watch",
                                snapshot.route_count()
                            )),
                            None,
                        );
                    }
                    Err(e) => error!("hot-reload rejected: {e:#}"),
                }
            }
        });
    }

    info!("═══════════════════════════════════════════════════════");
    info!("  🚀 Vantage Proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════");
    info!("  HTTP:   {}:{}", bind_address, http_port);
    if https_port > 0 {
        info!("  HTTPS:  {}:{}", bind_address, https_port);
    }
    info!("  Routes: {} configured", snapshot.route_count());
    for route in snapshot.routes() {
        info!("    {} -> {}", route.path_prefix, route.upstream_base);
    }
    info!(
        "  Rate limit: {} req/min per IP",
        snapshot.rate_limit.requests_per_minute
    );
    info!("  Audit store: {:?}", args.audit_path);
    info!("═══════════════════════════════════════════════════════");

    // Listeners share one shutdown handle so the grace period is applied
    // uniformly
    let handle = axum_server::Handle::new();
    let mut servers = Vec::new();

    let http_addr: SocketAddr = format!("{bind_address}:{http_port}").parse()?;
    let http_app = build_app(state.clone());
    let http_handle = handle.clone();
    servers.push(tokio::spawn(async move {
        if let Err(e) = run_http(http_addr, http_app, http_handle).await {
            error!("HTTP listener error: {e}");
        }
    }));

    if https_port > 0 {
        let https_addr: SocketAddr = format!("{bind_address}:{https_port}").parse()?;
        let https_app = build_app(state.with_scheme("https"));
        let https_handle = handle.clone();
        let cert = args.tls_cert.clone().expect("checked above");
        let key = args.tls_key.clone().expect("checked above");
        servers.push(tokio::spawn(async move {
            if let Err(e) = run_https(https_addr, &cert, &key, https_app, https_handle).await {
                error!("HTTPS listener error: {e}");
            }
        }));
    }

    // Wait for shutdown signal
    info!("Press Ctrl+C to shutdown gracefully");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
        }
    }

    // Stop accepting, give in-flight requests the grace period
    config_manager.stop_watching();
    handle.graceful_shutdown(Some(grace));

    for server in servers {
        if let Err(e) = server.await {
            warn!("listener task error during shutdown: {e}");
        }
    }

    // Drain the audit queue before exit
    audit.shutdown().await;

    info!("Vantage Proxy shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
