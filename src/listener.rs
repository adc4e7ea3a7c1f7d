//! Listener assembly and serving
//!
//! One router serves both planes: the proxy's own surface (`/health`,
//! `/auth/*`, `/admin/*`, `/audit/*`) is matched first and everything else
//! falls through to the forwarding pipeline. The audit recorder wraps the
//! whole router so data-plane and surface requests alike land in the trail.

use std::net::SocketAddr;
use std::path::Path;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tracing::info;

use crate::admin::{admin_router, token_router};
use crate::audit::record_requests;
use crate::proxy::{health_handler, proxy_handler, AppState};

/// Assemble the full application router for one listener.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(admin_router(state.clone()))
        .merge(token_router(state.clone()))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(
            state.audit.clone(),
            record_requests,
        ))
        .with_state(state)
}

/// Serve plaintext HTTP until the handle signals shutdown.
pub async fn run_http(addr: SocketAddr, app: Router, handle: Handle) -> anyhow::Result<()> {
    info!("HTTP listener on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Serve TLS-terminated HTTPS with the supplied certificate chain and key.
pub async fn run_https(
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
    app: Router,
    handle: Handle,
) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {e}"))?;

    info!("HTTPS listener on {} (TLS terminated)", addr);
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}
