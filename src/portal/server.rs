use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, PortalDb};
use super::mailer;
use crate::config::PortalConfig;

/// Open the database and mailer described by `config`.
pub fn build_state(config: &PortalConfig) -> Result<SharedState> {
    let db = PortalDb::new(&config.database.path).context("Failed to initialize portal database")?;
    let purged = db.purge_expired_sessions()?;
    if purged > 0 {
        info!(purged, "Removed expired sessions");
    }
    let mailer = mailer::from_config(&config.mail)?;

    Ok(Arc::new(AppState {
        db: DbHandle::new(db),
        mailer,
        auth: config.auth.clone(),
        mail_from: config.mail.from.clone(),
    }))
}

/// Build the full application router.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the portal server and run until Ctrl+C.
pub async fn start_server(config: PortalConfig) -> Result<()> {
    for warning in config.validate() {
        warn!("config: {}", warning);
    }
    let state = build_state(&config)?;
    let app = build_router(state, config.server.dev_mode);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        database = %config.database.path.display(),
        "Fireside Reviews listening on http://{}",
        local_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    info!("Shutting down...");
}
