use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use super::api::{self, ApiError, ApiSettings, AppState, SharedState};
use super::db::{DbHandle, TrackerDb};
use super::ws;

/// How often expired auth sessions are swept from the store.
const SESSION_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

/// Configuration for the tracker server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Pre-built SPA to serve; unknown paths fall back to its `index.html`.
    pub static_dir: Option<PathBuf>,
    pub dev_mode: bool,
    pub settings: ApiSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: PathBuf::from("data/activitypro.db"),
            static_dir: None,
            dev_mode: false,
            settings: ApiSettings::default(),
        }
    }
}

/// Build the full application router with API, WebSocket, and SPA serving.
pub fn build_router(state: SharedState, static_dir: Option<&Path>) -> Router {
    let app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    let app = match static_dir {
        Some(dir) => {
            let index = ServeFile::new(dir.join("index.html"));
            app.fallback_service(ServeDir::new(dir).fallback(index))
        }
        None => app.fallback(not_found),
    };

    app.layer(TraceLayer::new_for_http())
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Not found".into())
}

/// Start the tracker server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = TrackerDb::new(&config.db_path).context("Failed to initialize tracker database")?;
    if db.count_users()? == 0 {
        tracing::warn!(
            "No users exist yet; run `activitypro create-user --role admin` to add one"
        );
    }

    let state = Arc::new(AppState::new(DbHandle::new(db), config.settings.clone()));
    spawn_session_purge(state.db.clone());

    let mut app = build_router(state, config.static_dir.as_deref());

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        address = %local_addr,
        db = %config.db_path.display(),
        "ActivityPro running at http://{}",
        local_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

fn spawn_session_purge(db: DbHandle) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match db.call(|db| db.purge_expired_sessions(Utc::now())).await {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "Purged expired auth sessions"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge auth sessions"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down...");
}
