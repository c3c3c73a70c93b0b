//! Tracker server command: `activitypro serve`.

use anyhow::Result;

use activitypro::config::AppConfig;
use activitypro::tracker::server::{ServerConfig, start_server};

pub async fn cmd_serve(config: &AppConfig, open: bool) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    // Spawn browser open before starting the server (which blocks)
    if open {
        let host = match config.server.host.as_str() {
            "0.0.0.0" | "::" => "localhost",
            other => other,
        };
        let url = format!("http://{}:{}", host, config.server.port);
        tokio::spawn(async move {
            // Small delay to let the server start binding
            tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
            if let Err(e) = open::that(&url) {
                tracing::warn!(error = %e, url, "Failed to open browser");
            }
        });
    }

    start_server(ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
        db_path: config.database.path.clone(),
        static_dir: config.server.static_dir.clone(),
        dev_mode: config.server.dev_mode,
        settings: config.api_settings(),
    })
    .await
}
