//! Configuration for the ActivityPro server.
//!
//! Settings are read from `activitypro.toml` (or the file given with
//! `--config`). Layering is file → environment → CLI flags; a missing file
//! means defaults, and every field has a serde default.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! static_dir = "web/dist"
//! dev_mode = false
//!
//! [database]
//! path = "data/activitypro.db"
//!
//! [auth]
//! session_ttl_hours = 12
//!
//! [tracker]
//! auto_pause_on_start = true
//! feed_limit = 50
//!
//! [logging]
//! level = "info"
//! format = "text"
//! dir = "logs"
//! ```
//!
//! # Environment Overrides
//!
//! | Variable                        | Field                       |
//! |---------------------------------|-----------------------------|
//! | `ACTIVITYPRO_HOST`              | `server.host`               |
//! | `ACTIVITYPRO_PORT`              | `server.port`               |
//! | `ACTIVITYPRO_STATIC_DIR`        | `server.static_dir`         |
//! | `ACTIVITYPRO_DB_PATH`           | `database.path`             |
//! | `ACTIVITYPRO_SESSION_TTL_HOURS` | `auth.session_ttl_hours`    |
//! | `ACTIVITYPRO_LOG_FORMAT`        | `logging.format`            |
//!
//! A `.env` file in the working directory is loaded first (see
//! [`load_dotenv`]).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::tracker::api::ApiSettings;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "activitypro.toml";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: text, json", s),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pre-built SPA directory served at `/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
    /// Permissive CORS for a front-end dev server on another port
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: None,
            dev_mode: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/activitypro.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    /// Lifetime of a login token
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

fn default_session_ttl_hours() -> i64 {
    12
}

/// Longest accepted login token lifetime (one year).
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;

/// Timer and feed behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSection {
    /// Starting an activity pauses the user's running one instead of
    /// failing with a timer conflict
    #[serde(default = "default_auto_pause_on_start")]
    pub auto_pause_on_start: bool,
    /// Feed entries returned when the client does not ask for a limit
    #[serde(default = "default_feed_limit")]
    pub feed_limit: i64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            auto_pause_on_start: default_auto_pause_on_start(),
            feed_limit: default_feed_limit(),
        }
    }
}

fn default_auto_pause_on_start() -> bool {
    true
}

fn default_feed_limit() -> i64 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated log files here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Root of `activitypro.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub tracker: TrackerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse activitypro.toml")
    }

    /// Load configuration from `path`, or defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load the file (if any) and apply environment overrides.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize activitypro.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ACTIVITYPRO_*` overrides looked up through `var`.
    pub fn apply_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("ACTIVITYPRO_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("ACTIVITYPRO_PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid ACTIVITYPRO_PORT '{}'", port))?;
        }
        if let Some(dir) = var("ACTIVITYPRO_STATIC_DIR") {
            self.server.static_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = var("ACTIVITYPRO_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(hours) = var("ACTIVITYPRO_SESSION_TTL_HOURS") {
            self.auth.session_ttl_hours = hours
                .trim()
                .parse()
                .with_context(|| format!("Invalid ACTIVITYPRO_SESSION_TTL_HOURS '{}'", hours))?;
        }
        if let Some(format) = var("ACTIVITYPRO_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    /// Handler-facing settings derived from this configuration.
    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            auto_pause_on_start: self.tracker.auto_pause_on_start,
            session_ttl: chrono::Duration::hours(
                self.auth.session_ttl_hours.clamp(1, MAX_SESSION_TTL_HOURS),
            ),
            feed_limit: self.tracker.feed_limit.max(1),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the OS will pick a random port".to_string());
        }
        if self.auth.session_ttl_hours < 1 {
            warnings.push(format!(
                "auth.session_ttl_hours = {} is too short; 1 hour will be used",
                self.auth.session_ttl_hours
            ));
        }
        if self.auth.session_ttl_hours > MAX_SESSION_TTL_HOURS {
            warnings.push(format!(
                "auth.session_ttl_hours = {} is too long; {} hours will be used",
                self.auth.session_ttl_hours, MAX_SESSION_TTL_HOURS
            ));
        }
        if self.tracker.feed_limit < 1 {
            warnings.push(format!(
                "tracker.feed_limit = {} must be positive; 1 will be used",
                self.tracker.feed_limit
            ));
        }
        if let Some(ref dir) = self.server.static_dir
            && !dir.join("index.html").exists()
        {
            warnings.push(format!(
                "server.static_dir '{}' has no index.html",
                dir.display()
            ));
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "Invalid logging.level '{}': expected a filter such as 'info' or 'activitypro=debug'",
                self.logging.level
            ));
        }
        if self.server.dev_mode && self.server.host != "127.0.0.1" && self.server.host != "localhost" {
            warnings.push(format!(
                "server.dev_mode enables permissive CORS while listening on {}",
                self.server.host
            ));
        }

        warnings
    }
}

/// Load `.env` from the working directory, if present. Variables already set
/// in the environment win. Returns the file that was loaded.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    match dotenvy::dotenv() {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(e).context("Failed to load .env"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.path, PathBuf::from("data/activitypro.db"));
        assert_eq!(config.auth.session_ttl_hours, 12);
        assert!(config.tracker.auto_pause_on_start);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_fills_defaults() {
        let content = r#"
[server]
port = 9000

[tracker]
auto_pause_on_start = false

[logging]
format = "json"
"#;
        let config = AppConfig::parse(content).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.tracker.auto_pause_on_start);
        assert_eq!(config.tracker.feed_limit, 50);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_rejects_unknown_log_format() {
        let result = AppConfig::parse("[logging]\nformat = \"xml\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = AppConfig::default();
        config.server.port = 4242;
        config.server.static_dir = Some(PathBuf::from("web/dist"));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 4242);
        assert_eq!(loaded.server.static_dir, Some(PathBuf::from("web/dist")));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(vars(&[
                ("ACTIVITYPRO_HOST", "0.0.0.0"),
                ("ACTIVITYPRO_PORT", "3000"),
                ("ACTIVITYPRO_DB_PATH", "/var/lib/activitypro.db"),
                ("ACTIVITYPRO_SESSION_TTL_HOURS", "48"),
                ("ACTIVITYPRO_LOG_FORMAT", "JSON"),
            ]))
            .unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/activitypro.db"));
        assert_eq!(config.auth.session_ttl_hours, 48);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_env_port_is_an_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(vars(&[("ACTIVITYPRO_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("ACTIVITYPRO_PORT"));
    }

    #[test]
    fn test_api_settings_clamps_values() {
        let mut config = AppConfig::default();
        config.auth.session_ttl_hours = 0;
        config.tracker.feed_limit = -5;
        let settings = config.api_settings();
        assert_eq!(settings.session_ttl, chrono::Duration::hours(1));
        assert_eq!(settings.feed_limit, 1);
        assert_eq!(config.validate().len(), 2);
    }

    #[test]
    fn test_session_ttl_capped_at_one_year() {
        let mut config = AppConfig::default();
        config.auth.session_ttl_hours = i64::MAX;
        let settings = config.api_settings();
        assert_eq!(
            settings.session_ttl,
            chrono::Duration::hours(MAX_SESSION_TTL_HOURS)
        );
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("too long"));
    }

    #[test]
    fn test_validate_static_dir_and_level() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.server.static_dir = Some(dir.path().to_path_buf());
        config.logging.level = "activitypro=loud".to_string();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("index.html")));
        assert!(warnings.iter().any(|w| w.contains("logging.level")));

        std::fs::write(dir.path().join("index.html"), "").unwrap();
        config.logging.level = "activitypro=debug".to_string();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
