//! Configuration view and validation commands: `activitypro config`.

use anyhow::Result;
use std::path::Path;

use activitypro::config::AppConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("ActivityPro Configuration");
            println!("=========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();

            // Effective values, including env overrides
            let config = AppConfig::resolve(config_path)?;
            println!("[server]");
            println!("  host = \"{}\"", config.server.host);
            println!("  port = {}", config.server.port);
            match &config.server.static_dir {
                Some(dir) => println!("  static_dir = \"{}\"", dir.display()),
                None => println!("  static_dir = (none)"),
            }
            println!("  dev_mode = {}", config.server.dev_mode);
            println!();
            println!("[database]");
            println!("  path = \"{}\"", config.database.path.display());
            println!();
            println!("[auth]");
            println!("  session_ttl_hours = {}", config.auth.session_ttl_hours);
            println!();
            println!("[tracker]");
            println!(
                "  auto_pause_on_start = {}",
                config.tracker.auto_pause_on_start
            );
            println!("  feed_limit = {}", config.tracker.feed_limit);
            println!();
            println!("[logging]");
            println!("  level = \"{}\"", config.logging.level);
            println!("  format = \"{}\"", config.logging.format);
            if let Some(dir) = &config.logging.dir {
                println!("  dir = \"{}\"", dir.display());
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let config = AppConfig::load(config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("Config file already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            AppConfig::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, static_dir");
            println!("  - [database] path");
            println!("  - [tracker] auto_pause_on_start, feed_limit");
            println!();
        }
    }

    Ok(())
}
