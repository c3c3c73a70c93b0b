use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use activitypro::config::{AppConfig, CONFIG_FILE};

mod cmd;

#[derive(Parser)]
#[command(name = "activitypro")]
#[command(version, about = "Activity, time and team-productivity tracking server")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE, env = "ACTIVITYPRO_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP + WebSocket server
    Serve {
        /// Address to listen on (overrides [server] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides [server] port)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database file (overrides [database] path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Directory with the built SPA to serve at `/`
        #[arg(long)]
        static_dir: Option<PathBuf>,

        /// Development mode: permissive CORS
        #[arg(long)]
        dev: bool,

        /// Open the browser once the server is up
        #[arg(long)]
        open: bool,
    },
    /// Create the database and its schema without starting the server
    InitDb {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create a user account
    CreateUser {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,

        /// At least 8 characters
        #[arg(long, env = "ACTIVITYPRO_PASSWORD", hide_env_values = true)]
        password: String,

        /// admin, manager or member
        #[arg(long, default_value = "member")]
        role: String,

        /// Sector name; created if it does not exist
        #[arg(long)]
        sector: Option<String>,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show, initialize or validate the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default activitypro.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dotenv = activitypro::config::load_dotenv()?;
    let mut config = AppConfig::resolve(&cli.config)?;
    let _guard = activitypro::logging::init_logging(&config.logging, cli.verbose)?;
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }

    match &cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            static_dir,
            dev,
            open,
        } => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            if let Some(path) = db_path {
                config.database.path = path.clone();
            }
            if let Some(dir) = static_dir {
                config.server.static_dir = Some(dir.clone());
            }
            config.server.dev_mode |= *dev;
            cmd::cmd_serve(&config, *open).await?;
        }
        Commands::InitDb { db_path } => {
            let path = db_path.clone().unwrap_or(config.database.path);
            cmd::cmd_init_db(&path)?;
        }
        Commands::CreateUser {
            email,
            name,
            password,
            role,
            sector,
            db_path,
        } => {
            let path = db_path.clone().unwrap_or(config.database.path);
            cmd::cmd_create_user(
                &path,
                cmd::NewAccount {
                    email,
                    name,
                    password,
                    role,
                    sector: sector.as_deref(),
                },
            )?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
