use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use fireside::config::{DEFAULT_CONFIG_FILE, PortalConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "fireside")]
#[command(version, about = "Fireside Reviews - performance review cycles, calibration and release")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// SQLite database path. Overrides fireside.toml and FIRESIDE_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS for a local front-end)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and apply migrations
    InitDb,
    /// Make a user an administrator, creating the profile if needed
    GrantAdmin {
        /// Email address of the user
        #[arg(long)]
        email: String,

        /// Full name for a newly created profile
        #[arg(long)]
        name: Option<String>,
    },
    /// View or validate configuration
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
    /// Write a default fireside.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&cli.config, cli.db_path.as_deref(), command.clone());
    }

    let mut config = PortalConfig::resolve(&cli.config)?;
    if let Some(path) = &cli.db_path {
        config.database.path = path.clone();
    }
    let _log_guard = fireside::logging::init(&config.logging)?;

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, *port, host.clone(), *dev).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::GrantAdmin { email, name } => {
            cmd::cmd_grant_admin(&config, email, name.as_deref())?
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
