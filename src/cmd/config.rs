//! Configuration view and validation commands (`fireside config`).

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(
    config_path: &Path,
    db_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    use fireside::config::PortalConfig;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Fireside Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();

            let mut config = PortalConfig::resolve(config_path)?;
            if let Some(path) = db_path {
                config.database.path = path.to_path_buf();
            }

            println!("[server]");
            println!("  host = \"{}\"", config.server.host);
            println!("  port = {}", config.server.port);
            println!("  dev_mode = {}", config.server.dev_mode);
            println!();
            println!("[database]");
            println!("  path = \"{}\"", config.database.path.display());
            println!();
            println!("[auth]");
            println!("  site_url = \"{}\"", config.auth.site_url);
            println!("  session_ttl_hours = {}", config.auth.session_ttl_hours);
            println!(
                "  magic_link_ttl_minutes = {}",
                config.auth.magic_link_ttl_minutes
            );
            println!();
            println!("[mail]");
            println!("  mode = \"{}\"", config.mail.mode);
            if let Some(url) = &config.mail.webhook_url {
                println!("  webhook_url = \"{}\"", url);
            }
            println!("  from = \"{}\"", config.mail.from);
            println!();
            println!("[logging]");
            println!("  filter = \"{}\"", config.logging.filter);
            println!("  format = \"{}\"", config.logging.format);
            if let Some(dir) = &config.logging.directory {
                println!("  directory = \"{}\"", dir.display());
            }
            println!();

            if !config_path.exists() {
                println!("Run 'fireside config init' to create {}.", config_path.display());
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", config_path.display());
                return Ok(());
            }

            let config = PortalConfig::load(config_path)?;
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
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to regenerate it.");
                return Ok(());
            }

            PortalConfig::default().save(config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
