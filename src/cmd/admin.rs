//! Database bootstrap commands (`fireside init-db`, `fireside grant-admin`).

use anyhow::{Context, Result};
use tracing::info;

use fireside::config::PortalConfig;
use fireside::portal::db::PortalDb;
use fireside::portal::models::UserRole;

pub fn cmd_init_db(config: &PortalConfig) -> Result<()> {
    PortalDb::new(&config.database.path)?;
    println!("Database initialized at {}", config.database.path.display());
    Ok(())
}

/// Bootstraps the first administrator; later admins can be granted the same way.
pub fn cmd_grant_admin(config: &PortalConfig, email: &str, name: Option<&str>) -> Result<()> {
    let db = PortalDb::new(&config.database.path)?;
    let profile = db.upsert_profile(email, name, UserRole::Admin)?;
    db.grant_admin(&profile.id)
        .with_context(|| format!("Failed to grant admin to {}", email))?;
    info!(user_id = %profile.id, "Administrator granted");

    println!(
        "Granted admin to {} ({})",
        profile.email.as_deref().unwrap_or(email),
        profile.id
    );
    Ok(())
}
