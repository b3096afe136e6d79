//! Configuration for the Fireside portal, read from `fireside.toml`.
//!
//! Layering, lowest to highest precedence:
//! file → `.env` / `FIRESIDE_*` environment variables → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3150
//! dev_mode = false
//!
//! [database]
//! path = ".fireside/fireside.db"
//!
//! [auth]
//! site_url = "http://localhost:3150"
//! session_ttl_hours = 336
//! magic_link_ttl_minutes = 15
//!
//! [mail]
//! mode = "log"            # or "webhook"
//! webhook_url = "https://mailer.internal/send"
//!
//! [logging]
//! filter = "fireside=info,tower_http=info"
//! format = "pretty"       # or "json"
//! directory = ".fireside/logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "fireside.toml";

/// One year.
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;
/// One day.
pub const MAX_MAGIC_LINK_TTL_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for a locally served front-end.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
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
    PathBuf::from(".fireside/fireside.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    /// Public origin used to build sign-in links.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    #[serde(default = "default_magic_link_ttl_minutes")]
    pub magic_link_ttl_minutes: i64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            site_url: default_site_url(),
            session_ttl_hours: default_session_ttl_hours(),
            magic_link_ttl_minutes: default_magic_link_ttl_minutes(),
        }
    }
}

fn default_site_url() -> String {
    "http://localhost:3150".to_string()
}

fn default_session_ttl_hours() -> i64 {
    24 * 14
}

fn default_magic_link_ttl_minutes() -> i64 {
    15
}

/// How outgoing sign-in and invite emails are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailMode {
    /// Write the message to the log (development).
    #[default]
    Log,
    /// POST the message as JSON to `webhook_url`.
    Webhook,
}

impl std::str::FromStr for MailMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "log" => Ok(MailMode::Log),
            "webhook" => Ok(MailMode::Webhook),
            _ => anyhow::bail!("Invalid mail mode '{}'. Valid values: log, webhook", s),
        }
    }
}

impl std::fmt::Display for MailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailMode::Log => write!(f, "log"),
            MailMode::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSection {
    #[serde(default)]
    pub mode: MailMode,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_mail_from")]
    pub from: String,
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            mode: MailMode::default(),
            webhook_url: None,
            from: default_mail_from(),
        }
    }
}

fn default_mail_from() -> String {
    "Fireside Reviews <no-reply@fireside.local>".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file here.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

fn default_log_filter() -> String {
    "fireside=info,tower_http=info".to_string()
}

/// Root of `fireside.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub mail: MailSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl PortalConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fireside.toml")
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load the file, then apply `.env` and `FIRESIDE_*` overrides.
    pub fn resolve(path: &Path) -> Result<Self> {
        // A missing .env is normal outside development.
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize fireside.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("FIRESIDE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("FIRESIDE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid FIRESIDE_PORT '{}'", port))?;
        }
        if let Some(dev) = lookup("FIRESIDE_DEV_MODE") {
            self.server.dev_mode = dev == "1" || dev.eq_ignore_ascii_case("true");
        }
        if let Some(path) = lookup("FIRESIDE_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("FIRESIDE_SITE_URL") {
            self.auth.site_url = url;
        }
        if let Some(mode) = lookup("FIRESIDE_MAIL_MODE") {
            self.mail.mode = mode.parse()?;
        }
        if let Some(url) = lookup("FIRESIDE_MAIL_WEBHOOK_URL") {
            self.mail.webhook_url = Some(url);
        }
        if let Some(format) = lookup("FIRESIDE_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(dir) = lookup("FIRESIDE_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.auth.session_ttl_hours <= 0 {
            warnings.push(format!(
                "session_ttl_hours must be positive (got {})",
                self.auth.session_ttl_hours
            ));
        }
        if self.auth.magic_link_ttl_minutes <= 0 {
            warnings.push(format!(
                "magic_link_ttl_minutes must be positive (got {})",
                self.auth.magic_link_ttl_minutes
            ));
        }
        if self.auth.session_ttl_hours > MAX_SESSION_TTL_HOURS {
            warnings.push(format!(
                "session_ttl_hours must be at most {} (got {})",
                MAX_SESSION_TTL_HOURS, self.auth.session_ttl_hours
            ));
        }
        if self.auth.magic_link_ttl_minutes > MAX_MAGIC_LINK_TTL_MINUTES {
            warnings.push(format!(
                "magic_link_ttl_minutes must be at most {} (got {})",
                MAX_MAGIC_LINK_TTL_MINUTES, self.auth.magic_link_ttl_minutes
            ));
        }
        if !self.auth.site_url.starts_with("http://") && !self.auth.site_url.starts_with("https://")
        {
            warnings.push(format!(
                "site_url '{}' should start with http:// or https://",
                self.auth.site_url
            ));
        }
        if self.mail.mode == MailMode::Webhook && self.mail.webhook_url.is_none() {
            warnings.push("mail mode is 'webhook' but webhook_url is not set".to_string());
        }
        if self.server.dev_mode && self.server.host != "127.0.0.1" {
            warnings.push(format!(
                "dev_mode enables permissive CORS while listening on {}",
                self.server.host
            ));
        }

        warnings
    }
}
