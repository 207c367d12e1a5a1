//! Configuration management for the booking agent
//!
//! Configuration is loaded from TOML files with environment-variable
//! overrides for credentials and connection strings.
//!
//! # Example Configuration File
//!
//! ```toml
//! [agent]
//! data_dir = "/var/lib/booking-agent"
//!
//! [resy]
//! api_key = "..."
//! auth_token = "..."
//!
//! [mailbox]
//! email = "me@example.com"
//! app_password = "..."
//! poll_interval_seconds = 60
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Agent-wide settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Resy credentials
    #[serde(default)]
    pub resy: ResyConfig,

    /// OpenTable credentials
    #[serde(default)]
    pub opentable: OpenTableConfig,

    /// Mailbox polling configuration
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Reservation contact details
    #[serde(default)]
    pub user: UserConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sniper timing configuration
    #[serde(default)]
    pub sniper: SniperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            resy: ResyConfig::default(),
            opentable: OpenTableConfig::default(),
            mailbox: MailboxConfig::default(),
            user: UserConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            sniper: SniperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Agent-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Data directory for the database and other state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("booking-agent"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Resy credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResyConfig {
    /// Widget API key
    #[serde(default)]
    pub api_key: String,
    /// Session auth token
    #[serde(default)]
    pub auth_token: String,
    /// Payment method id, required by some venues
    #[serde(default)]
    pub payment_method_id: String,
    /// Account email for token refresh
    #[serde(default)]
    pub email: String,
    /// Account password for token refresh
    #[serde(default)]
    pub password: String,
}

/// OpenTable credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenTableConfig {
    /// Account email
    #[serde(default)]
    pub email: String,
    /// Account password
    #[serde(default)]
    pub password: String,
}

/// Mailbox polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Mailbox account email
    #[serde(default)]
    pub email: String,
    /// Mailbox app password
    #[serde(default)]
    pub app_password: String,
    /// Seconds between mailbox polls
    #[serde(default = "default_mailbox_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            app_password: String::new(),
            poll_interval_seconds: default_mailbox_poll_interval(),
        }
    }
}

fn default_mailbox_poll_interval() -> u64 {
    60
}

impl MailboxConfig {
    /// Whether mailbox credentials are configured at all.
    pub fn is_configured(&self) -> bool {
        !self.email.is_empty() && !self.app_password.is_empty()
    }
}

/// Contact details stamped onto reservations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// First name
    #[serde(default)]
    pub first_name: String,
    /// Last name
    #[serde(default)]
    pub last_name: String,
    /// Phone number
    #[serde(default)]
    pub phone: String,
    /// Email address
    #[serde(default)]
    pub email: String,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:booking-agent.db".to_string()
}

/// Sniper timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniperConfig {
    /// Milliseconds between rapid polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SniperConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from the first file present among the standard
    /// locations (working directory, /etc, the user config directory),
    /// falling back to defaults, then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let candidates = [
            Some(PathBuf::from("./booking-agent.toml")),
            Some(PathBuf::from("/etc/booking-agent/booking-agent.toml")),
            dirs::config_dir().map(|d| d.join("booking-agent/booking-agent.toml")),
        ];

        let mut config = match candidates.into_iter().flatten().find(|p| p.exists()) {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<Config>(&content)?
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Config::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve the database URL, making it relative to data_dir if needed
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;

        // Absolute paths and :memory: pass through as-is
        if url.starts_with("sqlite:/") || url == "sqlite::memory:" {
            return url.clone();
        }

        let path = if url.starts_with("sqlite:") {
            url.strip_prefix("sqlite:").unwrap_or(url)
        } else {
            url
        };

        if std::path::Path::new(path).is_absolute() {
            return url.clone();
        }

        let db_path = self.agent.data_dir.join(path);
        format!("sqlite:{}", db_path.display())
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Credential and connection overrides from the environment. Applied
    /// after the TOML load so deployments can keep secrets out of the file.
    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 10] = [
            ("RESY_API_KEY", &mut self.resy.api_key),
            ("RESY_AUTH_TOKEN", &mut self.resy.auth_token),
            ("RESY_PAYMENT_METHOD_ID", &mut self.resy.payment_method_id),
            ("RESY_EMAIL", &mut self.resy.email),
            ("RESY_PASSWORD", &mut self.resy.password),
            ("OPENTABLE_EMAIL", &mut self.opentable.email),
            ("OPENTABLE_PASSWORD", &mut self.opentable.password),
            ("MAILBOX_EMAIL", &mut self.mailbox.email),
            ("MAILBOX_APP_PASSWORD", &mut self.mailbox.app_password),
            ("DATABASE_URL", &mut self.database.url),
        ];
        for (name, target) in overrides {
            if let Ok(value) = std::env::var(name) {
                if !value.is_empty() {
                    *target = value;
                }
            }
        }
        if let Ok(value) = std::env::var("API_BIND_ADDRESS") {
            if !value.is_empty() {
                self.api.bind_address = value;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.sniper.poll_interval_ms == 0 {
            return Err("Sniper poll interval cannot be 0".to_string());
        }

        if self.mailbox.poll_interval_seconds == 0 {
            return Err("Mailbox poll interval cannot be 0".to_string());
        }

        // Half-configured mailbox credentials are a deployment mistake
        if self.mailbox.email.is_empty() != self.mailbox.app_password.is_empty() {
            return Err(
                "Mailbox configuration needs both email and app_password (or neither)".to_string(),
            );
        }

        if self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!(
                "Invalid API bind address: {}",
                self.api.bind_address
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sniper.poll_interval_ms, 500);
        assert_eq!(config.mailbox.poll_interval_seconds, 60);
        assert!(!config.mailbox.is_configured());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.sniper.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mailbox.email = "me@example.com".to_string();
        assert!(config.validate().is_err());
        config.mailbox.app_password = "secret".to_string();
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.api.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_database_url() {
        let mut config = Config::default();
        config.agent.data_dir = PathBuf::from("/var/lib/booking-agent");

        config.database.url = "sqlite::memory:".to_string();
        assert_eq!(config.resolve_database_url(), "sqlite::memory:");

        config.database.url = "sqlite:/tmp/agent.db".to_string();
        assert_eq!(config.resolve_database_url(), "sqlite:/tmp/agent.db");

        config.database.url = "sqlite:agent.db".to_string();
        assert_eq!(
            config.resolve_database_url(),
            "sqlite:/var/lib/booking-agent/agent.db"
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        std::env::set_var("RESY_API_KEY", "key-from-env");
        std::env::set_var("DATABASE_URL", "sqlite::memory:");
        config.apply_env_overrides();
        std::env::remove_var("RESY_API_KEY");
        std::env::remove_var("DATABASE_URL");

        assert_eq!(config.resy.api_key, "key-from-env");
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = r#"
            [resy]
            api_key = "abc"

            [mailbox]
            email = "me@example.com"
            app_password = "secret"
            poll_interval_seconds = 30

            [api]
            bind_address = "0.0.0.0:9000"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.resy.api_key, "abc");
        assert_eq!(config.mailbox.poll_interval_seconds, 30);
        assert_eq!(config.api.bind_address, "0.0.0.0:9000");
        // untouched sections keep their defaults
        assert_eq!(config.sniper.poll_interval_ms, 500);
        assert!(config.validate().is_ok());
    }
}
