use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MonitorError;

/// Environment variable naming the optional TOML configuration file.
pub const CONFIG_PATH_VAR: &str = "VOTE_GUARD_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub monitor: MonitorConfig,
    pub watcher: WatcherConfig,
    pub mail: MailConfig,
}

/// Snapshot auditor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub state_file: PathBuf,
    /// Alerts are also written here as `<timestamp>-<id>/alert.txt` when set.
    pub alerts_dir: Option<PathBuf>,
    /// Glob for the store's raw change log files; the newest match is hashed each cycle.
    pub log_glob: Option<String>,
}

/// Change-stream watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub subscriber_id: String,
    pub table: String,
    pub poll_interval_ms: u64,
    pub reconnect_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Mail API endpoint used as the primary transport.
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub from_address: Option<String>,
    pub smtp: SmtpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://voting.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            monitor: MonitorConfig::default(),
            watcher: WatcherConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 20,
            state_file: PathBuf::from("detector_state.json"),
            alerts_dir: None,
            log_glob: None,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            subscriber_id: "vote-guard-9999".to_string(),
            table: "votes".to_string(),
            poll_interval_ms: 1000,
            reconnect_backoff_secs: 5,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            from_address: None,
            smtp: SmtpConfig::default(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            use_tls: true,
            username: None,
            password: None,
        }
    }
}

impl AppConfig {
    /// Load defaults, then the optional TOML file, then `VOTE_GUARD__*` overrides.
    pub fn load() -> Result<Self, MonitorError> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "vote-guard.toml".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("VOTE_GUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.database_url.trim().is_empty() {
            return Err(MonitorError::ConfigError("database_url is empty".to_string()));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(MonitorError::ConfigError(
                "monitor.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.watcher.subscriber_id.trim().is_empty() {
            return Err(MonitorError::ConfigError(
                "watcher.subscriber_id must be a stable, non-empty identity".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

impl MailConfig {
    /// Sender address, falling back to the SMTP login.
    pub fn sender(&self) -> Option<String> {
        self.from_address
            .clone()
            .or_else(|| self.smtp.username.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(20));
        assert_eq!(config.watcher.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.bind_address(), "0.0.0.0:3000");
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = AppConfig::default();
        config.monitor.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(MonitorError::ConfigError(_))));
    }

    #[test]
    fn test_sender_falls_back_to_smtp_user() {
        let mut mail = MailConfig::default();
        assert_eq!(mail.sender(), None);

        mail.smtp.username = Some("monitor@example.org".to_string());
        assert_eq!(mail.sender().as_deref(), Some("monitor@example.org"));

        mail.from_address = Some("security@example.org".to_string());
        assert_eq!(mail.sender().as_deref(), Some("security@example.org"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(
                "[monitor]\npoll_interval_secs = 7\n[mail.smtp]\nport = 2525\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = settings.try_deserialize().unwrap();

        assert_eq!(config.monitor.poll_interval_secs, 7);
        assert_eq!(config.mail.smtp.port, 2525);
        assert_eq!(config.mail.smtp.host, "smtp.gmail.com");
        assert_eq!(config.watcher.table, "votes");
    }
}
