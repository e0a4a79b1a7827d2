//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    /// Write notifications and emails to the workspace outbox tables.
    Outbox,
    /// Log dispatches only.
    Off,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Tracing filter directive.
    pub log_filter: String,
    /// Workspace opened at startup, if any.
    pub workspace: Option<PathBuf>,
    pub busy_timeout: Duration,
    pub notifications: NotificationMode,
    /// Prefix for links in notifications and emails.
    pub public_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: "coursed=info".to_string(),
            workspace: None,
            busy_timeout: Duration::from_millis(5000),
            notifications: NotificationMode::Outbox,
            public_base_url: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `COURSED_LOG`: tracing filter (default: `coursed=info`)
    /// - `COURSED_WORKSPACE`: workspace directory opened at startup
    /// - `COURSED_BUSY_TIMEOUT_MS`: SQLite busy timeout (default: 5000)
    /// - `COURSED_NOTIFICATIONS`: `outbox` or `off` (default: `outbox`)
    /// - `COURSED_PUBLIC_BASE_URL`: link prefix (default: empty)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let log_filter = lookup("COURSED_LOG")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.log_filter);

        let workspace = lookup("COURSED_WORKSPACE")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let busy_timeout = match lookup("COURSED_BUSY_TIMEOUT_MS") {
            Some(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|_| {
                    ConfigError::Invalid("COURSED_BUSY_TIMEOUT_MS", "must be a non-negative integer")
                })?;
                Duration::from_millis(ms)
            }
            None => defaults.busy_timeout,
        };

        let notifications = match lookup("COURSED_NOTIFICATIONS")
            .map(|v| v.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("outbox") => NotificationMode::Outbox,
            Some("off") => NotificationMode::Off,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "COURSED_NOTIFICATIONS",
                    "must be one of: outbox, off",
                ))
            }
        };

        let public_base_url = lookup("COURSED_PUBLIC_BASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_default();

        Ok(Self {
            log_filter,
            workspace,
            busy_timeout,
            notifications,
            public_base_url,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = load(&[]).expect("config");
        assert_eq!(cfg.log_filter, "coursed=info");
        assert!(cfg.workspace.is_none());
        assert_eq!(cfg.busy_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.notifications, NotificationMode::Outbox);
        assert_eq!(cfg.public_base_url, "");
    }

    #[test]
    fn reads_overrides() {
        let cfg = load(&[
            ("COURSED_LOG", "coursed=debug"),
            ("COURSED_WORKSPACE", "/tmp/ws"),
            ("COURSED_BUSY_TIMEOUT_MS", "250"),
            ("COURSED_NOTIFICATIONS", "OFF"),
            ("COURSED_PUBLIC_BASE_URL", "https://school.example/"),
        ])
        .expect("config");
        assert_eq!(cfg.log_filter, "coursed=debug");
        assert_eq!(cfg.workspace, Some(PathBuf::from("/tmp/ws")));
        assert_eq!(cfg.busy_timeout, Duration::from_millis(250));
        assert_eq!(cfg.notifications, NotificationMode::Off);
        assert_eq!(cfg.public_base_url, "https://school.example");
    }

    #[test]
    fn rejects_bad_values() {
        assert!(load(&[("COURSED_BUSY_TIMEOUT_MS", "soon")]).is_err());
        assert!(load(&[("COURSED_NOTIFICATIONS", "pager")]).is_err());
    }
}
