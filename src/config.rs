//! Configuration management for the sluice CLI.
//!
//! Handles loading and saving `config.toml` in the platform config
//! directory (`~/.config/sluice/` on Linux).

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::RelayConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub relay: RelaySettings,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub server: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    pub metadata: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

impl SessionSettings {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    pub listen: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
    pub public_host: Option<String>,
    pub bind_host: Option<String>,
}

impl RelaySettings {
    /// Fill a [`RelayConfig`] from the file, keeping defaults for gaps
    pub fn to_relay_config(&self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            listen: self.listen.clone().unwrap_or(defaults.listen),
            tokens: self.tokens.clone(),
            public_host: self.public_host.clone(),
            bind_host: self.bind_host.clone().unwrap_or(defaults.bind_host),
            ..defaults
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "sluice").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();

        assert!(config.auth.token.is_none());
        assert!(config.relay.tokens.is_empty());
    }

    #[test]
    fn test_parse_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[auth]
token = "tok_123"
server = "relay.example.com"

[session]
metadata = "laptop"
heartbeat_interval_secs = 5

[relay]
listen = "0.0.0.0:7000"
tokens = ["a", "b"]
public_host = "relay.example.com"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.auth.token.as_deref(), Some("tok_123"));
        assert_eq!(config.session.metadata.as_deref(), Some("laptop"));
        assert_eq!(
            config.session.heartbeat_interval(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.session.connect_timeout(), None);

        let relay = config.relay.to_relay_config();
        assert_eq!(relay.listen, "0.0.0.0:7000");
        assert_eq!(relay.tokens, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(relay.bind_host, "127.0.0.1");
        assert_eq!(relay.public_host.as_deref(), Some("relay.example.com"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.auth.token = Some("tok_saved".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.auth.token.as_deref(), Some("tok_saved"));
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[auth\ntoken = ").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }
}
