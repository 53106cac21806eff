//! Configuration management for the triage engine

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to data directory (database, media files)
    pub data_dir: PathBuf,

    /// Path to stored media attachments; defaults to `<data_dir>/media`
    pub media_dir: Option<PathBuf>,

    /// Protocol bridge connection
    pub bridge: BridgeConfig,

    /// Session supervision tuning
    pub session: SessionConfig,

    /// Routing and chatbot tuning
    pub routing: RoutingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            media_dir: None,
            bridge: BridgeConfig::default(),
            session: SessionConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

/// Protocol bridge connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge base URL
    pub base_url: String,

    /// Bearer token for the bridge API
    pub api_token: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8266".to_string(),
            api_token: None,
        }
    }
}

/// Session supervision settings
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed backoff before restarting a dropped session, in seconds
    pub reconnect_delay_secs: u64,

    /// Consecutive pairing codes allowed before the session goes terminal
    pub pairing_code_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 2,
            pairing_code_limit: 3,
        }
    }
}

/// Routing and chatbot settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Debounce window for automated menu and out-of-hours sends, in
    /// milliseconds
    pub debounce_ms: u64,

    /// Maximum entry count rendered as native buttons before falling back
    /// to a text menu
    pub button_menu_ceiling: usize,

    /// Command prefix forwarded to the auto-responder seam
    pub assist_prefix: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3000,
            button_menu_ceiling: 4,
            assist_prefix: "/assist".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: the given file (or the default location when it
    /// exists), then environment overrides
    ///
    /// # Errors
    ///
    /// Returns error when an explicit config file is missing or invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&raw)?
            }
            None => {
                let default_path = default_config_path();
                if default_path.is_file() {
                    let raw = std::fs::read_to_string(&default_path)?;
                    toml::from_str(&raw)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env();
        Ok(config)
    }

    /// Resolved media directory
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("TRIAGE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("TRIAGE_BRIDGE_URL") {
            self.bridge.base_url = url;
        }
        if let Ok(token) = std::env::var("TRIAGE_BRIDGE_TOKEN") {
            self.bridge.api_token = Some(token);
        }
    }
}

/// Default config file location, `~/.config/triage/config.toml` on Linux
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "triage", "triage").map_or_else(
        || PathBuf::from("triage.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default data directory, `~/.local/share/triage` on Linux
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "triage", "triage").map_or_else(
        || PathBuf::from(".triage"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.session.reconnect_delay_secs, 2);
        assert_eq!(config.session.pairing_code_limit, 3);
        assert_eq!(config.routing.debounce_ms, 3000);
        assert_eq!(config.routing.button_menu_ceiling, 4);
        assert!(config.media_dir().ends_with("media"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [bridge]
            base_url = "http://bridge.internal:9000"

            [routing]
            debounce_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.bridge.base_url, "http://bridge.internal:9000");
        assert_eq!(config.routing.debounce_ms, 1500);
        assert_eq!(config.routing.button_menu_ceiling, 4);
        assert_eq!(config.session.pairing_code_limit, 3);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/triage.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
