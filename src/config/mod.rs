//! Configuration management for the sync client
//!
//! Settings come from an optional TOML file, then environment overrides.
//! Every field has a default, so an empty file is a valid configuration.

use crate::client::normalize_address;
use crate::error::{Result, SyncError};
use crate::state::Increments;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{env, time::Duration};

/// Placeholder replaced with the active extruder in filament macros
pub const EXTRUDER_PLACEHOLDER: &str = "{extruder}";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerSettings,
    pub increments: Increments,
    pub macros: MacroSettings,
    pub logging: LoggingSettings,
    pub power: PowerSettings,
}

/// Moonraker endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host, host:port or full URL of the server
    pub url: String,

    /// Deadline for each request; `0s` waits forever
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:7125".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A labelled G-code snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    pub label: String,
    pub gcode: String,
}

/// Command templates supplied by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroSettings {
    pub load_filament: String,
    pub unload_filament: String,
    pub panel: Vec<Macro>,
}

impl Default for MacroSettings {
    fn default() -> Self {
        Self {
            load_filament: format!("LOAD_FILAMENT EXTRUDER={EXTRUDER_PLACEHOLDER}"),
            unload_filament: format!("UNLOAD_FILAMENT EXTRUDER={EXTRUDER_PLACEHOLDER}"),
            panel: vec![
                Macro {
                    label: "FIRMWARE RESTART".to_string(),
                    gcode: "FIRMWARE_RESTART".to_string(),
                },
                Macro {
                    label: "PID EXTRUDER".to_string(),
                    gcode: "PID_CALIBRATE HEATER=extruder TARGET=210".to_string(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
    pub stderr: bool,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            stderr: true,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    /// Device switched by power commands; the "printer" device or the
    /// first listed one when unset
    pub device: Option<String>,
}

impl SyncConfig {
    /// `<config dir>/moonraker-sync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("moonraker-sync").join("config.toml"))
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| SyncError::config(format!("Invalid configuration: {e}")))
    }

    /// Read a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load the given file (or the default path when it exists), apply
    /// environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => Self::from_file(&default)?,
                None => Self::default(),
            },
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `MOONRAKER_URL` and `MOONRAKER_REQUEST_TIMEOUT`
    /// (seconds, 0 waits forever)
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("MOONRAKER_URL") {
            self.server.url = url;
        }

        if let Ok(timeout) = env::var("MOONRAKER_REQUEST_TIMEOUT") {
            self.server.request_timeout = Duration::from_secs(timeout.trim().parse().map_err(
                |e| SyncError::config(format!("Invalid MOONRAKER_REQUEST_TIMEOUT: {e}")),
            )?);
        }

        if let Ok(level) = env::var("RUST_LOG") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        normalize_address(&self.server.url)
            .map_err(|e| SyncError::config(format!("Invalid server url: {e}")))?;

        let increments = &self.increments;
        for (name, value) in [
            ("jog_distance", increments.jog_distance),
            ("jog_feedrate", increments.jog_feedrate),
            ("extrude_amount", increments.extrude_amount),
            ("extrude_feedrate", increments.extrude_feedrate),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SyncError::config(format!(
                    "increments.{name} must be positive, got {value}"
                )));
            }
        }

        Ok(())
    }

    /// Request deadline for the client, `None` when disabled
    pub fn request_timeout(&self) -> Option<Duration> {
        Some(self.server.request_timeout).filter(|t| !t.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.increments.jog_feedrate, 3000.0);
    }

    #[test]
    fn test_partial_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            [server]
            url = "http://voron.local:7125"
            request_timeout = "0s"

            [increments]
            jog_distance = 1.0
            jog_feedrate = 6000.0
            extrude_amount = 5.0
            extrude_feedrate = 120.0
            "#,
        )
        .unwrap();

        assert_eq!(config.server.url, "http://voron.local:7125");
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.increments.jog_distance, 1.0);
        assert_eq!(config.macros, MacroSettings::default());
    }

    #[test]
    fn test_retired_server_keys_are_ignored() {
        let config = SyncConfig::from_toml_str(
            r#"
            [server]
            url = "voron.local"
            auto_connect = true
            "#,
        )
        .unwrap();

        assert_eq!(
            config.server,
            ServerSettings {
                url: "voron.local".into(),
                ..ServerSettings::default()
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = SyncConfig::default();
        config.increments.jog_distance = 0.0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::default();
        config.server.url = "ftp://printer".into();
        assert!(config.validate().is_err());

        assert!(SyncConfig::from_toml_str("[server]\nrequest_timeout = \"soon\"").is_err());
    }
}
