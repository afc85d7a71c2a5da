//! Konfiguration
//!
//! Lädt `call.json` aus dem Konfigurationsverzeichnis der App, falls vorhanden.
//! Fehlende Felder fallen auf sinnvolle Defaults zurück.
//!
//! Pfade (über `directories`):
//! - Windows: `%APPDATA%/pulse/call/config/call.json`
//! - macOS: `~/Library/Application Support/app.pulse.call/call.json`
//! - Linux: `~/.config/call/call.json`

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::quality::QualityThresholds;

/// Umgebungsvariable, die die Signaling-URL überschreibt
pub const SIGNALING_URL_ENV: &str = "PULSE_SIGNALING_URL";

const DEFAULT_SIGNALING_URL: &str = "https://signaling.pulse.app";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server (Google, kostenlos)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Basis-URL des Signaling-Servers (http/https wird zu ws/wss)
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    /// Intervall für WebSocket Pings
    pub heartbeat_interval_secs: u64,
    /// Maximale Dauer im Zustand `Connecting`; `null` deaktiviert den Timeout
    pub connect_timeout_secs: Option<u64>,
    /// Mindestabstand zwischen zwei Qualitätswarnungen
    pub warning_interval_ms: u64,
    pub quality: QualityThresholds,
    /// Zielverzeichnis für Aufnahmen
    pub recordings_dir: PathBuf,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            heartbeat_interval_secs: 25,
            connect_timeout_secs: Some(45),
            warning_interval_ms: 10_000,
            quality: QualityThresholds::default(),
            recordings_dir: default_recordings_dir(),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus `call.json` oder nimmt die Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading call config from {:?}", path);
                let raw = std::fs::read_to_string(&path)?;
                Self::from_json(&raw)?
            }
            _ => {
                tracing::debug!("No call config file found, using defaults");
                Self::default()
            }
        };

        if let Ok(url) = std::env::var(SIGNALING_URL_ENV) {
            tracing::info!("Signaling URL overridden by {}", SIGNALING_URL_ENV);
            config.signaling_url = url;
        }

        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn warning_interval(&self) -> Duration {
        Duration::from_millis(self.warning_interval_ms)
    }

    fn config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("call.json"))
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("app", "pulse", "call")
}

fn default_recordings_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("recordings"))
        .unwrap_or_else(|| std::env::temp_dir().join("pulse-recordings"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CallConfig::from_json(
            r#"{ "signaling_url": "http://localhost:8787", "connect_timeout_secs": null }"#,
        )
        .unwrap();

        assert_eq!(config.signaling_url, "http://localhost:8787");
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.warning_interval(), Duration::from_secs(10));
        assert_eq!(config.ice_servers, default_ice_servers());
    }
}
