//! Audio Module - Geräteauswahl und Lautstärke
//!
//! Dieses Modul verwaltet:
//! - Verfügbare Audio-Ausgänge (Hörmuschel, Lautsprecher, Headset, Bluetooth)
//! - Routing auf das gewählte Gerät
//! - Lautstärke und Mute während eines Anrufs
//!
//! Die eigentliche Plattform-Anbindung steckt hinter [`AudioPlatform`].

mod platform;
mod route;

pub use platform::{AudioPlatform, CpalAudioPlatform, DEVICE_POLL_INTERVAL};
pub(crate) use platform::select_best_config;
pub use route::{AudioFocus, AudioRouteManager};

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Audio device not available: {0:?}")]
    DeviceUnavailable(AudioDevice),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Audio platform error: {0}")]
    Platform(String),
}

// ============================================================================
// DEVICES & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AudioDevice {
    Earpiece,
    Speaker,
    WiredHeadset,
    Bluetooth,
}

impl AudioDevice {
    /// Immer vorhanden, unabhängig vom Zubehör
    pub const BUILT_IN: [AudioDevice; 2] = [AudioDevice::Earpiece, AudioDevice::Speaker];

    pub fn is_accessory(&self) -> bool {
        matches!(self, AudioDevice::WiredHeadset | AudioDevice::Bluetooth)
    }
}

/// Änderungen, die der [`AudioRouteManager`] an Listener meldet
#[derive(Debug, Clone, PartialEq)]
pub enum AudioRouteEvent {
    DevicesChanged(Vec<AudioDevice>),
    CurrentDeviceChanged(AudioDevice),
    VolumeChanged(f32),
    MuteChanged(bool),
}
