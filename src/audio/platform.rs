//! Plattform-Anbindung für Audio-Routing
//!
//! Desktop-Hosts kennen keine Hörmuschel; dort landen `Earpiece` und
//! `Speaker` beide auf dem Standard-Ausgang. Zubehör wird anhand der
//! Gerätenamen erkannt, die cpal liefert. Die Lautstärke der Wiedergabe
//! gehört der Media Engine, cpal bietet keinen Mixer pro Stream.

use super::{AudioDevice, AudioError};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Abfrageintervall des Geräte-Watchers
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Fähigkeiten des Betriebssystems, die das Routing braucht
///
/// Alle Methoden außer `detect_accessories` werden vom Session-Actor
/// aufgerufen und dürfen nicht blockieren.
pub trait AudioPlatform: Send + Sync {
    /// Aktuell angeschlossenes Zubehör (Headset, Bluetooth), darf blockieren
    fn detect_accessories(&self) -> Result<Vec<AudioDevice>, AudioError>;

    fn route_to(&self, device: AudioDevice) -> Result<(), AudioError>;

    /// Lautstärke des Anruf-Streams, 0.0 - 1.0
    fn set_volume(&self, volume: f32) -> Result<(), AudioError>;

    fn set_microphone_muted(&self, muted: bool) -> Result<(), AudioError>;

    /// Audio-Fokus / Kommunikationsmodus für die Dauer eines Anrufs
    fn acquire(&self) -> Result<(), AudioError>;

    fn release(&self);

    /// Meldet, dass sich die angeschlossenen Geräte geändert haben
    fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

// ============================================================================
// CPAL PLATFORM
// ============================================================================

pub struct CpalAudioPlatform {
    /// Wird vom Capture-Callback der Aufnahme gelesen
    mic_muted: Arc<Mutex<bool>>,
    /// Letzte bekannte Ausgangsgeräte, vom Watcher aktualisiert
    output_devices: Mutex<Vec<String>>,
    changes_tx: broadcast::Sender<()>,
}

impl CpalAudioPlatform {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(8);
        Self {
            mic_muted: Arc::new(Mutex::new(false)),
            output_devices: Mutex::new(Vec::new()),
            changes_tx,
        }
    }

    /// Mute-Flag des Mikrofons, geteilt mit der Aufnahme
    pub fn microphone_mute_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.mic_muted)
    }

    /// Ordnet einen cpal-Gerätenamen einer Geräteklasse zu
    pub fn classify(name: &str) -> Option<AudioDevice> {
        let name = name.to_lowercase();
        if ["bluetooth", "airpods", "buds", "a2dp", "hands-free"]
            .iter()
            .any(|k| name.contains(k))
        {
            Some(AudioDevice::Bluetooth)
        } else if ["headset", "headphone", "earphone"]
            .iter()
            .any(|k| name.contains(k))
        {
            Some(AudioDevice::WiredHeadset)
        } else {
            None
        }
    }

    /// Startet einen Task, der die Ausgangsgeräte periodisch abfragt
    ///
    /// Die Abfrage läuft im Blocking-Pool; der Task endet mit der Plattform.
    pub fn start_device_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let platform: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(current) = platform.upgrade() else {
                    break;
                };
                let names = match tokio::task::spawn_blocking(Self::enumerate_outputs).await {
                    Ok(Ok(names)) => names,
                    Ok(Err(e)) => {
                        tracing::debug!("Audio device poll failed: {}", e);
                        continue;
                    }
                    Err(_) => break,
                };
                if current.update_devices(names) {
                    tracing::debug!("Audio output devices changed");
                    let _ = current.changes_tx.send(());
                }
            }
        })
    }

    fn enumerate_outputs() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Platform(e.to_string()))?;

        let mut names: Vec<String> = devices.filter_map(|device| device.name().ok()).collect();
        names.sort();
        Ok(names)
    }

    /// Übernimmt eine neue Geräteliste; `true` bei Änderung
    fn update_devices(&self, names: Vec<String>) -> bool {
        let mut known = self.output_devices.lock();
        if *known == names {
            return false;
        }
        *known = names;
        true
    }
}

impl Default for CpalAudioPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlatform for CpalAudioPlatform {
    fn detect_accessories(&self) -> Result<Vec<AudioDevice>, AudioError> {
        let names = Self::enumerate_outputs()?;
        let mut accessories: Vec<AudioDevice> =
            names.iter().filter_map(|name| Self::classify(name)).collect();
        accessories.sort();
        accessories.dedup();
        self.update_devices(names);
        Ok(accessories)
    }

    fn route_to(&self, device: AudioDevice) -> Result<(), AudioError> {
        let output = if device.is_accessory() {
            let name = self
                .output_devices
                .lock()
                .iter()
                .find(|name| Self::classify(name) == Some(device))
                .cloned()
                .ok_or(AudioError::DeviceUnavailable(device))?;
            Some(name)
        } else {
            None
        };

        tracing::info!("Routing call audio to {:?} ({:?})", device, output);
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        tracing::debug!("Call volume: {:.2}", volume);
        Ok(())
    }

    fn set_microphone_muted(&self, muted: bool) -> Result<(), AudioError> {
        *self.mic_muted.lock() = muted;
        tracing::debug!("Microphone muted: {}", muted);
        Ok(())
    }

    fn acquire(&self) -> Result<(), AudioError> {
        Ok(())
    }

    fn release(&self) {
        *self.mic_muted.lock() = false;
    }

    fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes_tx.subscribe())
    }
}

// ============================================================================
// STREAM CONFIG
// ============================================================================

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: exakte Ziel-Samplerate > höchste Rate, F32 > I16 > andere.
pub(crate) fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Result<(StreamConfig, SampleFormat), AudioError> {
    let target_rate = cpal::SampleRate(target_rate);

    let supports_target = |c: &SupportedStreamConfigRange| {
        c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
    };

    for format in [SampleFormat::F32, SampleFormat::I16] {
        if let Some(config) = configs
            .iter()
            .find(|c| c.sample_format() == format && supports_target(c))
        {
            return Ok((config.with_sample_rate(target_rate).into(), format));
        }
    }

    for format in [SampleFormat::F32, SampleFormat::I16] {
        if let Some(config) = configs.iter().find(|c| c.sample_format() == format) {
            return Ok((config.with_max_sample_rate().into(), format));
        }
    }

    Err(AudioError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_accessories_by_name() {
        assert_eq!(
            CpalAudioPlatform::classify("AirPods Pro"),
            Some(AudioDevice::Bluetooth)
        );
        assert_eq!(
            CpalAudioPlatform::classify("USB Headset Analog Stereo"),
            Some(AudioDevice::WiredHeadset)
        );
        assert_eq!(CpalAudioPlatform::classify("Built-in Output"), None);
    }

    #[test]
    fn mute_flag_is_shared_and_cleared_on_release() {
        let platform = CpalAudioPlatform::new();
        let flag = platform.microphone_mute_flag();

        platform.set_microphone_muted(true).unwrap();
        assert!(*flag.lock());

        platform.release();
        assert!(!*flag.lock());
    }

    #[test]
    fn accessory_routing_uses_the_known_device_list() {
        let platform = CpalAudioPlatform::new();
        assert!(matches!(
            platform.route_to(AudioDevice::WiredHeadset),
            Err(AudioError::DeviceUnavailable(AudioDevice::WiredHeadset))
        ));

        assert!(platform.update_devices(vec!["USB Headset".to_string()]));
        assert!(!platform.update_devices(vec!["USB Headset".to_string()]));
        assert!(platform.route_to(AudioDevice::WiredHeadset).is_ok());
    }
}
