//! Audio-Routing während eines Anrufs

use super::{AudioDevice, AudioError, AudioPlatform, AudioRouteEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct RouteState {
    available: Vec<AudioDevice>,
    current: AudioDevice,
    volume: f32,
    muted: bool,
    /// Lautstärke vor dem Stummschalten, wird beim Aufheben exakt wiederhergestellt
    pre_mute_volume: Option<f32>,
    video_session: bool,
}

/// Verwaltet Audio-Ausgang, Lautstärke und Mute
pub struct AudioRouteManager {
    platform: Arc<dyn AudioPlatform>,
    state: Mutex<RouteState>,
    event_tx: broadcast::Sender<AudioRouteEvent>,
}

impl AudioRouteManager {
    pub fn new(platform: Arc<dyn AudioPlatform>) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        let manager = Self {
            platform,
            state: Mutex::new(RouteState {
                available: AudioDevice::BUILT_IN.to_vec(),
                current: AudioDevice::Earpiece,
                volume: 1.0,
                muted: false,
                pre_mute_volume: None,
                video_session: false,
            }),
            event_tx,
        };
        manager.on_devices_changed();
        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioRouteEvent> {
        self.event_tx.subscribe()
    }

    pub fn available_devices(&self) -> Vec<AudioDevice> {
        self.state.lock().available.clone()
    }

    pub fn current_device(&self) -> AudioDevice {
        self.state.lock().current
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    /// Leitet Audio auf `device` um
    ///
    /// Gibt `Ok(false)` zurück, wenn das Gerät gerade nicht verfügbar ist.
    pub fn select_device(&self, device: AudioDevice) -> Result<bool, AudioError> {
        {
            let state = self.state.lock();
            if !state.available.contains(&device) {
                tracing::debug!("Ignoring selection of unavailable device {:?}", device);
                return Ok(false);
            }
            if state.current == device {
                return Ok(true);
            }
        }

        self.platform.route_to(device)?;
        self.state.lock().current = device;
        tracing::info!("Audio device selected: {:?}", device);
        let _ = self.event_tx.send(AudioRouteEvent::CurrentDeviceChanged(device));
        Ok(true)
    }

    /// Vom System gemeldete Änderung der angeschlossenen Geräte
    ///
    /// Fragt die Plattform ab und kann daher blockieren. Neues Zubehör übernimmt das Routing; verschwindet das aktuelle Gerät,
    /// wird auf das Standardgerät der Session zurückgefallen.
    pub fn on_devices_changed(&self) {
        let accessories = match self.platform.detect_accessories() {
            Ok(accessories) => accessories,
            Err(e) => {
                tracing::warn!("Failed to detect audio accessories: {}", e);
                Vec::new()
            }
        };

        let mut available = AudioDevice::BUILT_IN.to_vec();
        for device in accessories {
            if !available.contains(&device) {
                available.push(device);
            }
        }

        let (changed, new_accessory, current_lost, fallback) = {
            let mut state = self.state.lock();
            if state.available == available {
                return;
            }
            let new_accessory = available
                .iter()
                .copied()
                .filter(|d| d.is_accessory() && !state.available.contains(d))
                .last();
            let current_lost = !available.contains(&state.current);
            state.available = available.clone();
            let fallback = Self::default_device(&available, state.video_session);
            (available, new_accessory, current_lost, fallback)
        };

        tracing::info!("Audio devices changed: {:?}", changed);
        let _ = self.event_tx.send(AudioRouteEvent::DevicesChanged(changed));

        let target = new_accessory.or(current_lost.then_some(fallback));
        if let Some(target) = target {
            if let Err(e) = self.select_device(target) {
                tracing::warn!("Failed to route audio to {:?}: {}", target, e);
            }
        }
    }

    /// Setzt die Lautstärke (0.0 - 1.0)
    ///
    /// Während Mute wird nur der wiederherzustellende Wert angepasst.
    pub fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        if !volume.is_finite() {
            return Err(AudioError::UnsupportedConfig(format!("volume {}", volume)));
        }
        let volume = volume.clamp(0.0, 1.0);
        {
            let mut state = self.state.lock();
            if state.muted {
                state.pre_mute_volume = Some(volume);
                return Ok(());
            }
        }

        self.platform.set_volume(volume)?;
        self.state.lock().volume = volume;
        let _ = self.event_tx.send(AudioRouteEvent::VolumeChanged(volume));
        Ok(())
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), AudioError> {
        let (volume, restore) = {
            let state = self.state.lock();
            if state.muted == muted {
                return Ok(());
            }
            (state.volume, state.pre_mute_volume)
        };

        self.platform.set_microphone_muted(muted)?;
        let new_volume = if muted {
            0.0
        } else {
            restore.unwrap_or(volume)
        };
        self.platform.set_volume(new_volume)?;

        {
            let mut state = self.state.lock();
            state.muted = muted;
            state.pre_mute_volume = if muted { Some(volume) } else { None };
            state.volume = new_volume;
        }

        tracing::debug!("Call audio muted: {}", muted);
        let _ = self.event_tx.send(AudioRouteEvent::MuteChanged(muted));
        let _ = self.event_tx.send(AudioRouteEvent::VolumeChanged(new_volume));
        Ok(())
    }

    /// Geräteänderungen der Plattform, falls sie welche meldet
    pub fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        self.platform.device_changes()
    }

    /// Übernimmt das Audio-Routing für die Dauer einer Session
    ///
    /// Arbeitet mit der zuletzt erkannten Geräteliste und fragt die
    /// Plattform nicht neu ab. Das zurückgegebene [`AudioFocus`] gibt alles
    /// beim Drop wieder frei.
    pub fn acquire(self: &Arc<Self>, is_video: bool) -> Result<AudioFocus, AudioError> {
        self.platform.acquire()?;
        self.state.lock().video_session = is_video;

        let device = {
            let state = self.state.lock();
            Self::default_device(&state.available, is_video)
        };
        if let Err(e) = self.select_device(device) {
            tracing::warn!("Failed to select {:?} at session start: {}", device, e);
        }

        Ok(AudioFocus {
            manager: Arc::clone(self),
        })
    }

    /// Zubehör vor Lautsprecher (Video) vor Hörmuschel (Sprache)
    fn default_device(available: &[AudioDevice], is_video: bool) -> AudioDevice {
        if available.contains(&AudioDevice::WiredHeadset) {
            AudioDevice::WiredHeadset
        } else if available.contains(&AudioDevice::Bluetooth) {
            AudioDevice::Bluetooth
        } else if is_video {
            AudioDevice::Speaker
        } else {
            AudioDevice::Earpiece
        }
    }

    fn release(&self) {
        if let Err(e) = self.set_muted(false) {
            tracing::warn!("Failed to unmute on release: {}", e);
        }
        self.state.lock().video_session = false;
        self.platform.release();
        tracing::debug!("Audio focus released");
    }
}

impl std::fmt::Debug for AudioRouteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRouteManager")
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Scoped Audio-Fokus einer Session
#[must_use = "audio focus is released when dropped"]
pub struct AudioFocus {
    manager: Arc<AudioRouteManager>,
}

impl Drop for AudioFocus {
    fn drop(&mut self) {
        self.manager.release();
    }
}

impl std::fmt::Debug for AudioFocus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFocus").finish()
    }
}
