mod common;

use common::FakeAudioPlatform;
use pulse_call::audio::{AudioDevice, AudioError, AudioRouteEvent, AudioRouteManager};
use std::sync::Arc;

#[test]
fn built_in_devices_are_always_available() {
    let manager = AudioRouteManager::new(FakeAudioPlatform::new());

    assert_eq!(
        manager.available_devices(),
        vec![AudioDevice::Earpiece, AudioDevice::Speaker]
    );
    assert_eq!(manager.current_device(), AudioDevice::Earpiece);
}

#[test]
fn unavailable_device_is_not_selected() {
    let platform = FakeAudioPlatform::new();
    let manager = AudioRouteManager::new(platform.clone());

    assert!(!manager.select_device(AudioDevice::Bluetooth).unwrap());
    assert_eq!(manager.current_device(), AudioDevice::Earpiece);
    assert!(platform.routed.lock().is_empty());

    assert!(manager.select_device(AudioDevice::Speaker).unwrap());
    assert_eq!(manager.current_device(), AudioDevice::Speaker);
    assert_eq!(*platform.routed.lock(), vec![AudioDevice::Speaker]);
}

#[test]
fn session_default_depends_on_call_type() {
    let manager = Arc::new(AudioRouteManager::new(FakeAudioPlatform::new()));

    let focus = manager.acquire(true).unwrap();
    assert_eq!(manager.current_device(), AudioDevice::Speaker);
    drop(focus);

    let _focus = manager.acquire(false).unwrap();
    assert_eq!(manager.current_device(), AudioDevice::Earpiece);
}

#[test]
fn connected_headset_wins_over_built_ins() {
    let platform = FakeAudioPlatform::with_accessories(vec![AudioDevice::WiredHeadset]);
    let manager = Arc::new(AudioRouteManager::new(platform));

    let _focus = manager.acquire(true).unwrap();

    assert_eq!(manager.current_device(), AudioDevice::WiredHeadset);
    assert!(manager
        .available_devices()
        .contains(&AudioDevice::WiredHeadset));
}

#[test]
fn plugging_and_unplugging_accessories_reroutes() {
    let platform = FakeAudioPlatform::new();
    let manager = Arc::new(AudioRouteManager::new(platform.clone()));
    let _focus = manager.acquire(false).unwrap();
    let mut events = manager.subscribe();

    platform.accessories.lock().push(AudioDevice::Bluetooth);
    manager.on_devices_changed();
    assert_eq!(manager.current_device(), AudioDevice::Bluetooth);

    platform.accessories.lock().clear();
    manager.on_devices_changed();
    assert_eq!(manager.current_device(), AudioDevice::Earpiece);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            AudioRouteEvent::DevicesChanged(vec![
                AudioDevice::Earpiece,
                AudioDevice::Speaker,
                AudioDevice::Bluetooth
            ]),
            AudioRouteEvent::CurrentDeviceChanged(AudioDevice::Bluetooth),
            AudioRouteEvent::DevicesChanged(vec![AudioDevice::Earpiece, AudioDevice::Speaker]),
            AudioRouteEvent::CurrentDeviceChanged(AudioDevice::Earpiece),
        ]
    );
}

#[test]
fn volume_set_while_muted_is_applied_on_unmute() {
    let platform = FakeAudioPlatform::new();
    let manager = AudioRouteManager::new(platform.clone());
    manager.set_volume(0.6).unwrap();

    manager.set_muted(true).unwrap();
    assert_eq!(*platform.volume.lock(), 0.0);
    assert!(*platform.mic_muted.lock());

    manager.set_volume(0.3).unwrap();
    assert_eq!(manager.volume(), 0.0);

    manager.set_muted(false).unwrap();
    assert_eq!(manager.volume(), 0.3);
    assert!(!*platform.mic_muted.lock());
}

#[test]
fn dropping_focus_releases_and_unmutes() {
    let platform = FakeAudioPlatform::new();
    let manager = Arc::new(AudioRouteManager::new(platform.clone()));
    manager.set_volume(0.8).unwrap();

    let focus = manager.acquire(false).unwrap();
    manager.set_muted(true).unwrap();
    assert!(*platform.acquired.lock());

    drop(focus);

    assert!(!*platform.acquired.lock());
    assert!(!manager.is_muted());
    assert_eq!(manager.volume(), 0.8);
}

#[test]
fn non_finite_volume_is_rejected() {
    let platform = FakeAudioPlatform::new();
    let manager = AudioRouteManager::new(platform.clone());
    manager.set_volume(0.4).unwrap();

    assert!(matches!(
        manager.set_volume(f32::NAN),
        Err(AudioError::UnsupportedConfig(_))
    ));
    assert!(manager.set_volume(f32::INFINITY).is_err());

    manager.set_muted(true).unwrap();
    manager.set_muted(false).unwrap();
    assert_eq!(manager.volume(), 0.4);
    assert_eq!(*platform.volume.lock(), 0.4);
}
