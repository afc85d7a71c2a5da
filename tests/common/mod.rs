//! In-Memory Ersatz für Signaling, Media Engine, Audio und Aufnahme

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_call::audio::{AudioDevice, AudioError, AudioPlatform, AudioRouteManager};
use pulse_call::media::{MediaConnectionState, MediaEngine, MediaEngineError, MediaEvent};
use pulse_call::quality::{QualityMonitor, QualityThresholds};
use pulse_call::recording::{ActiveCapture, CallRecordingManager, CaptureBackend, RecordingError};
use pulse_call::signaling::{
    IceCandidate, SignalingError, SignalingEvent, SignalingMessage, SignalingPort,
};
use pulse_call::{CallSessionManager, CallState, SessionDeps};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// SIGNALING
// ============================================================================

pub struct FakeSignaling {
    sent: Mutex<Vec<SignalingMessage>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    fail_sends: Mutex<bool>,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            event_tx,
            fail_sends: Mutex::new(false),
        })
    }

    /// Simuliert eine Nachricht vom Server
    pub fn inject(&self, message: SignalingMessage) {
        let _ = self.event_tx.send(SignalingEvent::Message(message));
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock() = fail;
    }
}

impl SignalingPort for FakeSignaling {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if *self.fail_sends.lock() {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

pub struct FakeMediaEngine {
    calls: Mutex<Vec<String>>,
    event_tx: broadcast::Sender<MediaEvent>,
    offer_error: Mutex<Option<MediaEngineError>>,
    offer_delay: Mutex<Duration>,
}

impl FakeMediaEngine {
    pub fn new() -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            event_tx,
            offer_error: Mutex::new(None),
            offer_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Aufgezeichnete Aufrufe, z.B. `create_offer`, `add_ice_candidate:c1`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn fail_offers_with(&self, error: MediaEngineError) {
        *self.offer_error.lock() = Some(error);
    }

    /// Verzögert `create_offer`, wie eine langsame Engine
    pub fn delay_offers_by(&self, delay: Duration) {
        *self.offer_delay.lock() = delay;
    }

    pub fn emit(&self, event: MediaEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn emit_connected(&self) {
        self.emit(MediaEvent::ConnectionStateChanged(
            MediaConnectionState::Connected,
        ));
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create_offer(&self, is_video: bool) -> Result<String, MediaEngineError> {
        self.record("create_offer");
        let delay = *self.offer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.offer_error.lock().clone() {
            return Err(error);
        }
        Ok(format!("offer-sdp video={}", is_video))
    }

    async fn create_answer(
        &self,
        offer_sdp: &str,
        is_video: bool,
    ) -> Result<String, MediaEngineError> {
        self.record(format!("create_answer:{}", offer_sdp));
        Ok(format!("answer-sdp video={}", is_video))
    }

    async fn set_remote_description(&self, answer_sdp: &str) -> Result<(), MediaEngineError> {
        self.record(format!("set_remote_description:{}", answer_sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaEngineError> {
        self.record(format!("add_ice_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaEngineError> {
        self.record(format!("set_video_enabled:{}", enabled));
        Ok(())
    }

    async fn dispose(&self) {
        self.record("dispose");
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_tx.subscribe()
    }
}

// ============================================================================
// AUDIO PLATFORM
// ============================================================================

pub struct FakeAudioPlatform {
    pub accessories: Mutex<Vec<AudioDevice>>,
    pub routed: Mutex<Vec<AudioDevice>>,
    pub volume: Mutex<f32>,
    pub mic_muted: Mutex<bool>,
    pub acquired: Mutex<bool>,
    /// Anzahl der Geräteabfragen
    pub detections: Mutex<usize>,
    changes_tx: broadcast::Sender<()>,
}

impl FakeAudioPlatform {
    pub fn new() -> Arc<Self> {
        Self::with_accessories(Vec::new())
    }

    pub fn with_accessories(accessories: Vec<AudioDevice>) -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(8);
        Arc::new(Self {
            accessories: Mutex::new(accessories),
            routed: Mutex::new(Vec::new()),
            volume: Mutex::new(0.0),
            mic_muted: Mutex::new(false),
            acquired: Mutex::new(false),
            detections: Mutex::new(0),
            changes_tx,
        })
    }

    /// Simuliert das An- oder Abstecken von Zubehör
    pub fn plug(&self, accessories: Vec<AudioDevice>) {
        *self.accessories.lock() = accessories;
        let _ = self.changes_tx.send(());
    }
}

impl AudioPlatform for FakeAudioPlatform {
    fn detect_accessories(&self) -> Result<Vec<AudioDevice>, AudioError> {
        *self.detections.lock() += 1;
        Ok(self.accessories.lock().clone())
    }

    fn route_to(&self, device: AudioDevice) -> Result<(), AudioError> {
        self.routed.lock().push(device);
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        *self.volume.lock() = volume;
        Ok(())
    }

    fn set_microphone_muted(&self, muted: bool) -> Result<(), AudioError> {
        *self.mic_muted.lock() = muted;
        Ok(())
    }

    fn acquire(&self) -> Result<(), AudioError> {
        *self.acquired.lock() = true;
        Ok(())
    }

    fn release(&self) {
        *self.acquired.lock() = false;
    }

    fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes_tx.subscribe())
    }
}

// ============================================================================
// CAPTURE BACKEND
// ============================================================================

/// Schreibt eine kleine Platzhalter-Datei statt echter Audio-Aufnahme
#[derive(Default)]
pub struct FakeCaptureBackend {
    pub fail: Mutex<bool>,
    pub started: Mutex<Vec<PathBuf>>,
    /// Simuliert einen langsamen Geräte-Start
    pub start_delay: Mutex<Duration>,
}

struct FakeCapture {
    path: PathBuf,
}

impl CaptureBackend for FakeCaptureBackend {
    fn start(&self, path: &Path) -> Result<Box<dyn ActiveCapture>, RecordingError> {
        let delay = *self.start_delay.lock();
        std::thread::sleep(delay);
        if *self.fail.lock() {
            return Err(RecordingError::Capture("no microphone".to_string()));
        }
        std::fs::write(path, b"RIFF")?;
        self.started.lock().push(path.to_path_buf());
        Ok(Box::new(FakeCapture {
            path: path.to_path_buf(),
        }))
    }
}

impl ActiveCapture for FakeCapture {
    fn stop(self: Box<Self>) -> Result<(), RecordingError> {
        std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)?;
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub manager: CallSessionManager,
    pub media: Arc<FakeMediaEngine>,
    pub signaling: Arc<FakeSignaling>,
    pub platform: Arc<FakeAudioPlatform>,
    pub audio: Arc<AudioRouteManager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(None, None)
    }

    pub fn with_options(
        connect_timeout: Option<Duration>,
        recorder: Option<Arc<CallRecordingManager>>,
    ) -> Self {
        let media = FakeMediaEngine::new();
        let signaling = FakeSignaling::new();
        let platform = FakeAudioPlatform::new();
        let audio = Arc::new(AudioRouteManager::new(platform.clone()));

        let manager = CallSessionManager::spawn_with(
            SessionDeps {
                media: media.clone(),
                signaling: signaling.clone(),
                audio: audio.clone(),
                recorder,
            },
            QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10)),
            connect_timeout,
        );

        Self {
            manager,
            media,
            signaling,
            platform,
            audio,
        }
    }

    /// Wartet, bis der Zustand `predicate` erfüllt
    pub async fn wait_for_state(&self, predicate: impl Fn(&CallState) -> bool) -> CallState {
        let mut rx = self.manager.watch_state();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .expect("state channel closed");
        state.clone()
    }

    /// Wartet, bis die Media Engine `count` Aufrufe gesehen hat
    pub async fn wait_for_media_calls(&self, count: usize) -> Vec<String> {
        for _ in 0..500 {
            let calls = self.media.calls();
            if calls.len() >= count {
                return calls;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("media engine saw only {:?}", self.media.calls());
    }

    /// Wartet, bis `count` Nachrichten verschickt wurden
    pub async fn wait_for_sent(&self, count: usize) -> Vec<SignalingMessage> {
        for _ in 0..500 {
            let sent = self.signaling.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("signaling sent only {:?}", self.signaling.sent());
    }
}

pub fn candidate(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: 0,
    }
}
