use super::actor::{ActorInputs, ActorOutputs, Command, Reply, SessionActor};
use super::state::{CallId, CallSession, CallState, Peer, SessionEvent};
use crate::audio::{AudioDevice, AudioRouteManager};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::MediaEngine;
use crate::quality::{CallStats, QualityMonitor};
use crate::recording::CallRecordingManager;
use crate::signaling::{SignalingMessage, SignalingPort};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Abhängigkeiten einer Session, werden von außen injiziert
#[derive(Clone)]
pub struct SessionDeps {
    pub media: Arc<dyn MediaEngine>,
    pub signaling: Arc<dyn SignalingPort>,
    pub audio: Arc<AudioRouteManager>,
    /// `None` deaktiviert Aufnahmen
    pub recorder: Option<Arc<CallRecordingManager>>,
}

/// Öffentliche Schnittstelle zur Call-Session
///
/// Alle Methoden schicken Befehle an den Session-Actor; der Zustand selbst
/// wird nur dort verändert. Lesende Zugriffe gehen über `watch` Kanäle und
/// blockieren nie.
pub struct CallSessionManager {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<CallState>,
    session_rx: watch::Receiver<Option<CallSession>>,
    stats_rx: watch::Receiver<Option<CallStats>>,
    event_tx: broadcast::Sender<SessionEvent>,
    audio: Arc<AudioRouteManager>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl CallSessionManager {
    /// Startet den Session-Actor; muss innerhalb einer Tokio Runtime laufen
    pub fn spawn(config: &CallConfig, deps: SessionDeps) -> Self {
        let monitor = QualityMonitor::new(config.quality, config.warning_interval());
        Self::spawn_with(deps, monitor, config.connect_timeout())
    }

    pub fn spawn_with(
        deps: SessionDeps,
        monitor: QualityMonitor,
        connect_timeout: Option<Duration>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (session_tx, session_rx) = watch::channel(None);
        let (stats_tx, stats_rx) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(256);

        // Vor dem Spawn abonnieren, damit kein Event verloren geht
        let inputs = ActorInputs {
            commands: commands_rx,
            signaling: Some(deps.signaling.subscribe()),
            audio: Some(deps.audio.subscribe()),
            device_changes: deps.audio.device_changes(),
            recording: deps.recorder.as_ref().map(|r| r.subscribe()),
        };
        let outputs = ActorOutputs {
            state: state_tx,
            session: session_tx,
            stats: stats_tx,
            events: event_tx.clone(),
        };

        let audio = Arc::clone(&deps.audio);
        let actor = SessionActor::new(
            deps.media,
            deps.signaling,
            deps.audio,
            deps.recorder,
            monitor,
            connect_timeout,
            outputs,
        );
        let handle = tokio::spawn(actor.run(inputs));

        Self {
            commands,
            state_rx,
            session_rx,
            stats_rx,
            event_tx,
            audio,
            actor: Mutex::new(Some(handle)),
        }
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Liefert die Call-ID, sobald das Offer verschickt ist.
    pub async fn start_call(&self, peer: Peer, is_video: bool) -> Result<CallId, CallError> {
        self.request(|reply| Command::StartCall {
            peer,
            is_video,
            reply,
        })
        .await
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn accept_incoming_call(
        &self,
        call_id: &str,
        offer_sdp: &str,
    ) -> Result<CallId, CallError> {
        self.request(|reply| Command::AcceptIncoming {
            call_id: call_id.to_string(),
            offer_sdp: offer_sdp.to_string(),
            reply,
        })
        .await
    }

    pub async fn reject_incoming_call(&self, call_id: &str) -> Result<(), CallError> {
        self.request(|reply| Command::RejectIncoming {
            call_id: call_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn end_call(&self, reason: &str) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall {
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    /// Stummschalten; außerhalb eines verbundenen Anrufs ohne Wirkung
    pub async fn toggle_mute(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), CallError> {
        self.request(|reply| Command::SetVolume { volume, reply }).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetVideoEnabled { enabled, reply })
            .await
    }

    /// Gibt `false` zurück, wenn das Gerät gerade nicht verfügbar ist
    pub async fn select_audio_device(&self, device: AudioDevice) -> Result<bool, CallError> {
        self.request(|reply| Command::SelectAudioDevice { device, reply })
            .await
    }

    pub async fn start_recording(&self) -> Result<PathBuf, CallError> {
        self.request(|reply| Command::StartRecording { reply }).await
    }

    pub async fn stop_recording(&self) -> Result<Option<(PathBuf, u64)>, CallError> {
        self.request(|reply| Command::StopRecording { reply }).await
    }

    /// Speist eine Nachricht ein, die nicht über den Signaling-Kanal kam
    pub fn on_signaling_message(&self, message: SignalingMessage) {
        if self.commands.send(Command::Signaling(message)).is_err() {
            tracing::warn!("Call session actor is not running, dropping signaling message");
        }
    }

    /// Beendet einen laufenden Anruf und stoppt den Actor
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        let handle = self.actor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // ========================================================================
    // OBSERVERS
    // ========================================================================

    pub fn state(&self) -> CallState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    /// Aktuelle oder zuletzt beendete Session
    pub fn session(&self) -> Option<CallSession> {
        self.session_rx.borrow().clone()
    }

    pub fn stats(&self) -> Option<CallStats> {
        self.stats_rx.borrow().clone()
    }

    pub fn watch_stats(&self) -> watch::Receiver<Option<CallStats>> {
        self.stats_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn available_audio_devices(&self) -> Vec<AudioDevice> {
        self.audio.available_devices()
    }

    pub fn current_audio_device(&self) -> AudioDevice {
        self.audio.current_device()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| CallError::internal("call session actor is not running"))?;
        response
            .await
            .map_err(|_| CallError::internal("call session actor dropped the request"))?
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}
