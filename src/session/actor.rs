//! Session-Actor
//!
//! Genau ein Task besitzt den Zustand. UI-Befehle, Signaling, Media-Events,
//! Stats und der Sekundentakt kommen als Nachrichten an und werden der Reihe
//! nach verarbeitet. Alles, was pro Session im Hintergrund läuft, trägt die
//! Epoch der Session; Nachrichten mit veralteter Epoch werden verworfen.

use super::state::{reason, CallId, CallSession, CallState, IncomingCall, Peer, SessionEvent};
use crate::audio::{AudioDevice, AudioFocus, AudioRouteEvent, AudioRouteManager};
use crate::error::{CallError, ErrorCode};
use crate::media::{MediaConnectionState, MediaEngine, MediaEngineError, MediaEvent};
use crate::quality::{CallStats, QualityMonitor};
use crate::recording::{CallRecordingManager, RecordingState};
use crate::signaling::{CallType, IceCandidate, SignalingEvent, SignalingMessage, SignalingPort};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Obergrenze gepufferter Candidates pro unbekanntem Anruf
const MAX_EARLY_CANDIDATES: usize = 64;

/// Obergrenze gleichzeitig gemerkter eingehender Anrufe
const MAX_INBOUND_CALLS: usize = 8;

/// Eingehende Anrufe ohne neue Nachricht verfallen nach dieser Zeit
const INBOUND_TTL: Duration = Duration::from_secs(60);

/// Beendete oder abgelehnte Call-IDs, deren Nachzügler verworfen werden
const MAX_CLOSED_CALLS: usize = 32;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

// ============================================================================
// MESSAGES
// ============================================================================

/// Befehle der öffentlichen API
pub(crate) enum Command {
    StartCall {
        peer: Peer,
        is_video: bool,
        reply: Reply<CallId>,
    },
    AcceptIncoming {
        call_id: CallId,
        offer_sdp: String,
        reply: Reply<CallId>,
    },
    RejectIncoming {
        call_id: CallId,
        reply: Reply<()>,
    },
    EndCall {
        reason: String,
        reply: Reply<()>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<()>,
    },
    SetVolume {
        volume: f32,
        reply: Reply<()>,
    },
    SetVideoEnabled {
        enabled: bool,
        reply: Reply<()>,
    },
    SelectAudioDevice {
        device: AudioDevice,
        reply: Reply<bool>,
    },
    StartRecording {
        reply: Reply<PathBuf>,
    },
    StopRecording {
        reply: Reply<Option<(PathBuf, u64)>>,
    },
    /// Nachricht, die nicht über den Signaling-Kanal kam (z.B. Push)
    Signaling(SignalingMessage),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Nachrichten der Session-Tasks an den Actor
enum Internal {
    MediaOp { epoch: u64, outcome: MediaOutcome },
    Media { epoch: u64, event: MediaEvent },
    Tick { epoch: u64 },
    ConnectTimeout { epoch: u64 },
    RecordingFailed(CallError),
}

/// Aufträge an die Media Engine, werden strikt nacheinander ausgeführt
enum MediaOp {
    CreateOffer { is_video: bool },
    CreateAnswer { offer_sdp: String, is_video: bool },
    SetRemoteDescription { sdp: String },
    AddIceCandidate(IceCandidate),
    SetVideoEnabled { enabled: bool, reply: Reply<()> },
}

enum MediaOutcome {
    OfferCreated(Result<String, MediaEngineError>),
    AnswerCreated(Result<String, MediaEngineError>),
    RemoteDescriptionSet(Result<(), MediaEngineError>),
    CandidateAdded(Result<(), MediaEngineError>),
    VideoEnabled {
        enabled: bool,
        result: Result<(), MediaEngineError>,
        reply: Reply<()>,
    },
}

// ============================================================================
// SESSION RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

/// Hintergrund-Tasks einer Session, werden beim Drop abgebrochen
#[derive(Default)]
struct SessionTasks {
    media_worker: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    connect_timeout: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn cancel_connect_timeout(&mut self) {
        if let Some(task) = self.connect_timeout.take() {
            task.abort();
        }
    }
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        for task in [
            self.media_worker.take(),
            self.ticker.take(),
            self.connect_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct ActiveSession {
    epoch: u64,
    session: CallSession,
    role: Role,
    remote_description_set: bool,
    /// Engine meldete Connected, bevor das Remote SDP gesetzt war
    media_connected: bool,
    pending_candidates: Vec<IceCandidate>,
    connected_at: Option<Instant>,
    /// Antwort auf start_call / accept_incoming_call, sobald SDP raus ist
    pending_reply: Option<Reply<CallId>>,
    media_ops: mpsc::UnboundedSender<MediaOp>,
    tasks: SessionTasks,
    _audio_focus: Option<AudioFocus>,
}

impl ActiveSession {
    fn duration_ms(&self) -> u64 {
        self.connected_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn submit(&self, op: MediaOp) {
        if self.media_ops.send(op).is_err() {
            tracing::warn!("Media worker of call {} is gone", self.session.id);
        }
    }
}

/// Eingehender Anruf, der noch nicht angenommen wurde
struct InboundCall {
    offer: Option<IncomingCall>,
    candidates: Vec<IceCandidate>,
    last_seen: Instant,
}

impl InboundCall {
    fn new() -> Self {
        Self {
            offer: None,
            candidates: Vec::new(),
            last_seen: Instant::now(),
        }
    }
}

// ============================================================================
// ACTOR
// ============================================================================

/// Empfangsseite aller Eingänge des Actors
pub(crate) struct ActorInputs {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub signaling: Option<broadcast::Receiver<SignalingEvent>>,
    pub audio: Option<broadcast::Receiver<AudioRouteEvent>>,
    pub device_changes: Option<broadcast::Receiver<()>>,
    pub recording: Option<broadcast::Receiver<RecordingState>>,
}

/// Beobachtbarer Zustand, den der Actor veröffentlicht
pub(crate) struct ActorOutputs {
    pub state: watch::Sender<CallState>,
    pub session: watch::Sender<Option<CallSession>>,
    pub stats: watch::Sender<Option<CallStats>>,
    pub events: broadcast::Sender<SessionEvent>,
}

pub(crate) struct SessionActor {
    media: Arc<dyn MediaEngine>,
    signaling: Arc<dyn SignalingPort>,
    audio: Arc<AudioRouteManager>,
    recorder: Option<Arc<CallRecordingManager>>,
    monitor: QualityMonitor,
    connect_timeout: Option<Duration>,
    epoch: u64,
    active: Option<ActiveSession>,
    inbound: HashMap<CallId, InboundCall>,
    closed_calls: VecDeque<CallId>,
    last_dispose: Option<JoinHandle<()>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    outputs: ActorOutputs,
}

impl SessionActor {
    pub(crate) fn new(
        media: Arc<dyn MediaEngine>,
        signaling: Arc<dyn SignalingPort>,
        audio: Arc<AudioRouteManager>,
        recorder: Option<Arc<CallRecordingManager>>,
        monitor: QualityMonitor,
        connect_timeout: Option<Duration>,
        outputs: ActorOutputs,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        Self {
            media,
            signaling,
            audio,
            recorder,
            monitor,
            connect_timeout,
            epoch: 0,
            active: None,
            inbound: HashMap::new(),
            closed_calls: VecDeque::new(),
            last_dispose: None,
            internal_tx,
            internal_rx: Some(internal_rx),
            outputs,
        }
    }

    pub(crate) async fn run(mut self, mut inputs: ActorInputs) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        tracing::debug!("Call session actor started");

        loop {
            tokio::select! {
                command = inputs.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal),
                event = next_event(&mut inputs.signaling, "signaling") => {
                    self.handle_signaling_event(event);
                }
                event = next_event(&mut inputs.audio, "audio route") => {
                    self.emit(SessionEvent::AudioRoute(event));
                }
                () = next_event(&mut inputs.device_changes, "audio device") => {
                    self.refresh_audio_devices();
                }
                event = next_event(&mut inputs.recording, "recording") => {
                    self.emit(SessionEvent::Recording(event));
                }
            }
        }

        tracing::debug!("Call session actor stopped");
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                peer,
                is_video,
                reply,
            } => self.start_call(peer, is_video, reply),
            Command::AcceptIncoming {
                call_id,
                offer_sdp,
                reply,
            } => self.accept_incoming_call(call_id, offer_sdp, reply),
            Command::RejectIncoming { call_id, reply } => {
                let _ = reply.send(self.reject_incoming_call(&call_id));
            }
            Command::EndCall { reason, reply } => {
                let _ = reply.send(self.end_call(reason));
            }
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted));
            }
            Command::SetVolume { volume, reply } => {
                let _ = reply.send(self.set_volume(volume));
            }
            Command::SetVideoEnabled { enabled, reply } => self.set_video_enabled(enabled, reply),
            Command::SelectAudioDevice { device, reply } => {
                let result = self.audio.select_device(device).map_err(|e| {
                    let err = CallError::from(e);
                    self.record_error(&err, false);
                    err
                });
                let _ = reply.send(result);
            }
            Command::StartRecording { reply } => self.start_recording(reply),
            Command::StopRecording { reply } => self.stop_recording(reply),
            Command::Signaling(message) => self.on_signaling_message(message),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn start_call(&mut self, peer: Peer, is_video: bool, reply: Reply<CallId>) {
        if let Some(active) = &self.active {
            tracing::warn!(
                "Rejecting start_call: call {} is still active",
                active.session.id
            );
            let _ = reply.send(Err(CallError::already_in_call()));
            return;
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "Starting {} call {} to {}",
            CallType::from_video_flag(is_video).as_str(),
            call_id,
            peer.id
        );

        self.open_session(call_id, peer, is_video, Role::Caller, Vec::new(), reply);
        if let Some(active) = &self.active {
            active.submit(MediaOp::CreateOffer { is_video });
        }
    }

    fn accept_incoming_call(&mut self, call_id: CallId, offer_sdp: String, reply: Reply<CallId>) {
        if let Some(active) = &self.active {
            tracing::warn!(
                "Rejecting accept of {}: call {} is still active",
                call_id,
                active.session.id
            );
            let _ = reply.send(Err(CallError::already_in_call()));
            return;
        }

        let inbound = self
            .inbound
            .remove(&call_id)
            .unwrap_or_else(InboundCall::new);
        let (caller, is_video) = match inbound.offer {
            Some(offer) => (offer.caller, offer.is_video),
            // Offer kam nicht über unseren Kanal (z.B. Push), Typ aus dem SDP ableiten
            None => (Peer::new("unknown", "Unknown"), offer_sdp.contains("m=video")),
        };

        tracing::info!(
            "Accepting call {} from {} ({} early candidates)",
            call_id,
            caller.id,
            inbound.candidates.len()
        );

        self.open_session(
            call_id,
            caller,
            is_video,
            Role::Callee,
            inbound.candidates,
            reply,
        );
        if let Some(active) = &self.active {
            active.submit(MediaOp::CreateAnswer {
                offer_sdp,
                is_video,
            });
        }
    }

    fn reject_incoming_call(&mut self, call_id: &str) -> Result<(), CallError> {
        if let Some(active) = &self.active {
            if active.session.id == call_id {
                return Err(CallError::invalid_state(
                    "reject_incoming_call",
                    active.session.state.name(),
                ));
            }
        }

        self.mark_closed(call_id.to_string());
        tracing::info!("Rejecting incoming call {}", call_id);
        self.send_signaling(SignalingMessage::Answer {
            call_id: call_id.to_string(),
            accepted: false,
            sdp: None,
        });
        Ok(())
    }

    fn end_call(&mut self, reason: String) -> Result<(), CallError> {
        let Some(active) = &self.active else {
            let state = self.outputs.state.borrow().name();
            return Err(CallError::invalid_state("end_call", state));
        };

        tracing::info!("Ending call {}: {}", active.session.id, reason);
        self.send_signaling(SignalingMessage::End {
            call_id: active.session.id.clone(),
            reason: Some(reason.clone()),
        });
        self.finish_ended(reason);
        Ok(())
    }

    fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        if !self.is_connected() {
            tracing::debug!("Ignoring mute change outside of a connected call");
            return Ok(());
        }

        if let Err(e) = self.audio.set_muted(muted) {
            let err = CallError::from(e);
            self.record_error(&err, false);
            return Err(err);
        }

        self.update_connected(|state| {
            if let CallState::Connected { is_muted, .. } = state {
                *is_muted = muted;
            }
        });
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), CallError> {
        if !self.is_connected() {
            tracing::debug!("Ignoring volume change outside of a connected call");
            return Ok(());
        }

        self.audio.set_volume(volume).map_err(|e| {
            let err = CallError::from(e);
            self.record_error(&err, false);
            err
        })
    }

    fn set_video_enabled(&mut self, enabled: bool, reply: Reply<()>) {
        let Some(active) = self.active.as_ref().filter(|a| a.connected_at.is_some()) else {
            tracing::debug!("Ignoring video toggle outside of a connected call");
            let _ = reply.send(Ok(()));
            return;
        };
        if !active.session.is_video {
            let _ = reply.send(Err(CallError::invalid_state(
                "set_video_enabled",
                "voice call",
            )));
            return;
        }
        active.submit(MediaOp::SetVideoEnabled { enabled, reply });
    }

    fn start_recording(&mut self, reply: Reply<PathBuf>) {
        let Some(recorder) = self.recorder.clone() else {
            let _ = reply.send(Err(CallError::internal("recording is not configured")));
            return;
        };
        let Some(active) = self.active.as_ref().filter(|a| a.connected_at.is_some()) else {
            let state = self.outputs.state.borrow().name();
            let _ = reply.send(Err(CallError::invalid_state("start_recording", state)));
            return;
        };

        // Backend startet Threads und Dateien, nicht im Actor blockieren
        let call_id = active.session.id.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = recorder.start_recording(&call_id).map_err(CallError::from);
            if let Err(err) = &result {
                let _ = internal_tx.send(Internal::RecordingFailed(err.clone()));
            }
            let _ = reply.send(result);
        });
    }

    fn stop_recording(&mut self, reply: Reply<Option<(PathBuf, u64)>>) {
        let Some(recorder) = self.recorder.clone() else {
            let _ = reply.send(Ok(None));
            return;
        };

        let internal_tx = self.internal_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = recorder.stop_recording().map_err(CallError::from);
            if let Err(err) = &result {
                let _ = internal_tx.send(Internal::RecordingFailed(err.clone()));
            }
            let _ = reply.send(result);
        });
    }

    fn shutdown(&mut self) {
        if let Some(active) = &self.active {
            tracing::info!("Shutting down with active call {}", active.session.id);
            self.send_signaling(SignalingMessage::End {
                call_id: active.session.id.clone(),
                reason: Some(reason::SHUTDOWN.to_string()),
            });
            self.finish_ended(reason::SHUTDOWN.to_string());
        }
        self.inbound.clear();
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => tracing::info!("Signaling channel connected"),
            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling channel disconnected");
                if self.active.is_some() {
                    let err = CallError::new(
                        ErrorCode::NetworkError,
                        "signaling channel disconnected during call",
                    );
                    self.record_error(&err, false);
                }
            }
            SignalingEvent::Message(message) => self.on_signaling_message(message),
        }
    }

    fn on_signaling_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer {
                call_id,
                caller_id,
                call_type,
                sdp,
                ..
            } => self.on_offer(call_id, caller_id, call_type, sdp),
            SignalingMessage::Answer {
                call_id,
                accepted,
                sdp,
            } => self.on_answer(call_id, accepted, sdp),
            SignalingMessage::IceCandidate { call_id, candidate } => {
                self.on_remote_candidate(call_id, candidate)
            }
            SignalingMessage::End { call_id, reason } => self.on_remote_end(call_id, reason),
            SignalingMessage::SignalingError { message } => {
                tracing::warn!("Signaling error: {}", message);
                let err = CallError::new(ErrorCode::SignalingError, message);
                self.record_error(&err, false);
            }
        }
    }

    fn on_offer(
        &mut self,
        call_id: CallId,
        caller_id: Option<String>,
        call_type: CallType,
        sdp: String,
    ) {
        if let Some(active) = &self.active {
            if active.session.id == call_id {
                tracing::debug!("Ignoring repeated offer for active call {}", call_id);
                return;
            }
            if self.is_closed(&call_id) {
                tracing::debug!("Ignoring offer for closed call {}", call_id);
                return;
            }
            tracing::info!(
                "Busy with call {}, auto-rejecting offer {}",
                active.session.id,
                call_id
            );
            self.mark_closed(call_id.clone());
            self.send_signaling(SignalingMessage::Answer {
                call_id,
                accepted: false,
                sdp: None,
            });
            return;
        }
        if self.is_closed(&call_id) {
            tracing::debug!("Ignoring offer for closed call {}", call_id);
            return;
        }

        let caller_id = caller_id.unwrap_or_else(|| "unknown".to_string());
        let incoming = IncomingCall {
            call_id: call_id.clone(),
            caller: Peer::new(caller_id.clone(), caller_id),
            is_video: call_type.is_video(),
            offer_sdp: sdp,
        };

        tracing::info!(
            "Incoming {} call {} from {}",
            call_type.as_str(),
            call_id,
            incoming.caller.id
        );
        self.inbound_entry(call_id).offer = Some(incoming.clone());
        self.emit(SessionEvent::IncomingCall(incoming));
    }

    fn on_answer(&mut self, call_id: CallId, accepted: bool, sdp: Option<String>) {
        let Some(active) = self.active.as_ref().filter(|a| a.session.id == call_id) else {
            tracing::debug!("Ignoring answer for unknown call {}", call_id);
            return;
        };
        if active.role != Role::Caller || active.connected_at.is_some() {
            tracing::debug!("Ignoring unexpected answer for call {}", call_id);
            return;
        }

        if !accepted {
            tracing::info!("Call {} was rejected by the callee", call_id);
            self.finish_ended(reason::REJECTED.to_string());
            return;
        }

        match sdp {
            Some(sdp) => {
                tracing::debug!("Call {} accepted, applying remote description", call_id);
                active.submit(MediaOp::SetRemoteDescription { sdp });
            }
            None => {
                let err = CallError::new(
                    ErrorCode::SignalingError,
                    "accepted answer carries no SDP",
                );
                self.fail_session(err);
            }
        }
    }

    fn on_remote_candidate(&mut self, call_id: CallId, candidate: IceCandidate) {
        if let Some(active) = self.active.as_mut().filter(|a| a.session.id == call_id) {
            if active.remote_description_set {
                active.submit(MediaOp::AddIceCandidate(candidate));
            } else {
                tracing::debug!("Buffering ICE candidate for call {}", call_id);
                active.pending_candidates.push(candidate);
            }
            return;
        }

        if self.is_closed(&call_id) {
            tracing::trace!("Dropping late ICE candidate for closed call {}", call_id);
            return;
        }

        // Candidates können vor dem Offer oder vor der Annahme eintreffen
        let inbound = self.inbound_entry(call_id);
        if inbound.candidates.len() < MAX_EARLY_CANDIDATES {
            inbound.candidates.push(candidate);
        }
    }

    fn on_remote_end(&mut self, call_id: CallId, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| reason::REMOTE_HANGUP.to_string());

        if self.active.as_ref().map(|a| a.session.id == call_id) == Some(true) {
            tracing::info!("Call {} ended by peer: {}", call_id, reason);
            self.finish_ended(reason);
            return;
        }

        if let Some(inbound) = self.inbound.remove(&call_id) {
            self.mark_closed(call_id.clone());
            if inbound.offer.is_some() {
                tracing::info!("Incoming call {} cancelled: {}", call_id, reason);
                self.emit(SessionEvent::IncomingCallCancelled { call_id });
            }
        }
    }

    // ========================================================================
    // INTERNAL
    // ========================================================================

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaOp { epoch, outcome } => {
                if self.is_current(epoch) {
                    self.on_media_outcome(outcome);
                } else if let MediaOutcome::VideoEnabled { reply, .. } = outcome {
                    let _ = reply.send(Err(CallError::invalid_state(
                        "set_video_enabled",
                        "ended",
                    )));
                }
            }
            Internal::Media { epoch, event } => {
                if self.is_current(epoch) {
                    self.on_media_event(event);
                } else {
                    tracing::trace!("Dropping stale media event of epoch {}", epoch);
                }
            }
            Internal::Tick { epoch } => {
                if let Some(active) = self.active.as_ref().filter(|a| a.epoch == epoch) {
                    let tick = SessionEvent::DurationTick {
                        call_id: active.session.id.clone(),
                        duration_ms: active.duration_ms(),
                    };
                    self.emit(tick);
                }
            }
            Internal::ConnectTimeout { epoch } => {
                let Some(active) = self.active.as_ref().filter(|a| a.epoch == epoch) else {
                    return;
                };
                if active.connected_at.is_some() {
                    return;
                }
                tracing::warn!("Call {} timed out while connecting", active.session.id);
                self.send_signaling(SignalingMessage::End {
                    call_id: active.session.id.clone(),
                    reason: Some(reason::TIMEOUT.to_string()),
                });
                self.finish_ended(reason::TIMEOUT.to_string());
            }
            Internal::RecordingFailed(err) => self.record_error(&err, false),
        }
    }

    fn on_media_outcome(&mut self, outcome: MediaOutcome) {
        match outcome {
            MediaOutcome::OfferCreated(Ok(sdp)) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                let offer = SignalingMessage::Offer {
                    call_id: active.session.id.clone(),
                    callee_id: active.session.peer.id.clone(),
                    caller_id: None,
                    call_type: CallType::from_video_flag(active.session.is_video),
                    sdp,
                };
                let call_id = active.session.id.clone();
                if let Some(reply) = active.pending_reply.take() {
                    let _ = reply.send(Ok(call_id.clone()));
                }
                tracing::debug!("Sending offer for call {}", call_id);
                self.send_signaling(offer);
            }
            MediaOutcome::AnswerCreated(Ok(sdp)) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                let call_id = active.session.id.clone();
                // Remote SDP war das Offer, gepufferte Candidates dürfen jetzt raus
                active.remote_description_set = true;
                for candidate in active.pending_candidates.drain(..) {
                    let _ = active.media_ops.send(MediaOp::AddIceCandidate(candidate));
                }
                if let Some(reply) = active.pending_reply.take() {
                    let _ = reply.send(Ok(call_id.clone()));
                }
                self.send_signaling(SignalingMessage::Answer {
                    call_id,
                    accepted: true,
                    sdp: Some(sdp),
                });
                self.maybe_connect();
            }
            MediaOutcome::OfferCreated(Err(e)) | MediaOutcome::AnswerCreated(Err(e)) => {
                tracing::error!("SDP negotiation failed: {}", e);
                let err = CallError::connection_failed(format!("SDP negotiation failed: {}", e))
                    .with_cause(e);
                self.fail_session(err);
            }
            MediaOutcome::RemoteDescriptionSet(Ok(())) => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                active.remote_description_set = true;
                let buffered = active.pending_candidates.len();
                for candidate in active.pending_candidates.drain(..) {
                    let _ = active.media_ops.send(MediaOp::AddIceCandidate(candidate));
                }
                tracing::debug!(
                    "Remote description applied for call {}, flushed {} candidates",
                    active.session.id,
                    buffered
                );
                self.maybe_connect();
            }
            MediaOutcome::RemoteDescriptionSet(Err(e)) => {
                tracing::error!("Failed to apply remote description: {}", e);
                self.fail_session(CallError::from(e));
            }
            MediaOutcome::CandidateAdded(Ok(())) => {}
            MediaOutcome::CandidateAdded(Err(e)) => {
                tracing::warn!("Failed to add remote ICE candidate: {}", e);
                self.record_error(&CallError::from(e), false);
            }
            MediaOutcome::VideoEnabled {
                enabled,
                result,
                reply,
            } => match result {
                Ok(()) => {
                    self.update_connected(|state| {
                        if let CallState::Connected {
                            is_video_enabled, ..
                        } = state
                        {
                            *is_video_enabled = enabled;
                        }
                    });
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let err = CallError::from(e);
                    self.record_error(&err, false);
                    let _ = reply.send(Err(err));
                }
            },
        }
    }

    fn on_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::ConnectionStateChanged(state) => self.on_media_state(state),
            MediaEvent::LocalIceCandidate(candidate) => {
                if let Some(active) = &self.active {
                    let message = SignalingMessage::IceCandidate {
                        call_id: active.session.id.clone(),
                        candidate,
                    };
                    self.send_signaling(message);
                }
            }
            MediaEvent::RemoteTrack(kind) => tracing::debug!("Remote {:?} track arrived", kind),
            MediaEvent::StatsSample(raw) => {
                if !self.is_connected() {
                    return;
                }
                let report = self.monitor.on_stats_sample(&raw);
                self.outputs.stats.send_replace(Some(report.stats.clone()));
                self.emit(SessionEvent::StatsUpdated(report.stats));
                if let Some(warning) = report.warning {
                    self.emit(SessionEvent::QualityWarning(warning));
                }
            }
            MediaEvent::VideoResolutionChanged { width, height } => {
                self.monitor.on_video_resolution_changed(width, height);
                if let Some(stats) = self.monitor.current().cloned() {
                    self.outputs.stats.send_replace(Some(stats));
                }
            }
            MediaEvent::Failure(e) => {
                let err = CallError::from(e);
                if err.code.is_session_fatal() {
                    tracing::error!("Media engine failure: {}", err);
                    self.fail_session(err);
                } else {
                    tracing::warn!("Media engine reported: {}", err);
                    self.record_error(&err, false);
                }
            }
        }
    }

    fn on_media_state(&mut self, state: MediaConnectionState) {
        tracing::debug!("Media connection state: {:?}", state);
        match state {
            MediaConnectionState::Connected => {
                if let Some(active) = self.active.as_mut() {
                    active.media_connected = true;
                }
                self.maybe_connect();
            }
            MediaConnectionState::Disconnected => {
                tracing::warn!("Media connection interrupted, waiting for recovery");
            }
            MediaConnectionState::Failed => {
                let err = CallError::new(
                    ErrorCode::IceConnectionFailed,
                    "ICE connection failed",
                );
                self.fail_session(err);
            }
            MediaConnectionState::Closed => {
                let err = CallError::new(
                    ErrorCode::PeerDisconnected,
                    "media connection closed",
                );
                self.fail_session(err);
            }
            MediaConnectionState::New | MediaConnectionState::Connecting => {}
        }
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    fn open_session(
        &mut self,
        call_id: CallId,
        peer: Peer,
        is_video: bool,
        role: Role,
        early_candidates: Vec<IceCandidate>,
        reply: Reply<CallId>,
    ) {
        self.epoch += 1;
        let epoch = self.epoch;

        let audio_focus = match self.audio.acquire(is_video) {
            Ok(focus) => Some(focus),
            Err(e) => {
                tracing::warn!("Continuing without audio focus: {}", e);
                self.record_error(&CallError::from(e), false);
                None
            }
        };

        let (media_ops, ops_rx) = mpsc::unbounded_channel();
        let mut tasks = SessionTasks::default();
        tasks.media_worker = Some(tokio::spawn(media_worker(
            Arc::clone(&self.media),
            self.last_dispose.take(),
            ops_rx,
            self.internal_tx.clone(),
            epoch,
        )));

        if let Some(timeout) = self.connect_timeout {
            let internal_tx = self.internal_tx.clone();
            tasks.connect_timeout = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = internal_tx.send(Internal::ConnectTimeout { epoch });
            }));
        }

        let state = CallState::Connecting {
            peer: peer.clone(),
            is_video,
        };
        self.active = Some(ActiveSession {
            epoch,
            session: CallSession {
                id: call_id,
                peer,
                is_video,
                state: state.clone(),
                start_time: None,
                end_time: None,
            },
            role,
            remote_description_set: false,
            media_connected: false,
            pending_candidates: early_candidates,
            connected_at: None,
            pending_reply: Some(reply),
            media_ops,
            tasks,
            _audio_focus: audio_focus,
        });
        self.outputs.stats.send_replace(None);
        self.publish_state(state);
    }

    /// Connected erst, wenn Remote SDP gesetzt ist und die Engine verbunden meldet
    fn maybe_connect(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.connected_at.is_some()
            || !active.remote_description_set
            || !active.media_connected
        {
            return;
        }

        let start_time = Utc::now();
        let epoch = active.epoch;
        active.connected_at = Some(Instant::now());
        active.session.start_time = Some(start_time);
        active.tasks.cancel_connect_timeout();

        let internal_tx = self.internal_tx.clone();
        active.tasks.ticker = Some(tokio::spawn(async move {
            let start = Instant::now() + TICK_INTERVAL;
            let mut interval = tokio::time::interval_at(start, TICK_INTERVAL);
            loop {
                interval.tick().await;
                if internal_tx.send(Internal::Tick { epoch }).is_err() {
                    break;
                }
            }
        }));

        tracing::info!("Call {} connected", active.session.id);
        let state = CallState::Connected {
            peer: active.session.peer.clone(),
            is_video: active.session.is_video,
            start_time,
            is_muted: self.audio.is_muted(),
            is_video_enabled: active.session.is_video,
        };
        self.monitor.on_call_start();
        self.publish_state(state);
    }

    fn finish_ended(&mut self, reason: String) {
        let duration_ms = self
            .active
            .as_ref()
            .map(ActiveSession::duration_ms)
            .unwrap_or(0);
        self.teardown(CallState::Ended {
            reason,
            duration_ms,
        });
    }

    /// Harter Abbruch mit `Error`
    fn fail_session(&mut self, err: CallError) {
        let Some(active) = &self.active else {
            self.record_error(&err, false);
            return;
        };
        self.record_error(&err, true);

        // Peer kennt die Session erst, wenn unser SDP raus ist
        if active.pending_reply.is_none() {
            self.send_signaling(SignalingMessage::End {
                call_id: active.session.id.clone(),
                reason: Some(err.code.as_str().to_lowercase()),
            });
        }
        self.teardown(CallState::Error {
            code: err.code,
            message: err.message.clone(),
        });
    }

    /// Räumt die aktive Session ab und veröffentlicht den Endzustand
    fn teardown(&mut self, final_state: CallState) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        if let Some(reply) = active.pending_reply.take() {
            let err = match &final_state {
                CallState::Error { code, message } => CallError::new(*code, message.clone()),
                _ => CallError::connection_failed("call ended before negotiation completed"),
            };
            let _ = reply.send(Err(err));
        }

        // Worker, Ticker und Timeout sofort abbrechen
        drop(std::mem::take(&mut active.tasks));

        // Auch eine gerade startende Aufnahme wird so abgebrochen
        if let Some(recorder) = self.recorder.clone() {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = recorder.stop_recording() {
                    tracing::warn!("Failed to stop recording on teardown: {}", e);
                }
            });
        }

        let media = Arc::clone(&self.media);
        self.last_dispose = Some(tokio::spawn(async move {
            media.dispose().await;
        }));

        self.monitor.on_call_end();
        self.mark_closed(active.session.id.clone());

        active.session.end_time = Some(Utc::now());
        active.session.state = final_state.clone();
        tracing::info!(
            "Call {} finished: {:?}",
            active.session.id,
            final_state
        );
        self.outputs.session.send_replace(Some(active.session.clone()));
        // Audio-Fokus wird mit der Session freigegeben
        drop(active);

        self.outputs.state.send_replace(final_state.clone());
        self.emit(SessionEvent::StateChanged(final_state));
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Merkt sich eine beendete Call-ID und vergisst ihren Eingangs-Eintrag
    fn mark_closed(&mut self, call_id: CallId) {
        self.inbound.remove(&call_id);
        if self.is_closed(&call_id) {
            return;
        }
        if self.closed_calls.len() >= MAX_CLOSED_CALLS {
            self.closed_calls.pop_front();
        }
        self.closed_calls.push_back(call_id);
    }

    fn is_closed(&self, call_id: &str) -> bool {
        self.closed_calls.iter().any(|id| id == call_id)
    }

    /// Eintrag eines eingehenden Anrufs; verdrängt abgelaufene und notfalls
    /// den am längsten stillen Eintrag
    fn inbound_entry(&mut self, call_id: CallId) -> &mut InboundCall {
        if !self.inbound.contains_key(&call_id) {
            let now = Instant::now();
            let expired: Vec<CallId> = self
                .inbound
                .iter()
                .filter(|(_, call)| now.duration_since(call.last_seen) >= INBOUND_TTL)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                self.evict_inbound(&id);
            }

            if self.inbound.len() >= MAX_INBOUND_CALLS {
                let oldest = self
                    .inbound
                    .iter()
                    .min_by_key(|(_, call)| call.last_seen)
                    .map(|(id, _)| id.clone());
                if let Some(oldest) = oldest {
                    self.evict_inbound(&oldest);
                }
            }
        }

        let entry = self.inbound.entry(call_id).or_insert_with(InboundCall::new);
        entry.last_seen = Instant::now();
        entry
    }

    fn evict_inbound(&mut self, call_id: &str) {
        if let Some(call) = self.inbound.remove(call_id) {
            tracing::debug!("Forgetting stale incoming call {}", call_id);
            if call.offer.is_some() {
                self.emit(SessionEvent::IncomingCallCancelled {
                    call_id: call_id.to_string(),
                });
            }
        }
    }

    /// Geräteabfrage kann blockieren, daher im Blocking-Pool
    fn refresh_audio_devices(&self) {
        let audio = Arc::clone(&self.audio);
        tokio::task::spawn_blocking(move || audio.on_devices_changed());
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.active.as_ref().map(|a| a.epoch) == Some(epoch)
    }

    fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.connected_at.is_some())
            .unwrap_or(false)
    }

    fn update_connected(&mut self, update: impl FnOnce(&mut CallState)) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let mut state = active.session.state.clone();
        update(&mut state);
        if state != active.session.state {
            self.publish_state(state);
        }
    }

    fn publish_state(&mut self, state: CallState) {
        if let Some(active) = self.active.as_mut() {
            active.session.state = state.clone();
            self.outputs.session.send_replace(Some(active.session.clone()));
        }
        tracing::debug!("Call state -> {}", state.name());
        self.outputs.state.send_replace(state.clone());
        self.emit(SessionEvent::StateChanged(state));
    }

    fn send_signaling(&self, message: SignalingMessage) {
        let kind = message.kind();
        if let Err(e) = self.signaling.send(message) {
            tracing::warn!("Failed to send {}: {}", kind, e);
            self.record_error(&CallError::from(e), false);
        }
    }

    fn record_error(&self, error: &CallError, fatal: bool) {
        tracing::debug!("Recorded call error (fatal: {}): {}", fatal, error);
        self.emit(SessionEvent::ErrorRecorded {
            error: error.clone(),
            fatal,
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.outputs.events.send(event);
    }
}

// ============================================================================
// SESSION TASKS
// ============================================================================

/// Führt Media-Aufträge einer Session nacheinander aus und leitet Events weiter
async fn media_worker(
    media: Arc<dyn MediaEngine>,
    previous_dispose: Option<JoinHandle<()>>,
    mut ops: mpsc::UnboundedReceiver<MediaOp>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    epoch: u64,
) {
    // Erst wenn die alte Peer Connection weg ist, gehören Events zu dieser Session
    if let Some(dispose) = previous_dispose {
        let _ = dispose.await;
    }
    let mut events = Some(media.subscribe());

    loop {
        tokio::select! {
            op = ops.recv() => {
                let Some(op) = op else { break };
                let outcome = run_media_op(media.as_ref(), op).await;
                if internal_tx.send(Internal::MediaOp { epoch, outcome }).is_err() {
                    break;
                }
            }
            event = next_event(&mut events, "media") => {
                if internal_tx.send(Internal::Media { epoch, event }).is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_media_op(media: &dyn MediaEngine, op: MediaOp) -> MediaOutcome {
    match op {
        MediaOp::CreateOffer { is_video } => {
            MediaOutcome::OfferCreated(media.create_offer(is_video).await)
        }
        MediaOp::CreateAnswer {
            offer_sdp,
            is_video,
        } => MediaOutcome::AnswerCreated(media.create_answer(&offer_sdp, is_video).await),
        MediaOp::SetRemoteDescription { sdp } => {
            MediaOutcome::RemoteDescriptionSet(media.set_remote_description(&sdp).await)
        }
        MediaOp::AddIceCandidate(candidate) => {
            MediaOutcome::CandidateAdded(media.add_ice_candidate(candidate).await)
        }
        MediaOp::SetVideoEnabled { enabled, reply } => MediaOutcome::VideoEnabled {
            enabled,
            result: media.set_video_enabled(enabled).await,
            reply,
        },
    }
}

/// Nächstes Event eines Broadcast-Kanals; geschlossene Kanäle werden stillgelegt
async fn next_event<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>, source: &str) -> T {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(event) => return event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Lagged behind {} events, skipped {}", source, skipped);
            }
            Err(RecvError::Closed) => {
                tracing::debug!("{} event stream closed", source);
                *rx = None;
            }
        }
    }
}
