//! Datenmodell einer Call-Session

use crate::audio::AudioRouteEvent;
use crate::error::{CallError, ErrorCode};
use crate::quality::{CallStats, QualityWarning};
use crate::recording::RecordingState;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub type CallId = String;

/// Gründe, mit denen ein Anruf endet
pub mod reason {
    pub const LOCAL_HANGUP: &str = "hangup";
    pub const REMOTE_HANGUP: &str = "remote_hangup";
    pub const REJECTED: &str = "rejected";
    pub const TIMEOUT: &str = "timeout";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Gegenstelle eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl Peer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Verbindung wird ausgehandelt
    Connecting { peer: Peer, is_video: bool },
    /// Anruf aktiv
    Connected {
        peer: Peer,
        is_video: bool,
        start_time: DateTime<Utc>,
        is_muted: bool,
        is_video_enabled: bool,
    },
    /// Anruf beendet
    Ended { reason: String, duration_ms: u64 },
    /// Anruf wegen eines Fehlers abgebrochen
    Error { code: ErrorCode, message: String },
}

impl CallState {
    /// `Connecting` oder `Connected`
    pub fn is_active(&self) -> bool {
        matches!(self, CallState::Connecting { .. } | CallState::Connected { .. })
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Connecting { .. } => "Connecting",
            CallState::Connected { .. } => "Connected",
            CallState::Ended { .. } => "Ended",
            CallState::Error { .. } => "Error",
        }
    }
}

/// Eine Session = ein Anrufversuch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSession {
    pub id: CallId,
    pub peer: Peer,
    pub is_video: bool,
    pub state: CallState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Eingehender Anruf, wartet auf Annahme oder Ablehnung
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller: Peer,
    pub is_video: bool,
    pub offer_sdp: String,
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Benachrichtigungen für UI und Analytics
#[derive(Debug, Clone)]
pub enum SessionEvent {
    IncomingCall(IncomingCall),
    /// Anrufer hat aufgelegt, bevor wir angenommen haben
    IncomingCallCancelled { call_id: CallId },
    StateChanged(CallState),
    StatsUpdated(CallStats),
    QualityWarning(QualityWarning),
    DurationTick { call_id: CallId, duration_ms: u64 },
    AudioRoute(AudioRouteEvent),
    Recording(RecordingState),
    /// Jeder Fehler landet hier, auch wenn er den Anruf nicht beendet
    ErrorRecorded { error: CallError, fatal: bool },
}
