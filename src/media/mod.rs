//! Media Engine Schnittstelle
//!
//! Die Session spricht nie direkt mit WebRTC, sondern nur über
//! [`MediaEngine`]. Die Engine besitzt Peer Connection und Tracks und meldet
//! Zustandsänderungen, lokale ICE Candidates und Transport-Statistiken als
//! [`MediaEvent`].

mod rtc;

pub use rtc::WebRtcMediaEngine;

use crate::quality::RawStats;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaEngineError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("ICE connection failed: {0}")]
    IceFailed(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No active peer connection")]
    NoPeerConnection,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Zustand der Peer Connection, wie ihn die Engine meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Callbacks der Media Engine
#[derive(Debug, Clone)]
pub enum MediaEvent {
    ConnectionStateChanged(MediaConnectionState),
    /// Lokal gesammelter Candidate, muss zum Peer
    LocalIceCandidate(IceCandidate),
    RemoteTrack(TrackKind),
    StatsSample(RawStats),
    VideoResolutionChanged { width: u32, height: u32 },
    /// Unerwarteter Fehler (Codec, Transport); beendet die Session
    Failure(MediaEngineError),
}

// ============================================================================
// MEDIA ENGINE
// ============================================================================

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Erstellt eine Peer Connection und gibt das lokale SDP Offer zurück
    async fn create_offer(&self, is_video: bool) -> Result<String, MediaEngineError>;

    /// Setzt das Remote Offer und gibt das lokale SDP Answer zurück
    async fn create_answer(&self, offer_sdp: &str, is_video: bool)
        -> Result<String, MediaEngineError>;

    /// Setzt das Remote Answer des Angerufenen
    async fn set_remote_description(&self, answer_sdp: &str) -> Result<(), MediaEngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaEngineError>;

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaEngineError>;

    /// Schließt die Peer Connection; mehrfach aufrufbar
    async fn dispose(&self);

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}
