//! Pulse Call - Orchestrierung von Sprach- und Videoanrufen
//!
//! Eine Call-Session verbindet:
//! - WebSocket Signaling für SDP Offer/Answer, ICE Candidates und Call-Ende
//! - WebRTC als Media Engine (Peer Connection, Tracks, Transport-Statistiken)
//! - Audio-Routing (Hörmuschel, Lautsprecher, Headset, Bluetooth)
//! - Qualitätsüberwachung mit rate-limitierten Warnungen
//! - Optionale Aufnahme des Anrufs
//!
//! Der Zustand einer Session gehört genau einem Actor-Task; alle anderen
//! Komponenten sprechen über Kanäle mit ihm.

pub mod audio;
pub mod config;
pub mod error;
pub mod media;
pub mod quality;
pub mod recording;
pub mod session;
pub mod signaling;

pub use config::CallConfig;
pub use error::{CallError, ErrorCode};
pub use session::{
    CallId, CallSession, CallSessionManager, CallState, IncomingCall, Peer, SessionDeps,
    SessionEvent,
};

use tracing_subscriber::EnvFilter;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "pulse_call=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Mehrfache Aufrufe sind harmlos; ein bereits gesetzter Subscriber bleibt.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
}
