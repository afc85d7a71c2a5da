//! Fehler-Taxonomie für Call-Sessions
//!
//! Jede Komponente hat ihren eigenen Fehlertyp (Signaling, Audio, Recording,
//! Media Engine). Auf Session-Ebene wird alles in [`CallError`] überführt,
//! das einen [`ErrorCode`] und eine lesbare Beschreibung trägt.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR CODES
// ============================================================================

/// Fehlerart eines [`CallError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    MediaError,
    PeerDisconnected,
    SignalingError,
    WebRtcError,
    PermissionDenied,
    IceConnectionFailed,
    AudioDeviceError,
    NetworkError,
    InternalError,
    /// Es läuft bereits ein Anruf
    AlreadyInCall,
    /// Operation ist im aktuellen Zustand nicht erlaubt
    InvalidState,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::MediaError => "MEDIA_ERROR",
            ErrorCode::PeerDisconnected => "PEER_DISCONNECTED",
            ErrorCode::SignalingError => "SIGNALING_ERROR",
            ErrorCode::WebRtcError => "WEBRTC_ERROR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::IceConnectionFailed => "ICE_CONNECTION_FAILED",
            ErrorCode::AudioDeviceError => "AUDIO_DEVICE_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::AlreadyInCall => "ALREADY_IN_CALL",
            ErrorCode::InvalidState => "INVALID_STATE",
        }
    }

    /// Fehler der Media Engine beenden die Session immer
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::WebRtcError | ErrorCode::IceConnectionFailed | ErrorCode::MediaError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL ERROR
// ============================================================================

/// Ursprünglicher Fehler hinter einem [`CallError`]
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Session-weiter Fehler mit Code, Beschreibung und optionaler Ursache
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct CallError {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Cause>,
}

impl CallError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Hängt die ursprüngliche Ursache an
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConnectionFailed, message)
    }

    pub fn already_in_call() -> Self {
        Self::new(ErrorCode::AlreadyInCall, "a call is already active")
    }

    pub fn invalid_state(operation: &str, state: &str) -> Self {
        Self::new(
            ErrorCode::InvalidState,
            format!("{} is not allowed in state {}", operation, state),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl PartialEq for CallError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<crate::signaling::SignalingError> for CallError {
    fn from(err: crate::signaling::SignalingError) -> Self {
        use crate::signaling::SignalingError as S;
        let code = match &err {
            S::ConnectionFailed(_) => ErrorCode::NetworkError,
            S::NotConnected | S::SendFailed(_) => ErrorCode::SignalingError,
        };
        CallError::new(code, err.to_string()).with_cause(err)
    }
}

impl From<crate::media::MediaEngineError> for CallError {
    fn from(err: crate::media::MediaEngineError) -> Self {
        use crate::media::MediaEngineError as M;
        let code = match &err {
            M::PermissionDenied(_) => ErrorCode::PermissionDenied,
            M::IceFailed(_) => ErrorCode::IceConnectionFailed,
            M::Codec(_) => ErrorCode::MediaError,
            M::WebRtc(_) | M::InvalidSdp(_) | M::NoPeerConnection => ErrorCode::WebRtcError,
        };
        CallError::new(code, err.to_string()).with_cause(err)
    }
}

impl From<crate::audio::AudioError> for CallError {
    fn from(err: crate::audio::AudioError) -> Self {
        CallError::new(ErrorCode::AudioDeviceError, err.to_string()).with_cause(err)
    }
}

impl From<crate::recording::RecordingError> for CallError {
    fn from(err: crate::recording::RecordingError) -> Self {
        CallError::new(ErrorCode::MediaError, err.to_string()).with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_engine_errors_are_fatal_but_signaling_is_not() {
        assert!(ErrorCode::WebRtcError.is_session_fatal());
        assert!(ErrorCode::IceConnectionFailed.is_session_fatal());
        assert!(!ErrorCode::SignalingError.is_session_fatal());
        assert!(!ErrorCode::AudioDeviceError.is_session_fatal());
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = CallError::new(ErrorCode::NetworkError, "socket closed").with_cause(io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("boom"));
        assert_eq!(err.to_string(), "NETWORK_ERROR: socket closed");
    }
}
