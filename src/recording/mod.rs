//! Recording Module - Aufnahme eines Anrufs
//!
//! Optional und an die Session gebunden: die Aufnahme endet spätestens mit
//! dem Anruf. Fehler der Aufnahme beenden nie den Anruf.

mod manager;
mod wav;

pub use manager::CallRecordingManager;
pub use wav::CpalWavBackend;

use crate::audio::AudioError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Recording I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Failed to write WAV file: {0}")]
    Wav(#[from] hound::Error),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Recording was stopped while starting")]
    Cancelled,
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecordingState {
    Idle,
    Recording {
        started_at: DateTime<Utc>,
        file_path: PathBuf,
    },
    Completed {
        file_path: PathBuf,
        duration_ms: u64,
    },
    Error {
        message: String,
    },
}

// ============================================================================
// BACKEND
// ============================================================================

/// Startet die eigentliche Audio-Aufnahme in eine Datei
pub trait CaptureBackend: Send + Sync {
    fn start(&self, path: &Path) -> Result<Box<dyn ActiveCapture>, RecordingError>;
}

/// Laufende Aufnahme
pub trait ActiveCapture: Send {
    /// Stoppt die Aufnahme und schließt die Datei ab
    fn stop(self: Box<Self>) -> Result<(), RecordingError>;
}
