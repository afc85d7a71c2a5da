use super::{ActiveCapture, CaptureBackend, RecordingError, RecordingState};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

struct Inner {
    state: RecordingState,
    capture: Option<Box<dyn ActiveCapture>>,
    started: Option<Instant>,
    /// Ziel einer Aufnahme, deren Capture gerade hochfährt
    starting: Option<PathBuf>,
    /// Stop kam, während die Aufnahme noch hochfuhr
    cancelled: bool,
}

/// Nimmt das Audio eines Anrufs in eine Datei auf
pub struct CallRecordingManager {
    backend: Arc<dyn CaptureBackend>,
    output_dir: PathBuf,
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<RecordingState>,
}

impl CallRecordingManager {
    pub fn new(backend: Arc<dyn CaptureBackend>, output_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            backend,
            output_dir,
            inner: Mutex::new(Inner {
                state: RecordingState::Idle,
                capture: None,
                started: None,
                starting: None,
                cancelled: false,
            }),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingState> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> RecordingState {
        self.inner.lock().state.clone()
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.inner.lock().state, RecordingState::Recording { .. })
    }

    /// Startet eine Aufnahme für `call_id`
    ///
    /// Läuft bereits eine Aufnahme, wird deren Pfad zurückgegeben. Der Lock
    /// wird während des Capture-Starts nicht gehalten.
    pub fn start_recording(&self, call_id: &str) -> Result<PathBuf, RecordingError> {
        let path = {
            let mut inner = self.inner.lock();
            if let RecordingState::Recording { file_path, .. } = &inner.state {
                tracing::debug!("Recording already running: {:?}", file_path);
                return Ok(file_path.clone());
            }
            if let Some(path) = &inner.starting {
                tracing::debug!("Recording already starting: {:?}", path);
                return Ok(path.clone());
            }
            let path = self.output_path(call_id);
            inner.starting = Some(path.clone());
            inner.cancelled = false;
            path
        };

        let started = self.prepare_and_start(&path);

        let mut inner = self.inner.lock();
        inner.starting = None;
        let cancelled = std::mem::take(&mut inner.cancelled);

        match started {
            Ok(capture) if cancelled => {
                drop(inner);
                tracing::info!("Recording of call {} stopped before it started", call_id);
                if let Err(e) = capture.stop() {
                    tracing::warn!("Failed to close cancelled recording: {}", e);
                }
                Err(RecordingError::Cancelled)
            }
            Ok(capture) => {
                tracing::info!("Recording call {} to {:?}", call_id, path);
                inner.capture = Some(capture);
                inner.started = Some(Instant::now());
                self.set_state(
                    &mut inner,
                    RecordingState::Recording {
                        started_at: Utc::now(),
                        file_path: path.clone(),
                    },
                );
                Ok(path)
            }
            Err(e) => {
                tracing::error!("Failed to start recording: {}", e);
                self.set_state(
                    &mut inner,
                    RecordingState::Error {
                        message: e.to_string(),
                    },
                );
                self.set_state(&mut inner, RecordingState::Idle);
                Err(e)
            }
        }
    }

    /// Stoppt die laufende Aufnahme
    ///
    /// Gibt Pfad und Dauer zurück; ohne laufende Aufnahme `Ok(None)`. Fährt
    /// die Aufnahme gerade hoch, wird sie direkt nach dem Start wieder beendet.
    /// Danach ist der Zustand immer wieder `Idle`.
    pub fn stop_recording(&self) -> Result<Option<(PathBuf, u64)>, RecordingError> {
        let mut inner = self.inner.lock();
        let file_path = match &inner.state {
            RecordingState::Recording { file_path, .. } => file_path.clone(),
            _ => {
                if inner.starting.is_some() {
                    tracing::debug!("Stop requested while recording is starting");
                    inner.cancelled = true;
                }
                return Ok(None);
            }
        };

        let duration_ms = inner
            .started
            .take()
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let result = match inner.capture.take() {
            Some(capture) => capture.stop(),
            None => Ok(()),
        };

        let outcome = match result {
            Ok(()) => {
                tracing::info!("Recording finished: {:?} ({} ms)", file_path, duration_ms);
                self.set_state(
                    &mut inner,
                    RecordingState::Completed {
                        file_path: file_path.clone(),
                        duration_ms,
                    },
                );
                Ok(Some((file_path, duration_ms)))
            }
            Err(e) => {
                tracing::error!("Failed to stop recording: {}", e);
                self.set_state(
                    &mut inner,
                    RecordingState::Error {
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        };

        self.set_state(&mut inner, RecordingState::Idle);
        outcome
    }

    /// Löscht eine Aufnahme (best-effort)
    pub fn delete_recording(&self, path: &Path) -> bool {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!("Deleted recording {:?}", path);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to delete recording {:?}: {}", path, e);
                false
            }
        }
    }

    fn prepare_and_start(&self, path: &Path) -> Result<Box<dyn ActiveCapture>, RecordingError> {
        std::fs::create_dir_all(&self.output_dir)?;
        self.backend.start(path)
    }

    /// Eindeutiger Dateiname: Call-ID, Zeitstempel und Zufallssuffix
    fn output_path(&self, call_id: &str) -> PathBuf {
        let safe_id: String = call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            "call_{}_{}_{}.wav",
            safe_id,
            Utc::now().format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        );
        self.output_dir.join(name)
    }

    fn set_state(&self, inner: &mut Inner, state: RecordingState) {
        inner.state = state.clone();
        let _ = self.event_tx.send(state);
    }
}

impl std::fmt::Debug for CallRecordingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRecordingManager")
            .field("output_dir", &self.output_dir)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct NoopCapture;

    impl ActiveCapture for NoopCapture {
        fn stop(self: Box<Self>) -> Result<(), RecordingError> {
            Ok(())
        }
    }

    struct NoopBackend;

    impl CaptureBackend for NoopBackend {
        fn start(&self, _path: &Path) -> Result<Box<dyn ActiveCapture>, RecordingError> {
            Ok(Box::new(NoopCapture))
        }
    }

    /// Start blockiert, bis der Test ihn freigibt
    struct GatedBackend {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl CaptureBackend for GatedBackend {
        fn start(&self, _path: &Path) -> Result<Box<dyn ActiveCapture>, RecordingError> {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
            Ok(Box::new(NoopCapture))
        }
    }

    #[test]
    fn stop_during_start_cancels_without_waiting_for_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let backend = GatedBackend {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let manager = Arc::new(CallRecordingManager::new(
            Arc::new(backend),
            dir.path().to_path_buf(),
        ));

        let starter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.start_recording("c1"))
        };
        entered_rx.recv().unwrap();

        assert!(!manager.is_recording());
        assert!(manager.stop_recording().unwrap().is_none());

        release_tx.send(()).unwrap();
        let result = starter.join().unwrap();
        assert!(matches!(result, Err(RecordingError::Cancelled)));
        assert_eq!(manager.state(), RecordingState::Idle);
    }

    #[test]
    fn call_id_is_sanitized_in_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CallRecordingManager::new(Arc::new(NoopBackend), dir.path().to_path_buf());

        let path = manager.output_path("../a b/c");
        let name = path.file_name().unwrap().to_string_lossy().to_string();

        assert_eq!(path.parent(), Some(dir.path()));
        assert!(name.starts_with("call____a_b_c_"), "{}", name);
    }

    #[traced_test]
    #[test]
    fn start_and_stop_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CallRecordingManager::new(Arc::new(NoopBackend), dir.path().to_path_buf());

        manager.start_recording("c1").unwrap();
        manager.stop_recording().unwrap();

        assert!(logs_contain("Recording call c1"));
        assert!(logs_contain("Recording finished"));
    }
}
