//! Aufnahme über cpal in eine WAV-Datei
//!
//! cpal Streams sind nicht `Send`, daher lebt der Stream in einem eigenen
//! Thread. Der Audio-Callback schreibt in einen Ring-Buffer, der Thread leert
//! ihn alle 20ms in den `hound` Writer. Ist das Mikrofon stummgeschaltet,
//! wird Stille geschrieben, damit die Datei die Länge des Anrufs behält.

use super::{ActiveCapture, CaptureBackend, RecordingError};
use crate::audio::{select_best_config, AudioError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Sprachoptimiert: 16kHz mono reicht für verständliche Aufnahmen
pub const RECORDING_SAMPLE_RATE: u32 = 16000;

/// Ring-Buffer für ~2 Sekunden bei 48kHz
const RING_BUFFER_SIZE: usize = 48000 * 2;

const DRAIN_INTERVAL: Duration = Duration::from_millis(20);

type SampleBuffer = Arc<Mutex<HeapRb<i16>>>;

type MuteFlag = Arc<Mutex<bool>>;

/// Nimmt das Standard-Mikrofon auf
#[derive(Debug, Clone, Default)]
pub struct CpalWavBackend {
    mic_muted: Option<MuteFlag>,
}

impl CpalWavBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Beachtet das Mute-Flag der Audio-Plattform
    pub fn with_mute_flag(mic_muted: MuteFlag) -> Self {
        Self {
            mic_muted: Some(mic_muted),
        }
    }
}

impl CaptureBackend for CpalWavBackend {
    fn start(&self, path: &Path) -> Result<Box<dyn ActiveCapture>, RecordingError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), RecordingError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let path = path.to_path_buf();
        let mic_muted = self.mic_muted.clone().unwrap_or_default();

        let thread = std::thread::Builder::new()
            .name("call-recorder".to_string())
            .spawn(move || run_capture(path, mic_muted, ready_tx, stop_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(WavCapture {
                stop_tx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(RecordingError::Capture(
                "recorder thread exited during startup".to_string(),
            )),
        }
    }
}

struct WavCapture {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<Result<(), RecordingError>>>,
}

impl ActiveCapture for WavCapture {
    fn stop(mut self: Box<Self>) -> Result<(), RecordingError> {
        let _ = self.stop_tx.send(());
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| RecordingError::Capture("recorder thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Läuft im Recorder-Thread bis zum Stop-Signal
fn run_capture(
    path: PathBuf,
    mic_muted: MuteFlag,
    ready_tx: mpsc::Sender<Result<(), RecordingError>>,
    stop_rx: mpsc::Receiver<()>,
) -> Result<(), RecordingError> {
    let buffer: SampleBuffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));

    let (stream, mut writer) = match open_stream(&path, Arc::clone(&buffer), mic_muted) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };
    let _ = ready_tx.send(Ok(()));

    loop {
        match stop_rx.recv_timeout(DRAIN_INTERVAL) {
            Err(mpsc::RecvTimeoutError::Timeout) => drain(&buffer, &mut writer)?,
            _ => break,
        }
    }

    drop(stream);
    drain(&buffer, &mut writer)?;
    writer.finalize()?;
    tracing::debug!("Recorder thread finished: {:?}", path);
    Ok(())
}

fn open_stream(
    path: &Path,
    buffer: SampleBuffer,
    mic_muted: MuteFlag,
) -> Result<(Stream, hound::WavWriter<BufWriter<File>>), RecordingError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
    let (config, format) = select_best_config(configs.collect(), RECORDING_SAMPLE_RATE)?;

    tracing::info!(
        "Starting call recording: {} Hz, {} channels, {:?}",
        config.sample_rate.0,
        config.channels,
        format
    );

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: config.sample_rate.0,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let writer = hound::WavWriter::create(path, spec)?;

    let stream = build_stream(&device, &config, format, buffer, mic_muted)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok((stream, writer))
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    format: SampleFormat,
    buffer: SampleBuffer,
    mic_muted: MuteFlag,
) -> Result<Stream, AudioError> {
    let channels = config.channels.max(1) as usize;
    let on_error = |err| tracing::error!("Recording capture error: {}", err);

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let muted = *mic_muted.lock();
                push_mono(&buffer, data.chunks(channels).map(mix_f32), muted);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let muted = *mic_muted.lock();
                push_mono(&buffer, data.chunks(channels).map(mix_i16), muted);
            },
            on_error,
            None,
        ),
        other => {
            return Err(AudioError::UnsupportedConfig(format!(
                "sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

/// Downmix eines Frames auf Mono
fn mix_f32(frame: &[f32]) -> i16 {
    let mono = frame.iter().sum::<f32>() / frame.len() as f32;
    (mono.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn mix_i16(frame: &[i16]) -> i16 {
    (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16
}

fn push_mono(buffer: &SampleBuffer, samples: impl Iterator<Item = i16>, muted: bool) {
    let mut buffer = buffer.lock();
    for sample in samples {
        let _ = buffer.try_push(if muted { 0 } else { sample });
    }
}

fn drain(
    buffer: &SampleBuffer,
    writer: &mut hound::WavWriter<BufWriter<File>>,
) -> Result<(), RecordingError> {
    let samples: Vec<i16> = {
        let mut buffer = buffer.lock();
        std::iter::from_fn(|| buffer.try_pop()).collect()
    };
    for sample in samples {
        writer.write_sample(sample)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> SampleBuffer {
        Arc::new(Mutex::new(HeapRb::new(16)))
    }

    fn drain_all(buffer: &SampleBuffer) -> Vec<i16> {
        let mut buffer = buffer.lock();
        std::iter::from_fn(|| buffer.try_pop()).collect()
    }

    #[test]
    fn stereo_frames_are_mixed_down() {
        let buffer = buffer();
        let data = [1.0f32, 0.0, -1.0, -1.0];
        push_mono(&buffer, data.chunks(2).map(mix_f32), false);

        assert_eq!(drain_all(&buffer), vec![i16::MAX / 2, -i16::MAX]);
    }

    #[test]
    fn muted_microphone_records_silence() {
        let buffer = buffer();
        let data = [1200i16, 800, -400, -400];
        push_mono(&buffer, data.chunks(2).map(mix_i16), true);

        assert_eq!(drain_all(&buffer), vec![0, 0]);
    }
}
