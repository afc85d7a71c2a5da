//! WebRTC Media Engine
//!
//! Implementiert [`MediaEngine`] mit dem `webrtc` Crate: Peer Connection,
//! lokale Tracks (Opus, optional VP8), Candidate-Weiterleitung und ein
//! Statistik-Task, der periodisch `get_stats()` ausliest.

use super::{MediaConnectionState, MediaEngine, MediaEngineError, MediaEvent, TrackKind};
use crate::config::IceServerConfig;
use crate::quality::RawStats;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Opus läuft immer mit 48kHz
const OPUS_CLOCK_RATE: u32 = 48000;

const VIDEO_CLOCK_RATE: u32 = 90000;

/// Abstand zwischen zwei `get_stats()` Abfragen
const STATS_INTERVAL: Duration = Duration::from_secs(2);

fn rtc_err(e: webrtc::Error) -> MediaEngineError {
    MediaEngineError::WebRtc(e.to_string())
}

// ============================================================================
// PEER STATE
// ============================================================================

struct Peer {
    connection: Arc<RTCPeerConnection>,
    video_sender: Option<Arc<RTCRtpSender>>,
    video_track: Option<Arc<TrackLocalStaticRTP>>,
    stats_task: JoinHandle<()>,
}

// ============================================================================
// WEBRTC MEDIA ENGINE
// ============================================================================

pub struct WebRtcMediaEngine {
    ice_servers: Vec<RTCIceServer>,
    peer: Mutex<Option<Peer>>,
    event_tx: broadcast::Sender<MediaEvent>,
}

impl WebRtcMediaEngine {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        Self {
            ice_servers,
            peer: Mutex::new(None),
            event_tx,
        }
    }

    fn connection(&self) -> Result<Arc<RTCPeerConnection>, MediaEngineError> {
        self.peer
            .lock()
            .as_ref()
            .map(|p| Arc::clone(&p.connection))
            .ok_or(MediaEngineError::NoPeerConnection)
    }

    /// Erstellt eine neue Peer Connection samt lokalen Tracks
    async fn create_peer(
        &self,
        is_video: bool,
    ) -> Result<Arc<RTCPeerConnection>, MediaEngineError> {
        self.dispose().await;

        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = RtcMediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);
        self.setup_handlers(&pc);

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "pulse-call".to_string(),
        ));
        pc.add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_err)?;

        let (video_sender, video_track) = if is_video {
            let track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
                "video".to_string(),
                "pulse-call".to_string(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
            (Some(sender), Some(track))
        } else {
            (None, None)
        };

        let stats_task = tokio::spawn(Self::poll_stats(Arc::clone(&pc), self.event_tx.clone()));

        *self.peer.lock() = Some(Peer {
            connection: Arc::clone(&pc),
            video_sender,
            video_track,
            stats_task,
        });

        Ok(pc)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            let state = match s {
                RTCPeerConnectionState::New => Some(MediaConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(MediaConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(MediaConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(MediaConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(MediaConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(MediaConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                let _ = event_tx.send(MediaEvent::ConnectionStateChanged(state));
            }

            Box::pin(async {})
        }));

        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = event_tx.send(MediaEvent::LocalIceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                tracing::info!("Received remote {:?} track: {:?}", kind, track.codec());
                let _ = event_tx.send(MediaEvent::RemoteTrack(kind));
            })
        }));
    }

    /// Liest periodisch die Transport-Statistiken aus
    ///
    /// Die Zähler von `get_stats()` sind kumulativ, daher werden Bitraten und
    /// Verlustrate aus der Differenz zum letzten Sample berechnet.
    async fn poll_stats(pc: Arc<RTCPeerConnection>, event_tx: broadcast::Sender<MediaEvent>) {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut previous: Option<(tokio::time::Instant, TransportCounters)> = None;

        loop {
            interval.tick().await;

            let report = pc.get_stats().await;
            let mut counters = TransportCounters::default();
            for stat in report.reports.values() {
                match stat {
                    StatsReportType::CandidatePair(pair) if pair.nominated => {
                        counters.bytes_sent += pair.bytes_sent;
                        counters.bytes_received += pair.bytes_received;
                        counters.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                    }
                    StatsReportType::RemoteInboundRTP(remote) => {
                        counters.packets_lost += remote.packets_lost.max(0) as u64;
                        counters.packets_received += remote.packets_received;
                    }
                    _ => {}
                }
            }

            let now = tokio::time::Instant::now();
            if let Some((at, last)) = previous.as_ref() {
                let sample = counters.sample_since(last, now.duration_since(*at));
                let _ = event_tx.send(MediaEvent::StatsSample(sample));
            }
            previous = Some((now, counters));
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TransportCounters {
    bytes_sent: u64,
    bytes_received: u64,
    packets_lost: u64,
    packets_received: u64,
    rtt_ms: Option<f64>,
}

impl TransportCounters {
    fn sample_since(&self, last: &TransportCounters, elapsed: Duration) -> RawStats {
        let secs = elapsed.as_secs_f64().max(0.001);
        let kbps = |now: u64, before: u64| now.saturating_sub(before) as f64 * 8.0 / 1000.0 / secs;

        let lost = self.packets_lost.saturating_sub(last.packets_lost);
        let received = self.packets_received.saturating_sub(last.packets_received);
        let tx_loss = if lost + received > 0 {
            Some(lost as f64 * 100.0 / (lost + received) as f64)
        } else {
            None
        };

        RawStats {
            tx_bitrate_kbps: kbps(self.bytes_sent, last.bytes_sent),
            rx_bitrate_kbps: kbps(self.bytes_received, last.bytes_received),
            tx_packet_loss_percent: tx_loss,
            rx_packet_loss_percent: None,
            rtt_ms: self.rtt_ms,
        }
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn create_offer(&self, is_video: bool) -> Result<String, MediaEngineError> {
        let pc = self.create_peer(is_video).await?;

        let offer = pc.create_offer(None).await.map_err(rtc_err)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;

        Ok(offer.sdp)
    }

    async fn create_answer(
        &self,
        offer_sdp: &str,
        is_video: bool,
    ) -> Result<String, MediaEngineError> {
        let pc = self.create_peer(is_video).await?;

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| MediaEngineError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer).await.map_err(rtc_err)?;

        let answer = pc.create_answer(None).await.map_err(rtc_err)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;

        Ok(answer.sdp)
    }

    async fn set_remote_description(&self, answer_sdp: &str) -> Result<(), MediaEngineError> {
        let pc = self.connection()?;

        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| MediaEngineError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(answer).await.map_err(rtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaEngineError> {
        let pc = self.connection()?;

        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        })
        .await
        .map_err(rtc_err)
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaEngineError> {
        let (sender, track) = {
            let peer = self.peer.lock();
            let peer = peer.as_ref().ok_or(MediaEngineError::NoPeerConnection)?;
            (peer.video_sender.clone(), peer.video_track.clone())
        };

        let (Some(sender), Some(track)) = (sender, track) else {
            return Err(MediaEngineError::Codec("session has no video track".to_string()));
        };

        let replacement = if enabled {
            Some(track as Arc<dyn TrackLocal + Send + Sync>)
        } else {
            None
        };
        sender.replace_track(replacement).await.map_err(rtc_err)
    }

    async fn dispose(&self) {
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            peer.stats_task.abort();
            if let Err(e) = peer.connection.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
            tracing::debug!("Peer connection disposed");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for WebRtcMediaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcMediaEngine")
            .field("ice_servers", &self.ice_servers.len())
            .field("has_peer", &self.peer.lock().is_some())
            .finish()
    }
}
