//! Kommandozeilen-Client für Testanrufe
//!
//! ```text
//! pulse-call <identity>                  wartet auf Anrufe und nimmt sie an
//! pulse-call <identity> <peer> [--video] ruft <peer> an
//! ```

use anyhow::{bail, Context, Result};
use pulse_call::audio::{AudioRouteManager, CpalAudioPlatform, DEVICE_POLL_INTERVAL};
use pulse_call::media::WebRtcMediaEngine;
use pulse_call::recording::{CallRecordingManager, CpalWavBackend};
use pulse_call::session::reason;
use pulse_call::signaling::SignalingChannel;
use pulse_call::{CallConfig, CallSessionManager, CallState, Peer, SessionDeps, SessionEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    pulse_call::init_tracing();

    let mut args = std::env::args().skip(1);
    let Some(identity) = args.next() else {
        bail!("usage: pulse-call <identity> [peer] [--video]");
    };
    let rest: Vec<String> = args.collect();
    let is_video = rest.iter().any(|a| a == "--video");
    let peer_id = rest.into_iter().find(|a| !a.starts_with("--"));

    let config = CallConfig::load().context("failed to load call config")?;
    tracing::info!("Using signaling server {}", config.signaling_url);

    let signaling = Arc::new(SignalingChannel::new(
        config.signaling_url.clone(),
        config.heartbeat_interval(),
    ));
    let platform = Arc::new(CpalAudioPlatform::new());
    let device_watcher = platform.start_device_watcher(DEVICE_POLL_INTERVAL);
    let recorder = Arc::new(CallRecordingManager::new(
        Arc::new(CpalWavBackend::with_mute_flag(platform.microphone_mute_flag())),
        config.recordings_dir.clone(),
    ));
    let audio = Arc::new(AudioRouteManager::new(platform));

    let manager = CallSessionManager::spawn(
        &config,
        SessionDeps {
            media: Arc::new(WebRtcMediaEngine::new(&config.ice_servers)),
            signaling: signaling.clone(),
            audio,
            recorder: Some(recorder),
        },
    );

    let mut events = manager.subscribe();
    signaling.connect(&identity).await;
    if !signaling.is_connected() {
        bail!("could not connect to {}", config.signaling_url);
    }

    if let Some(peer_id) = peer_id {
        let call_id = manager
            .start_call(Peer::new(peer_id.clone(), peer_id), is_video)
            .await
            .context("failed to start call")?;
        println!("calling... (call {})", call_id);
    } else {
        println!("waiting for calls as {}", identity);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if manager.state().is_active() {
                    let _ = manager.end_call(reason::LOCAL_HANGUP).await;
                }
                break;
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                match event {
                    SessionEvent::IncomingCall(incoming) => {
                        println!("incoming call from {}", incoming.caller.id);
                        if let Err(e) = manager
                            .accept_incoming_call(&incoming.call_id, &incoming.offer_sdp)
                            .await
                        {
                            eprintln!("failed to accept: {}", e);
                        }
                    }
                    SessionEvent::StateChanged(state) => {
                        println!("state: {:?}", state);
                        if matches!(state, CallState::Ended { .. } | CallState::Error { .. }) {
                            break;
                        }
                    }
                    SessionEvent::QualityWarning(warning) => {
                        for notice in &warning.notices {
                            println!("quality: {} - {}", notice.issue, notice.recommendation);
                        }
                    }
                    SessionEvent::ErrorRecorded { error, fatal } => {
                        eprintln!("error (fatal: {}): {}", fatal, error);
                    }
                    _ => {}
                }
            }
        }
    }

    manager.shutdown().await;
    device_watcher.abort();
    signaling.disconnect();
    Ok(())
}
