//! WebSocket Kanal zum Signaling-Server
//!
//! Verwaltet die persistente WebSocket-Verbindung:
//! - Verbindungsaufbau mit der Identität des Anrufers
//! - Ping-Keepalive
//! - Best-effort Senden (nicht blockierend)
//! - Event-basierte Zustellung geparster Nachrichten

use super::messages::{self, SignalingMessage};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events des Signaling-Kanals
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Geparste Nachricht (inklusive `SignalingError`)
    Message(SignalingMessage),
}

// ============================================================================
// PORT
// ============================================================================

/// Schmale Schnittstelle, über die die Session mit dem Signaling spricht
pub trait SignalingPort: Send + Sync {
    /// Best-effort senden, darf nie blockieren
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;
}

// ============================================================================
// CHANNEL STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ChannelState {
    is_connected: bool,
    identity: Option<String>,
}

/// Laufende Verbindung: Sender zum Write-Task plus beide Tasks
struct Connection {
    tx: mpsc::Sender<String>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// WebSocket-basierter Signaling-Kanal
pub struct SignalingChannel {
    server_url: String,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ChannelState>>,
    connection: Mutex<Option<Connection>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingChannel {
    pub fn new(server_url: String, heartbeat_interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url,
            heartbeat_interval,
            state: Arc::new(RwLock::new(ChannelState::default())),
            connection: Mutex::new(None),
            event_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn identity(&self) -> Option<String> {
        self.state.read().identity.clone()
    }

    /// Baut die WebSocket URL für eine Identität
    ///
    /// `http(s)://host/base` wird zu `ws(s)://host/base/ws?userId=<identity>`.
    pub fn endpoint_url(server_url: &str, identity: &str) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(server_url).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::ConnectionFailed(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::ConnectionFailed("cannot set scheme".to_string()))?;

        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut().clear().append_pair("userId", identity);
        Ok(url)
    }

    /// Verbindet mit dem Signaling-Server
    ///
    /// Fehler werden nicht zurückgegeben, sondern als
    /// `SignalingMessage::SignalingError` auf dem Event-Stream gemeldet.
    pub async fn connect(&self, identity: &str) {
        self.disconnect();

        let url = match Self::endpoint_url(&self.server_url, identity) {
            Ok(url) => url,
            Err(e) => {
                self.report_error(e);
                return;
            }
        };

        tracing::info!("Connecting to signaling server: {}", url);

        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.report_error(SignalingError::ConnectionFailed(e.to_string()));
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.identity = Some(identity.to_string());
        }

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let read_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => Self::handle_text(&text, &event_tx),
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task mit Ping-Keepalive
        let heartbeat_interval = self.heartbeat_interval;
        let write_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            tracing::warn!("Failed to send heartbeat: {}", e);
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        *self.connection.lock() = Some(Connection {
            tx,
            read_task,
            write_task,
        });

        let _ = self.event_tx.send(SignalingEvent::Connected);
    }

    /// Trennt die Verbindung; mehrfach aufrufbar
    pub fn disconnect(&self) {
        let connection = self.connection.lock().take();
        let was_connected = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.is_connected, false)
        };

        if connection.is_some() {
            tracing::info!("Disconnecting from signaling server");
        }
        drop(connection);

        if was_connected {
            let _ = self.event_tx.send(SignalingEvent::Disconnected);
        }
    }

    /// Verarbeitet einen Text-Frame vom Server
    fn handle_text(text: &str, event_tx: &broadcast::Sender<SignalingEvent>) {
        match messages::decode(text) {
            Ok(Some(msg)) => {
                tracing::debug!("Received {} (call {:?})", msg.kind(), msg.call_id());
                let _ = event_tx.send(SignalingEvent::Message(msg));
            }
            Ok(None) => {
                tracing::debug!("Ignoring signaling message of unknown type");
            }
            Err(e) => {
                tracing::warn!("Dropping malformed signaling payload: {}", e);
            }
        }
    }

    fn report_error(&self, err: SignalingError) {
        tracing::error!("Signaling connection error: {}", err);
        let _ = self
            .event_tx
            .send(SignalingEvent::Message(SignalingMessage::SignalingError {
                message: err.to_string(),
            }));
    }
}

impl SignalingPort for SignalingChannel {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let json =
            messages::encode(&message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        let connection = self.connection.lock();
        let Some(connection) = connection.as_ref() else {
            tracing::warn!("Dropping {}: not connected", message.kind());
            return Err(SignalingError::NotConnected);
        };

        // try_send ist non-blocking
        connection.tx.try_send(json).map_err(|e| {
            tracing::warn!("Failed to queue {}: {}", message.kind(), e);
            SignalingError::SendFailed(e.to_string())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.connection.lock().take();
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_maps_scheme_and_adds_identity() {
        let url = SignalingChannel::endpoint_url("https://signal.example.com/api/", "alice").unwrap();
        assert_eq!(url.as_str(), "wss://signal.example.com/api/ws?userId=alice");

        let url = SignalingChannel::endpoint_url("http://localhost:8787", "bob").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8787/ws?userId=bob");
    }

    #[test]
    fn send_without_connection_fails_softly() {
        let channel = SignalingChannel::new("http://localhost".into(), Duration::from_secs(25));
        let result = channel.send(SignalingMessage::End {
            call_id: "c1".into(),
            reason: None,
        });
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let channel = SignalingChannel::new("http://localhost".into(), Duration::from_secs(25));
        let mut events = channel.subscribe();
        channel.disconnect();
        channel.disconnect();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_failure_is_reported_as_event() {
        let channel = SignalingChannel::new("ftp://nowhere".into(), Duration::from_secs(25));
        let mut events = channel.subscribe();
        channel.connect("alice").await;

        match events.recv().await.unwrap() {
            SignalingEvent::Message(SignalingMessage::SignalingError { message }) => {
                assert!(message.contains("unsupported scheme"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!channel.is_connected());
    }
}
