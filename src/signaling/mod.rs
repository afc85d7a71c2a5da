//! Signaling Module - WebSocket Kanal zum Signaling-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Nachrichten serialisieren und best-effort senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!
//! Zustellung ist nicht garantiert. Es gibt bewusst kein Retry/Backoff:
//! verlorene Nachrichten während des Verbindungsaufbaus führen höchstens zu
//! einem Connect-Timeout der Session.

mod client;
mod messages;

pub use client::{SignalingChannel, SignalingError, SignalingEvent, SignalingPort};
pub use messages::*;
