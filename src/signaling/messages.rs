//! Message Types für das Signaling-Protokoll
//!
//! [`SignalingMessage`] ist die typsichere Sicht der Session auf das
//! Protokoll. Auf dem Draht ist jede Nachricht ein JSON-Objekt mit einem
//! `type`-Diskriminator:
//!
//! | type            | Felder                                               |
//! |-----------------|------------------------------------------------------|
//! | `call_offer`    | `callId`, `receiverId`, `callerId?`, `callType`, `sdp` |
//! | `call_answer`   | `callId`, `accepted`, `sdp?`                         |
//! | `ice_candidate` | `callId`, `candidate`, `sdpMid`, `sdpMLineIndex`     |
//! | `call_end`      | `callId`, `reason?`                                  |
//! | `error`         | `message`                                            |
//!
//! Unbekannte `type`-Werte werden ignoriert, kaputte Payloads als
//! [`WireError`] gemeldet.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message has no string 'type' field")]
    MissingType,

    #[error("Field '{field}' is required for '{msg_type}'")]
    MissingField {
        msg_type: &'static str,
        field: &'static str,
    },
}

// ============================================================================
// DOMAIN MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn from_video_flag(is_video: bool) -> Self {
        if is_video {
            CallType::Video
        } else {
            CallType::Voice
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, CallType::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "VOICE",
            CallType::Video => "VIDEO",
        }
    }
}

/// ICE Candidate, wie er zwischen Peers ausgetauscht wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: u16,
}

/// Alle Nachrichten, die über den Signaling-Kanal laufen
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    /// SDP Offer an den Angerufenen
    Offer {
        call_id: String,
        callee_id: String,
        /// Nur gesetzt, wenn der Server das Offer an uns weiterleitet
        caller_id: Option<String>,
        call_type: CallType,
        sdp: String,
    },

    /// Antwort auf ein Offer (angenommen mit SDP oder abgelehnt)
    Answer {
        call_id: String,
        accepted: bool,
        sdp: Option<String>,
    },

    IceCandidate {
        call_id: String,
        candidate: IceCandidate,
    },

    End {
        call_id: String,
        reason: Option<String>,
    },

    /// Fehler vom Server oder vom Transport, noch keiner Session zugeordnet
    SignalingError { message: String },
}

impl SignalingMessage {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { call_id, .. }
            | SignalingMessage::Answer { call_id, .. }
            | SignalingMessage::IceCandidate { call_id, .. }
            | SignalingMessage::End { call_id, .. } => Some(call_id),
            SignalingMessage::SignalingError { .. } => None,
        }
    }

    /// Kurzer Name für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "call_offer",
            SignalingMessage::Answer { .. } => "call_answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::End { .. } => "call_end",
            SignalingMessage::SignalingError { .. } => "error",
        }
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

const KNOWN_TYPES: [&str; 5] = [
    "call_offer",
    "call_answer",
    "ice_candidate",
    "call_end",
    "error",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    CallOffer {
        #[serde(rename = "callId", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(rename = "receiverId")]
        receiver_id: String,
        #[serde(rename = "callerId", default, skip_serializing_if = "Option::is_none")]
        caller_id: Option<String>,
        #[serde(rename = "callType")]
        call_type: CallType,
        sdp: String,
    },

    CallAnswer {
        #[serde(rename = "callId")]
        call_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<String>,
    },

    IceCandidate {
        #[serde(rename = "callId")]
        call_id: String,
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: u16,
    },

    CallEnd {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Error {
        message: String,
    },
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        match msg {
            SignalingMessage::Offer {
                call_id,
                callee_id,
                caller_id,
                call_type,
                sdp,
            } => WireMessage::CallOffer {
                call_id: Some(call_id),
                receiver_id: callee_id,
                caller_id,
                call_type,
                sdp,
            },
            SignalingMessage::Answer {
                call_id,
                accepted,
                sdp,
            } => WireMessage::CallAnswer {
                call_id,
                accepted,
                sdp,
            },
            SignalingMessage::IceCandidate { call_id, candidate } => WireMessage::IceCandidate {
                call_id,
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
            },
            SignalingMessage::End { call_id, reason } => WireMessage::CallEnd { call_id, reason },
            SignalingMessage::SignalingError { message } => WireMessage::Error { message },
        }
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = WireError;

    fn try_from(wire: WireMessage) -> Result<Self, WireError> {
        Ok(match wire {
            WireMessage::CallOffer {
                call_id,
                receiver_id,
                caller_id,
                call_type,
                sdp,
            } => SignalingMessage::Offer {
                call_id: call_id.ok_or(WireError::MissingField {
                    msg_type: "call_offer",
                    field: "callId",
                })?,
                callee_id: receiver_id,
                caller_id,
                call_type,
                sdp,
            },
            WireMessage::CallAnswer {
                call_id,
                accepted,
                sdp,
            } => SignalingMessage::Answer {
                call_id,
                accepted,
                sdp,
            },
            WireMessage::IceCandidate {
                call_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => SignalingMessage::IceCandidate {
                call_id,
                candidate: IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            },
            WireMessage::CallEnd { call_id, reason } => SignalingMessage::End { call_id, reason },
            WireMessage::Error { message } => SignalingMessage::SignalingError { message },
        })
    }
}

/// Serialisiert eine Nachricht in das Draht-JSON
pub fn encode(msg: &SignalingMessage) -> Result<String, WireError> {
    let wire = WireMessage::from(msg.clone());
    Ok(serde_json::to_string(&wire)?)
}

/// Parst Draht-JSON
///
/// Gibt `Ok(None)` für unbekannte Nachrichtentypen zurück.
pub fn decode(text: &str) -> Result<Option<SignalingMessage>, WireError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(WireError::MissingType)?;

    if !KNOWN_TYPES.contains(&msg_type) {
        return Ok(None);
    }

    let wire: WireMessage = serde_json::from_value(value)?;
    SignalingMessage::try_from(wire).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_uses_camel_case_fields() {
        let json = encode(&SignalingMessage::Offer {
            call_id: "c1".into(),
            callee_id: "bob".into(),
            caller_id: None,
            call_type: CallType::Video,
            sdp: "v=0".into(),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "call_offer");
        assert_eq!(value["receiverId"], "bob");
        assert_eq!(value["callType"], "VIDEO");
        assert!(value.get("callerId").is_none());
    }

    #[test]
    fn unknown_type_is_ignored() {
        let parsed = decode(r#"{"type":"presence","peerId":"x"}"#).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(
            decode(r#"{"callId":"c1"}"#),
            Err(WireError::MissingType)
        ));
    }
}
