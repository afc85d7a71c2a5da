//! Quality Module - Bewertung der Verbindungsqualität
//!
//! Wandelt rohe Transport-Statistiken der Media Engine in [`CallStats`] um
//! und meldet Qualitätsprobleme, höchstens einmal pro Warnintervall.

mod monitor;

pub use monitor::{QualityMonitor, QualityReport};

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// THRESHOLDS
// ============================================================================

/// Latenz, ab der `HIGH_LATENCY` gemeldet wird (ms)
pub const MAX_LATENCY_MS: f64 = 300.0;
/// Paketverlust, ab dem `PACKET_LOSS` gemeldet wird (%)
pub const MAX_PACKET_LOSS_PERCENT: f64 = 5.0;
/// Bitrate (tx + rx), unter der `LOW_BITRATE` gemeldet wird (kbps)
pub const MIN_BITRATE_KBPS: f64 = 30.0;

/// Grenzen für die Stufe `Excellent`
pub const EXCELLENT_LATENCY_MS: f64 = 100.0;
pub const EXCELLENT_PACKET_LOSS_PERCENT: f64 = 1.0;
/// Grenzen für die Stufe `Good`
pub const GOOD_LATENCY_MS: f64 = 200.0;
pub const GOOD_PACKET_LOSS_PERCENT: f64 = 3.0;

/// Schwellwerte für die Problem-Erkennung, Defaults siehe Konstanten
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub max_latency_ms: f64,
    pub max_packet_loss_percent: f64,
    pub min_bitrate_kbps: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            max_latency_ms: MAX_LATENCY_MS,
            max_packet_loss_percent: MAX_PACKET_LOSS_PERCENT,
            min_bitrate_kbps: MIN_BITRATE_KBPS,
        }
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Rohes Sample der Media Engine
///
/// Verlustraten sind optional, weil nicht jede Engine beide Richtungen kennt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RawStats {
    pub tx_bitrate_kbps: f64,
    pub rx_bitrate_kbps: f64,
    pub tx_packet_loss_percent: Option<f64>,
    pub rx_packet_loss_percent: Option<f64>,
    pub rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Grobe Qualitätsstufe
///
/// - `Excellent`: Latenz < 100 ms und Verlust < 1 %, keine Probleme
/// - `Good`: Latenz < 200 ms und Verlust < 3 %, keine Probleme
/// - `Fair`: innerhalb aller [`QualityThresholds`]
/// - `Poor`: mindestens ein Schwellwert überschritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum QualityTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityTier {
    pub fn classify(
        latency_ms: f64,
        packet_loss_percent: f64,
        bitrate_kbps: f64,
        thresholds: &QualityThresholds,
    ) -> Self {
        if latency_ms > thresholds.max_latency_ms
            || packet_loss_percent > thresholds.max_packet_loss_percent
            || bitrate_kbps < thresholds.min_bitrate_kbps
        {
            QualityTier::Poor
        } else if latency_ms < EXCELLENT_LATENCY_MS
            && packet_loss_percent < EXCELLENT_PACKET_LOSS_PERCENT
        {
            QualityTier::Excellent
        } else if latency_ms < GOOD_LATENCY_MS && packet_loss_percent < GOOD_PACKET_LOSS_PERCENT {
            QualityTier::Good
        } else {
            QualityTier::Fair
        }
    }
}

/// Momentaufnahme der Verbindung
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStats {
    pub duration_ms: u64,
    pub bitrate_kbps: f64,
    pub packet_loss_percent: f64,
    pub latency_ms: f64,
    pub resolution: Option<Resolution>,
    pub quality: QualityTier,
}

// ============================================================================
// ISSUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityIssue {
    HighLatency,
    PacketLoss,
    LowBitrate,
}

impl QualityIssue {
    /// Höher = dringender; bestimmt die Reihenfolge in einer Warnung
    pub fn priority(&self) -> u8 {
        match self {
            QualityIssue::PacketLoss => 3,
            QualityIssue::HighLatency => 2,
            QualityIssue::LowBitrate => 1,
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            QualityIssue::PacketLoss => {
                "Connection is unstable. Move closer to your router or switch networks."
            }
            QualityIssue::HighLatency => {
                "High delay detected. Close other apps that use the network."
            }
            QualityIssue::LowBitrate => {
                "Bandwidth is low. Consider turning off video to improve audio."
            }
        }
    }
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityIssue::HighLatency => "HIGH_LATENCY",
            QualityIssue::PacketLoss => "PACKET_LOSS",
            QualityIssue::LowBitrate => "LOW_BITRATE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueNotice {
    pub issue: QualityIssue,
    pub recommendation: String,
}

/// Rate-limitierte Warnung, Probleme nach Priorität absteigend sortiert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityWarning {
    pub notices: Vec<IssueNotice>,
}

impl QualityWarning {
    pub fn issues(&self) -> Vec<QualityIssue> {
        self.notices.iter().map(|n| n.issue).collect()
    }
}
