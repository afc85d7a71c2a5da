use super::{
    CallStats, IssueNotice, QualityIssue, QualityThresholds, QualityTier, QualityWarning,
    RawStats, Resolution,
};
use std::time::Duration;
use tokio::time::Instant;

/// Gewicht des neuen Samples im gleitenden Mittel der Bitrate
const BITRATE_SMOOTHING: f64 = 0.3;

/// Ergebnis eines Samples
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub stats: CallStats,
    pub warning: Option<QualityWarning>,
}

/// Überwacht die Verbindungsqualität eines Anrufs
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    thresholds: QualityThresholds,
    warning_interval: Duration,
    started_at: Option<Instant>,
    last_warning: Option<Instant>,
    smoothed_bitrate: Option<f64>,
    latency_ms: f64,
    resolution: Option<Resolution>,
    current: Option<CallStats>,
}

impl QualityMonitor {
    pub fn new(thresholds: QualityThresholds, warning_interval: Duration) -> Self {
        Self {
            thresholds,
            warning_interval,
            started_at: None,
            last_warning: None,
            smoothed_bitrate: None,
            latency_ms: 0.0,
            resolution: None,
            current: None,
        }
    }

    /// Setzt alle akkumulierten Werte zurück
    pub fn on_call_start(&mut self) {
        self.started_at = Some(Instant::now());
        self.last_warning = None;
        self.smoothed_bitrate = None;
        self.latency_ms = 0.0;
        self.resolution = None;
        self.current = None;
    }

    pub fn on_call_end(&mut self) {
        self.started_at = None;
    }

    pub fn current(&self) -> Option<&CallStats> {
        self.current.as_ref()
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Verarbeitet ein Sample der Media Engine
    pub fn on_stats_sample(&mut self, raw: &RawStats) -> QualityReport {
        let now = Instant::now();

        let total = raw.tx_bitrate_kbps + raw.rx_bitrate_kbps;
        let bitrate = match self.smoothed_bitrate {
            Some(prev) => prev + BITRATE_SMOOTHING * (total - prev),
            None => total,
        };
        self.smoothed_bitrate = Some(bitrate);

        let losses: Vec<f64> = [raw.tx_packet_loss_percent, raw.rx_packet_loss_percent]
            .into_iter()
            .flatten()
            .collect();
        let packet_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };

        if let Some(rtt) = raw.rtt_ms {
            self.latency_ms = rtt;
        }

        let stats = CallStats {
            duration_ms: self.elapsed_ms(now),
            bitrate_kbps: bitrate,
            packet_loss_percent: packet_loss,
            latency_ms: self.latency_ms,
            resolution: self.resolution,
            quality: QualityTier::classify(self.latency_ms, packet_loss, bitrate, &self.thresholds),
        };
        self.current = Some(stats.clone());

        let issues = self.detect_issues(&stats);
        let warning = if !issues.is_empty() && self.warning_due(now) {
            self.last_warning = Some(now);
            tracing::warn!("Call quality degraded: {:?}", issues);
            Some(QualityWarning {
                notices: issues
                    .into_iter()
                    .map(|issue| IssueNotice {
                        issue,
                        recommendation: issue.recommendation().to_string(),
                    })
                    .collect(),
            })
        } else {
            None
        };

        QualityReport { stats, warning }
    }

    /// Auflösung ändert sich unabhängig vom Statistik-Takt
    pub fn on_video_resolution_changed(&mut self, width: u32, height: u32) {
        let resolution = Resolution { width, height };
        tracing::debug!("Video resolution changed to {}x{}", width, height);
        self.resolution = Some(resolution);
        if let Some(current) = self.current.as_mut() {
            current.resolution = Some(resolution);
        }
    }

    fn detect_issues(&self, stats: &CallStats) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        if stats.latency_ms > self.thresholds.max_latency_ms {
            issues.push(QualityIssue::HighLatency);
        }
        if stats.packet_loss_percent > self.thresholds.max_packet_loss_percent {
            issues.push(QualityIssue::PacketLoss);
        }
        if stats.bitrate_kbps < self.thresholds.min_bitrate_kbps {
            issues.push(QualityIssue::LowBitrate);
        }
        issues.sort_by_key(|issue| std::cmp::Reverse(issue.priority()));
        issues
    }

    fn warning_due(&self, now: Instant) -> bool {
        match self.last_warning {
            Some(last) => now.duration_since(last) >= self.warning_interval,
            None => true,
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        self.started_at
            .map(|start| now.duration_since(start).as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> RawStats {
        RawStats {
            tx_bitrate_kbps: 40.0,
            rx_bitrate_kbps: 40.0,
            tx_packet_loss_percent: Some(0.0),
            rx_packet_loss_percent: Some(0.0),
            rtt_ms: Some(40.0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn co_occurring_issues_are_sorted_by_priority() {
        let mut monitor =
            QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10));
        monitor.on_call_start();

        let report = monitor.on_stats_sample(&RawStats {
            tx_bitrate_kbps: 5.0,
            rx_bitrate_kbps: 5.0,
            tx_packet_loss_percent: Some(12.0),
            rx_packet_loss_percent: Some(8.0),
            rtt_ms: Some(450.0),
        });

        let warning = report.warning.expect("warning expected");
        assert_eq!(
            warning.issues(),
            vec![
                QualityIssue::PacketLoss,
                QualityIssue::HighLatency,
                QualityIssue::LowBitrate
            ]
        );
        assert_eq!(report.stats.packet_loss_percent, 10.0);
        assert_eq!(report.stats.quality, QualityTier::Poor);
    }

    #[tokio::test(start_paused = true)]
    async fn bitrate_is_smoothed_and_latency_keeps_last_reading() {
        let mut monitor =
            QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10));
        monitor.on_call_start();

        monitor.on_stats_sample(&healthy());
        let report = monitor.on_stats_sample(&RawStats {
            tx_bitrate_kbps: 90.0,
            rx_bitrate_kbps: 90.0,
            rtt_ms: None,
            ..healthy()
        });

        // 80 + 0.3 * (180 - 80)
        assert!((report.stats.bitrate_kbps - 110.0).abs() < 1e-9);
        assert_eq!(report.stats.latency_ms, 40.0);
        assert!(report.warning.is_none());
    }
}
