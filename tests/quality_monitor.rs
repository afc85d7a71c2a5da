use pulse_call::quality::{QualityIssue, QualityMonitor, QualityThresholds, QualityTier, RawStats};
use std::time::Duration;

fn lossy() -> RawStats {
    RawStats {
        tx_bitrate_kbps: 48.0,
        rx_bitrate_kbps: 48.0,
        tx_packet_loss_percent: Some(9.0),
        rx_packet_loss_percent: Some(7.0),
        rtt_ms: Some(60.0),
    }
}

#[tokio::test(start_paused = true)]
async fn warnings_are_rate_limited_to_one_per_interval() {
    let mut monitor = QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10));
    monitor.on_call_start();

    let first = monitor.on_stats_sample(&lossy());
    assert_eq!(
        first.warning.map(|w| w.issues()),
        Some(vec![QualityIssue::PacketLoss])
    );

    tokio::time::advance(Duration::from_secs(5)).await;
    let second = monitor.on_stats_sample(&lossy());
    assert!(second.warning.is_none());
    assert_eq!(second.stats.duration_ms, 5_000);

    tokio::time::advance(Duration::from_secs(6)).await;
    let third = monitor.on_stats_sample(&lossy());
    assert!(third.warning.is_some());
    assert_eq!(third.stats.duration_ms, 11_000);
}

#[tokio::test(start_paused = true)]
async fn call_start_resets_the_warning_timer() {
    let mut monitor = QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10));
    monitor.on_call_start();
    assert!(monitor.on_stats_sample(&lossy()).warning.is_some());

    monitor.on_call_end();
    monitor.on_call_start();

    assert!(monitor.on_stats_sample(&lossy()).warning.is_some());
}

#[tokio::test(start_paused = true)]
async fn every_warning_carries_a_recommendation() {
    let mut monitor = QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10));
    monitor.on_call_start();

    let report = monitor.on_stats_sample(&RawStats {
        tx_bitrate_kbps: 10.0,
        rx_bitrate_kbps: 5.0,
        tx_packet_loss_percent: None,
        rx_packet_loss_percent: None,
        rtt_ms: Some(420.0),
    });

    let warning = report.warning.expect("warning expected");
    assert_eq!(
        warning.issues(),
        vec![QualityIssue::HighLatency, QualityIssue::LowBitrate]
    );
    for notice in &warning.notices {
        assert_eq!(notice.recommendation, notice.issue.recommendation());
    }
    assert_eq!(report.stats.packet_loss_percent, 0.0);
    assert_eq!(report.stats.quality, QualityTier::Poor);
}

#[tokio::test(start_paused = true)]
async fn custom_thresholds_are_respected() {
    let thresholds = QualityThresholds {
        max_packet_loss_percent: 10.0,
        ..QualityThresholds::default()
    };
    let mut monitor = QualityMonitor::new(thresholds, Duration::from_secs(10));
    monitor.on_call_start();

    assert!(monitor.on_stats_sample(&lossy()).warning.is_none());
}

#[tokio::test(start_paused = true)]
async fn resolution_changes_show_up_in_current_stats() {
    let mut monitor = QualityMonitor::new(QualityThresholds::default(), Duration::from_secs(10));
    monitor.on_call_start();
    monitor.on_stats_sample(&lossy());

    monitor.on_video_resolution_changed(1280, 720);

    let current = monitor.current().expect("stats after first sample");
    let resolution = current.resolution.expect("resolution");
    assert_eq!((resolution.width, resolution.height), (1280, 720));
}
