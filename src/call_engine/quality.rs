//! Network Quality Monitor
//!
//! Leitet aus den Transport-Statistiken RTT, Jitter und Paketverlust ab
//! und ordnet sie einer vierstufigen Skala zu. Die schlechteste Metrik
//! bestimmt die Stufe.

use super::transport::TransportStats;
use serde::Serialize;

/// Qualitätsstufe, aufsteigend sortiert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// Grenzwerte einer Stufe; wer einen davon überschreitet, fällt darunter
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    rtt_ms: f64,
    loss_pct: f64,
    jitter_ms: f64,
}

const POOR: Thresholds = Thresholds {
    rtt_ms: 300.0,
    loss_pct: 5.0,
    jitter_ms: 50.0,
};

const FAIR: Thresholds = Thresholds {
    rtt_ms: 200.0,
    loss_pct: 3.0,
    jitter_ms: 30.0,
};

const GOOD: Thresholds = Thresholds {
    rtt_ms: 100.0,
    loss_pct: 1.0,
    jitter_ms: 15.0,
};

impl Thresholds {
    fn exceeded(&self, rtt_ms: f64, loss_pct: f64, jitter_ms: f64) -> bool {
        rtt_ms > self.rtt_ms || loss_pct > self.loss_pct || jitter_ms > self.jitter_ms
    }
}

/// Ordnet eine Messung einer Stufe zu
pub fn classify(rtt_ms: f64, loss_pct: f64, jitter_ms: f64) -> NetworkQuality {
    if POOR.exceeded(rtt_ms, loss_pct, jitter_ms) {
        NetworkQuality::Poor
    } else if FAIR.exceeded(rtt_ms, loss_pct, jitter_ms) {
        NetworkQuality::Fair
    } else if GOOD.exceeded(rtt_ms, loss_pct, jitter_ms) {
        NetworkQuality::Good
    } else {
        NetworkQuality::Excellent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_pct: f64,
    pub quality: NetworkQuality,
}

/// Zustandsbehafteter Sampler über aufeinanderfolgende Statistiken
#[derive(Debug, Default)]
pub struct QualityMonitor {
    last_rtt_ms: Option<f64>,
    jitter_ms: f64,
    last_received: u64,
    last_lost: u64,
}

impl QualityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, stats: &TransportStats) -> QualitySample {
        let rtt_ms = stats.rtt_ms.unwrap_or(0.0);

        // Ohne gemeldeten Jitter: geglättete RTT-Schwankung
        let jitter_ms = match stats.jitter_ms {
            Some(jitter) => jitter,
            None => {
                if let (Some(last), Some(rtt)) = (self.last_rtt_ms, stats.rtt_ms) {
                    let delta = (rtt - last).abs();
                    self.jitter_ms += (delta - self.jitter_ms) / 2.0;
                }
                self.jitter_ms
            }
        };
        if stats.rtt_ms.is_some() {
            self.last_rtt_ms = stats.rtt_ms;
        }

        // Verlust im Intervall seit der letzten Messung
        let received = stats.packets_received.saturating_sub(self.last_received);
        let lost = stats.packets_lost.saturating_sub(self.last_lost);
        self.last_received = stats.packets_received;
        self.last_lost = stats.packets_lost;
        let packet_loss_pct = if received + lost == 0 {
            0.0
        } else {
            lost as f64 * 100.0 / (received + lost) as f64
        };

        QualitySample {
            rtt_ms,
            jitter_ms,
            packet_loss_pct,
            quality: classify(rtt_ms, packet_loss_pct, jitter_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_metric_wins() {
        assert_eq!(classify(400.0, 1.0, 10.0), NetworkQuality::Poor);
        assert_eq!(classify(50.0, 6.0, 5.0), NetworkQuality::Poor);
        assert_eq!(classify(150.0, 0.5, 5.0), NetworkQuality::Good);
        assert_eq!(classify(50.0, 0.5, 35.0), NetworkQuality::Fair);
        assert_eq!(classify(50.0, 0.0, 5.0), NetworkQuality::Excellent);
    }

    #[test]
    fn test_boundaries_are_inclusive_of_better_tier() {
        assert_eq!(classify(300.0, 5.0, 50.0), NetworkQuality::Fair);
        assert_eq!(classify(100.0, 1.0, 15.0), NetworkQuality::Excellent);
    }

    #[test]
    fn test_loss_is_measured_per_interval() {
        let mut monitor = QualityMonitor::new();
        let first = monitor.sample(&TransportStats {
            rtt_ms: Some(40.0),
            packets_received: 90,
            packets_lost: 10,
            ..Default::default()
        });
        assert_eq!(first.packet_loss_pct, 10.0);
        assert_eq!(first.quality, NetworkQuality::Poor);

        let second = monitor.sample(&TransportStats {
            rtt_ms: Some(40.0),
            packets_received: 190,
            packets_lost: 10,
            ..Default::default()
        });
        assert_eq!(second.packet_loss_pct, 0.0);
        assert_eq!(second.quality, NetworkQuality::Excellent);
    }

    #[test]
    fn test_jitter_falls_back_to_rtt_variation() {
        let mut monitor = QualityMonitor::new();
        let stats = |rtt| TransportStats {
            rtt_ms: Some(rtt),
            ..Default::default()
        };
        assert_eq!(monitor.sample(&stats(50.0)).jitter_ms, 0.0);
        assert_eq!(monitor.sample(&stats(130.0)).jitter_ms, 40.0);

        let reported = monitor.sample(&TransportStats {
            rtt_ms: Some(50.0),
            jitter_ms: Some(3.0),
            ..Default::default()
        });
        assert_eq!(reported.jitter_ms, 3.0);
    }
}
