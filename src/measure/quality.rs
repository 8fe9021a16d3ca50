//! Overall connection quality verdict
// (c) 2024 Ross Younger

use serde::Serialize;

use super::result::{DownloadResult, PingResult, UploadResult};
use super::stats::stability_score;

/// A verdict on the connection as a whole, derived from a complete set of results
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQuality {
    /// Figure of merit, 0 to 100
    pub stability_score: f64,
    /// Is the connection steady enough for interactive use?
    pub is_stable: bool,
    /// Hints for the user, most serious first
    pub recommendations: Vec<String>,
}

impl ConnectionQuality {
    /// Assesses a set of results
    #[must_use]
    pub fn assess(ping: &PingResult, download: &DownloadResult, upload: &UploadResult) -> Self {
        let score = stability_score(
            ping.packet_loss,
            ping.jitter,
            download.speed_variance.max(upload.speed_variance),
            ping.latency,
        );
        let is_stable = score >= 70. && ping.packet_loss < 2. && ping.jitter < 30.;

        let mut hints: Vec<&str> = Vec::new();
        if ping.packet_loss > 5. {
            hints.push("High packet loss: check cabling or Wi-Fi signal");
        } else if ping.packet_loss > 1. {
            hints.push("Some packets are being lost; the connection may be unreliable");
        }
        if ping.jitter > 50. {
            hints.push("High jitter: unsuitable for gaming or video calls");
        } else if ping.jitter > 20. {
            hints.push("Elevated jitter: games may feel laggy");
        }
        if ping.latency > 200. {
            hints.push("High latency: unsuitable for gaming or real-time applications");
        } else if ping.latency > 100. {
            hints.push("Latency is on the high side");
        }
        if download.ttfb.is_some_and(|t| t > 500.) {
            hints.push("Slow time to first byte: the server may be distant or overloaded");
        }

        if is_stable && ping.latency < 30. {
            hints.push("Excellent connection: suitable for gaming, streaming and video calls");
        } else if is_stable {
            hints.push("Stable connection: suitable for most applications");
        }

        if download.throughput >= 25. {
            hints.push("Suitable for 4K streaming");
        } else if download.throughput >= 5. {
            hints.push("Suitable for HD (1080p) streaming");
        } else if download.throughput < 3. {
            hints.push("Low download speed: streaming may struggle");
        }

        if ping.latency < 20. && ping.jitter < 10. && ping.packet_loss < 1. {
            hints.push("Excellent for gaming");
        } else if ping.latency < 50. && ping.jitter < 20. {
            hints.push("Good for gaming");
        } else {
            hints.push("Not ideal for gaming: latency or jitter too high");
        }

        if upload.throughput >= 1.5 && ping.latency < 100. && ping.jitter < 30. {
            hints.push("Suitable for video calls");
        } else if upload.throughput < 1. {
            hints.push("Low upload speed: video calls may struggle");
        }

        let mut recommendations: Vec<String> = Vec::with_capacity(hints.len());
        for hint in hints {
            if !recommendations.iter().any(|r| r == hint) {
                recommendations.push(hint.to_owned());
            }
        }
        Self {
            stability_score: score,
            is_stable,
            recommendations,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ConnectionQuality;
    use crate::measure::result::{PingResult, ThroughputResult};

    fn ping(latency: f64, jitter: f64, packet_loss: f64) -> PingResult {
        PingResult {
            latency,
            jitter,
            packet_loss,
            ..Default::default()
        }
    }

    fn throughput(mbps: f64, variance: f64) -> ThroughputResult {
        ThroughputResult {
            throughput: mbps,
            speed_variance: variance,
            ..Default::default()
        }
    }

    #[test]
    fn excellent_connection() {
        let q = ConnectionQuality::assess(
            &ping(8., 1., 0.),
            &throughput(300., 2.),
            &throughput(100., 1.),
        );
        assert_eq!(q.stability_score, 100.);
        assert!(q.is_stable);
        assert!(q.recommendations.iter().any(|r| r.starts_with("Excellent connection")));
        assert!(q.recommendations.iter().any(|r| r == "Suitable for 4K streaming"));
        assert!(q.recommendations.iter().any(|r| r == "Excellent for gaming"));
        assert!(q.recommendations.iter().any(|r| r == "Suitable for video calls"));
    }

    #[test]
    fn lossy_connection_is_unstable() {
        let q = ConnectionQuality::assess(
            &ping(40., 5., 10.),
            &throughput(50., 0.),
            &throughput(10., 0.),
        );
        // 100 - 10*5 - 1
        assert!((q.stability_score - 49.).abs() < 1e-9);
        assert!(!q.is_stable);
        assert_eq!(
            q.recommendations[0],
            "High packet loss: check cabling or Wi-Fi signal"
        );
    }

    #[test]
    fn jitter_alone_can_make_unstable() {
        let q = ConnectionQuality::assess(
            &ping(40., 35., 0.),
            &throughput(50., 0.),
            &throughput(10., 0.),
        );
        // 100 - 7 = 93, still unstable because jitter >= 30
        assert!(q.stability_score > 90.);
        assert!(!q.is_stable);
    }

    #[test]
    fn worst_variance_counts() {
        let calm = ConnectionQuality::assess(
            &ping(40., 0., 0.),
            &throughput(50., 0.),
            &throughput(10., 0.),
        );
        let choppy_upload = ConnectionQuality::assess(
            &ping(40., 0., 0.),
            &throughput(50., 0.),
            &throughput(10., 100.),
        );
        assert!((calm.stability_score - choppy_upload.stability_score - 10.).abs() < 1e-9);
    }

    #[test]
    fn slow_connection() {
        let mut download = throughput(1., 0.);
        download.ttfb = Some(800.);
        let q = ConnectionQuality::assess(&ping(250., 60., 0.), &download, &throughput(0.5, 0.));
        for expected in [
            "High jitter: unsuitable for gaming or video calls",
            "High latency: unsuitable for gaming or real-time applications",
            "Slow time to first byte: the server may be distant or overloaded",
            "Low download speed: streaming may struggle",
            "Not ideal for gaming: latency or jitter too high",
            "Low upload speed: video calls may struggle",
        ] {
            assert!(q.recommendations.iter().any(|r| r == expected), "{expected}");
        }
    }

    #[test]
    fn no_duplicates() {
        let q = ConnectionQuality::assess(
            &ping(25., 15., 0.5),
            &throughput(10., 0.),
            &throughput(2., 0.),
        );
        let mut sorted = q.recommendations.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), q.recommendations.len());
    }
}
