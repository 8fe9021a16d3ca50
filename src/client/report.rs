// Final results output
// (c) 2024 Ross Younger

use std::fmt::Display;
use std::time::Duration;

use human_repr::{HumanCount as _, HumanDuration as _, HumanThroughput as _};
use serde::Serialize;
use tabled::{settings::style::Style, Table, Tabled};

use crate::measure::quality::ConnectionQuality;
use crate::measure::result::{DownloadResult, PingResult, UploadResult};

/// Everything a client run found out
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Latency test result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingResult>,
    /// Download test result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadResult>,
    /// Upload test result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadResult>,
    /// Overall verdict; only available when all three tests ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<ConnectionQuality>,
}

impl Report {
    /// Fills in the verdict, if we have everything it needs
    pub fn assess(&mut self) {
        if let (Some(p), Some(d), Some(u)) = (&self.ping, &self.download, &self.upload) {
            self.quality = Some(ConnectionQuality::assess(p, d, u));
        }
    }

    /// Renders as a JSON document
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[derive(Tabled)]
struct Row {
    measurement: String,
    value: String,
}

impl Row {
    fn new(measurement: &str, value: String) -> Self {
        Self {
            measurement: measurement.into(),
            value,
        }
    }
}

fn millis(ms: f64) -> String {
    Duration::from_secs_f64(ms.max(0.) / 1000.)
        .human_duration()
        .to_string()
}

fn mbps(rate: f64) -> String {
    (rate * 1e6).human_throughput("b").to_string()
}

fn throughput_rows(rows: &mut Vec<Row>, name: &str, r: &DownloadResult) {
    let mut value = format!(
        "{} ({} in {:.1}s)",
        mbps(r.throughput),
        r.bytes.human_count_bytes(),
        r.duration
    );
    if r.clamped {
        value.push_str(", clamped");
    }
    rows.push(Row::new(name, value));
    if let Some(ttfb) = r.ttfb {
        rows.push(Row::new("Time to first byte", millis(ttfb)));
    }
    rows.push(Row::new(
        &format!("{name} variance"),
        format!("{:.2}", r.speed_variance),
    ));
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rows = Vec::new();
        if let Some(p) = &self.ping {
            rows.push(Row::new("Latency", millis(p.latency)));
            rows.push(Row::new(
                "Latency range",
                format!("{} - {}", millis(p.min_latency), millis(p.max_latency)),
            ));
            rows.push(Row::new("Jitter", millis(p.jitter)));
            rows.push(Row::new("Packet loss", format!("{:.1}%", p.packet_loss)));
        }
        if let Some(d) = &self.download {
            throughput_rows(&mut rows, "Download", d);
        }
        if let Some(u) = &self.upload {
            throughput_rows(&mut rows, "Upload", u);
        }
        if let Some(q) = &self.quality {
            rows.push(Row::new(
                "Stability score",
                format!("{:.0}/100", q.stability_score),
            ));
            rows.push(Row::new(
                "Verdict",
                if q.is_stable { "stable" } else { "unstable" }.into(),
            ));
        }
        write!(f, "{}", Table::new(rows).with(Style::sharp()))?;
        if let Some(q) = &self.quality {
            for r in &q.recommendations {
                write!(f, "\n * {r}")?;
            }
        }
        Ok(())
    }
}
