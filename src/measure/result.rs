//! Result records
// (c) 2024 Ross Younger
//!
//! Each test produces exactly one result, sent to the peer as a JSON text message
//! whose `type` is `"result"`.

use serde::{Deserialize, Serialize};

use super::latency::LatencyTrial;

/// The literal `"result"` type tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultTag {
    /// `"result"`
    #[default]
    Result,
}

/// Current Unix time in seconds
#[must_use]
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Outcome of a latency test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    /// Always `"result"`
    #[serde(rename = "type")]
    pub tag: ResultTag,
    /// Mean round-trip time of the valid trials, in milliseconds
    pub latency: f64,
    /// Mean absolute difference between consecutive round-trip times, in milliseconds
    pub jitter: f64,
    /// Number of valid replies
    pub packets: u32,
    /// Percentage of probes that produced no valid reply
    pub packet_loss: f64,
    /// Fastest valid round trip, in milliseconds (0 if none)
    pub min_latency: f64,
    /// Slowest valid round trip, in milliseconds (0 if none)
    pub max_latency: f64,
    /// Unix time the result was produced
    pub timestamp: i64,
    /// Every trial, valid or not
    #[serde(skip)]
    pub trials: Vec<LatencyTrial>,
}

/// Why a throughput session ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StopReason {
    /// The hard time limit was reached
    #[default]
    Deadline,
    /// Throughput had stabilised
    Stable,
    /// The peer sent `complete`
    #[strum(serialize = "peer complete")]
    PeerComplete,
    /// Every stream failed, or the session could not start
    #[strum(serialize = "transport failure")]
    TransportFailure,
}

/// Outcome of a throughput test, in either direction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputResult {
    /// Always `"result"`
    #[serde(rename = "type")]
    pub tag: ResultTag,
    /// Megabits per second
    pub throughput: f64,
    /// Payload bytes transferred
    pub bytes: u64,
    /// Measurement time, in seconds
    pub duration: f64,
    /// Time to first byte, in milliseconds.
    /// Only meaningful for downloads; absent from upload results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb: Option<f64>,
    /// Population variance of the throughput samples
    pub speed_variance: f64,
    /// Throughput samples (Mbps), roughly every 500ms, for graphing
    #[serde(default)]
    pub speed_samples: Vec<f64>,
    /// Unix time the result was produced
    pub timestamp: i64,
    /// The raw figure exceeded 10 Gbit/s and was clamped; probably a same-host measurement
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clamped: bool,
    /// Why the session ended
    #[serde(skip)]
    pub stop_reason: StopReason,
}

/// Outcome of a download test
pub type DownloadResult = ThroughputResult;
/// Outcome of an upload test
pub type UploadResult = ThroughputResult;

impl ThroughputResult {
    /// The result of a session that never got going
    #[must_use]
    pub fn zero() -> Self {
        Self {
            timestamp: unix_timestamp(),
            stop_reason: StopReason::TransportFailure,
            ..Default::default()
        }
    }
}
