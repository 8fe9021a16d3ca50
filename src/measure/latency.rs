//! Latency probe
// (c) 2024 Ross Younger

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::result::{unix_timestamp, PingResult};
use super::stats::{jitter, mean, packet_loss_ratio};
use crate::channel::{Channel, ChannelError};
use crate::protocol::control::ControlMessage;

/// Number of probes per test
pub const TRIALS: u32 = 20;
/// How long to wait for each reply
pub const TRIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after each trial
pub const INTER_TRIAL_DELAY: Duration = Duration::from_millis(50);
/// Round trips longer than this are discarded as implausible
pub const MAX_PLAUSIBLE_RTT_MS: f64 = 1000.;

/// How a single probe turned out
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum TrialOutcome {
    /// A matching reply arrived in time
    Matched,
    /// No reply within [`TRIAL_TIMEOUT`]
    TimedOut,
    /// A reply arrived, but for a different probe
    Mismatched,
    /// The channel failed
    TransportFailed,
    /// The round trip was outside the plausible range
    Implausible,
}

/// One probe
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyTrial {
    /// Round-trip time in milliseconds. Only meaningful if the outcome is `Matched`.
    pub round_trip_millis: f64,
    /// Sequence number of the probe
    pub sequence: u64,
    /// What happened
    pub outcome: TrialOutcome,
}

impl LatencyTrial {
    /// Does this trial count towards the aggregates?
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.outcome == TrialOutcome::Matched
    }
}

fn unix_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Measures round-trip time over a [`Channel`], one probe at a time.
///
/// The peer is expected to answer each `ping` with a `pong` carrying the same sequence number.
/// The round-trip time is measured locally with a monotonic clock; the timestamp in the probe
/// is informational.
#[derive(Debug)]
pub struct LatencyProbe<'a> {
    channel: &'a Channel,
}

impl<'a> LatencyProbe<'a> {
    /// Constructor
    #[must_use]
    pub fn new(channel: &'a Channel) -> Self {
        Self { channel }
    }

    /// Runs all the trials and aggregates them.
    ///
    /// Never fails: an unresponsive or broken peer simply produces invalid trials.
    /// The worst case running time is `TRIALS * (TRIAL_TIMEOUT + INTER_TRIAL_DELAY)`.
    pub async fn run(&self) -> PingResult {
        let started = Instant::now();
        let mut trials = Vec::new();
        for sequence in 0..u64::from(TRIALS) {
            let trial = self.trial(sequence).await;
            trace!(
                sequence,
                outcome = %trial.outcome,
                rtt = trial.round_trip_millis,
                "latency trial"
            );
            trials.push(trial);
            tokio::time::sleep(INTER_TRIAL_DELAY).await;
        }
        let result = aggregate(trials);
        info!(
            latency = result.latency,
            jitter = result.jitter,
            packets = result.packets,
            duration = ?started.elapsed(),
            "ping test completed"
        );
        result
    }

    async fn trial(&self, sequence: u64) -> LatencyTrial {
        let done = |outcome, round_trip_millis| LatencyTrial {
            round_trip_millis,
            sequence,
            outcome,
        };

        let sent = Instant::now();
        let probe = ControlMessage::Ping {
            timestamp: unix_nanos(),
            sequence,
        };
        if let Err(e) = self.channel.send_control(&probe).await {
            warn!("failed to send ping {sequence}: {e}");
            return done(TrialOutcome::TransportFailed, 0.);
        }

        let deadline = sent + TRIAL_TIMEOUT;
        loop {
            let msg = match self.channel.receiver().recv_until(deadline).await {
                Ok(msg) => msg,
                Err(ChannelError::Timeout) => {
                    debug!("ping {sequence} timed out");
                    return done(TrialOutcome::TimedOut, 0.);
                }
                Err(e) => {
                    debug!("ping {sequence}: {e}");
                    return done(TrialOutcome::TransportFailed, 0.);
                }
            };
            match msg.as_control() {
                Some(ControlMessage::Pong {
                    sequence: echoed, ..
                }) => {
                    if echoed != sequence {
                        warn!("ping {sequence}: reply had sequence {echoed}");
                        return done(TrialOutcome::Mismatched, 0.);
                    }
                    let rtt = sent.elapsed().as_secs_f64() * 1000.;
                    if !(0. ..=MAX_PLAUSIBLE_RTT_MS).contains(&rtt) {
                        debug!("ping {sequence}: discarding implausible round trip of {rtt}ms");
                        return done(TrialOutcome::Implausible, rtt);
                    }
                    return done(TrialOutcome::Matched, rtt);
                }
                // Anything else is noise; keep waiting for the pong
                _ => trace!("ping {sequence}: ignoring unexpected message"),
            }
        }
    }
}

/// Computes the aggregate figures over a set of trials
#[must_use]
pub fn aggregate(trials: Vec<LatencyTrial>) -> PingResult {
    let rtts: Vec<f64> = trials
        .iter()
        .filter(|t| t.is_valid())
        .map(|t| t.round_trip_millis)
        .collect();
    let received = u32::try_from(rtts.len()).unwrap_or(u32::MAX);
    let sent = u32::try_from(trials.len()).unwrap_or(u32::MAX);
    PingResult {
        latency: mean(&rtts),
        jitter: jitter(&rtts),
        packets: received,
        packet_loss: packet_loss_ratio(sent, received),
        min_latency: rtts.iter().copied().reduce(f64::min).unwrap_or(0.),
        max_latency: rtts.iter().copied().reduce(f64::max).unwrap_or(0.),
        timestamp: unix_timestamp(),
        trials,
        ..Default::default()
    }
}
