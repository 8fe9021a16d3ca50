//! Rate controller: chunk size and stream count policy, and throughput arithmetic
// (c) 2024 Ross Younger

use std::time::Duration;

/// Smallest chunk we will ever send or ask for
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;
/// Largest chunk we will ever send or ask for
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;
/// Upper bound on concurrent streams within a session
pub const MAX_STREAMS: usize = 8;

/// A speed change beyond this ratio (either way) triggers a chunk size change
const SPEED_CHANGE_THRESHOLD: f64 = 0.20;
const GROWTH_FACTOR: f64 = 1.5;
const SHRINK_FACTOR: f64 = 0.75;

/// Any reported throughput above this figure is implausible for a real network path.
/// It usually means both ends are on the same host.
pub const THROUGHPUT_CEILING_MBPS: f64 = 10_000.;

/// Elapsed times shorter than this are rounded up when computing the final figures
pub const MIN_MEASUREMENT_TIME: Duration = Duration::from_millis(100);

fn clamp_size(size: usize, min_size: usize, max_size: usize) -> usize {
    // deliberately not usize::clamp, which panics if min > max
    size.max(min_size).min(max_size)
}

/// Relative change from `previous` to `current`, or 0 if there is no previous reading.
#[must_use]
pub fn speed_change_ratio(current: f64, previous: f64) -> f64 {
    if previous == 0. {
        return 0.;
    }
    (current - previous) / previous
}

/// Decides the next chunk size.
///
/// Speeding up by more than 20% grows the chunk by half; slowing down by more than 20%
/// shrinks it by a quarter. Anything in between leaves it alone.
/// The result always lies within `[min_size, max_size]`.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn progressive_chunk_size(
    min_size: usize,
    current_size: usize,
    max_size: usize,
    speed_change_ratio: f64,
) -> usize {
    let next = if speed_change_ratio > SPEED_CHANGE_THRESHOLD {
        (current_size as f64 * GROWTH_FACTOR) as usize
    } else if speed_change_ratio < -SPEED_CHANGE_THRESHOLD {
        (current_size as f64 * SHRINK_FACTOR) as usize
    } else {
        current_size
    };
    clamp_size(next, min_size, max_size)
}

/// How many parallel streams suit the current throughput
#[must_use]
pub fn optimal_stream_count(current_mbps: f64) -> usize {
    match current_mbps {
        x if x >= 1000. => 8,
        x if x >= 500. => 4,
        x if x >= 100. => 2,
        _ => 1,
    }
}

/// Clamps a requested initial chunk size into the supported range
#[must_use]
pub fn clamp_chunk_size(requested: u64) -> usize {
    let requested = usize::try_from(requested).unwrap_or(usize::MAX);
    clamp_size(requested, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Throughput in megabits per second, or 0 if no time has passed
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0. {
        return 0.;
    }
    (bytes as f64 * 8.) / secs / 1e6
}

/// The headline throughput figure of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalThroughput {
    /// Megabits per second, never more than [`THROUGHPUT_CEILING_MBPS`]
    pub mbps: f64,
    /// Measurement time in seconds, never less than [`MIN_MEASUREMENT_TIME`]
    pub duration: f64,
    /// Whether the raw figure exceeded the ceiling and was clamped
    pub clamped: bool,
}

/// Computes the final throughput of a session.
///
/// Elapsed times under 100ms are treated as 100ms. Figures above 10 Gbit/s are clamped
/// and flagged rather than reported.
#[must_use]
pub fn final_throughput(bytes: u64, elapsed: Duration) -> FinalThroughput {
    let elapsed = elapsed.max(MIN_MEASUREMENT_TIME);
    let raw = throughput_mbps(bytes, elapsed);
    let clamped = raw > THROUGHPUT_CEILING_MBPS;
    FinalThroughput {
        mbps: if clamped { THROUGHPUT_CEILING_MBPS } else { raw },
        duration: elapsed.as_secs_f64(),
        clamped,
    }
}
