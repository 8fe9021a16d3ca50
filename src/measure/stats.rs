//! Statistics kit: pure functions over sample sequences
// (c) 2024 Ross Younger

//! None of these functions care about the order of their input beyond
//! [`jitter`], which by definition looks at consecutive pairs.
//! Everything else is order-insensitive, so samples appended concurrently
//! by several workers may be fed in as they were collected.

/// Arithmetic mean. Returns 0 for an empty sequence.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Mean absolute difference between consecutive elements.
///
/// Returns 0 if there are fewer than 2 elements.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jitter(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.;
    }
    let total: f64 = xs.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (xs.len() - 1) as f64
}

/// Population variance (divides by N, not N-1).
///
/// Returns 0 if there are fewer than 2 elements.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.;
    }
    // Identical inputs must give exactly zero; summation rounding could otherwise leave a residue.
    if xs.iter().all(|x| x.to_bits() == xs[0].to_bits()) {
        return 0.;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64
}

/// Standard deviation divided by the mean.
///
/// Returns `None` when the mean is zero (or the input is empty), as the ratio is then undefined.
#[must_use]
pub fn coefficient_of_variation(xs: &[f64]) -> Option<f64> {
    let m = mean(xs);
    if m == 0. || !m.is_finite() {
        return None;
    }
    Some(variance(xs).sqrt() / m.abs())
}

/// Has the measurement converged?
///
/// True iff the window holds at least `min_count` samples and their coefficient of variation
/// does not exceed `max_coefficient`. An undefined coefficient counts as not stable.
#[must_use]
pub fn is_stable(window: &[f64], min_count: usize, max_coefficient: f64) -> bool {
    if window.len() < min_count {
        return false;
    }
    coefficient_of_variation(window).is_some_and(|cv| cv <= max_coefficient)
}

/// Percentage of packets lost, in the range 0 to 100.
///
/// Nothing sent means nothing lost.
#[must_use]
pub fn packet_loss_ratio(sent: u32, received: u32) -> f64 {
    if sent == 0 {
        return 0.;
    }
    let lost = f64::from(sent) - f64::from(received);
    (lost / f64::from(sent)).max(0.) * 100.
}

/// Combines the headline metrics into a single 0-100 figure of merit.
///
/// * starts at 100
/// * loses 5 points per percent of packet loss
/// * loses 2 points per 10ms of jitter, at most 20
/// * loses 1 point per 10 units of throughput variance, at most 15
/// * gains 5 points if the average latency is under 20ms (but non-zero)
///
/// The result is clamped to `[0, 100]`.
#[must_use]
pub fn stability_score(
    packet_loss_pct: f64,
    jitter_ms: f64,
    speed_variance: f64,
    avg_latency_ms: f64,
) -> f64 {
    let mut score = 100.;
    score -= packet_loss_pct * 5.;
    score -= (jitter_ms / 10. * 2.).min(20.);
    score -= (speed_variance / 10.).min(15.);
    if avg_latency_ms > 0. && avg_latency_ms < 20. {
        score += 5.;
    }
    if score.is_nan() {
        return 0.;
    }
    score.clamp(0., 100.)
}
