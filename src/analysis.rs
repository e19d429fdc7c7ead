//! Small helpers over acquired counts.

use crate::error::{AppResult, WebSqError};
use crate::network::Sample;

/// The same setting for each of `detectors` detectors.
///
/// ```
/// assert_eq!(websq_control::analysis::uniform_setting(3, 8.5), vec![8.5; 3]);
/// ```
pub fn uniform_setting(detectors: usize, value: f64) -> Vec<f64> {
    vec![value; detectors]
}

/// Convert per-period counts into counts per second.
///
/// Timestamps are kept as reported.
pub fn count_rates(samples: &[Sample], period_ms: f64) -> AppResult<Vec<Sample>> {
    if period_ms <= 0.0 || !period_ms.is_finite() {
        return Err(WebSqError::InvalidArgument(format!(
            "measurement period must be positive, got {period_ms} ms"
        )));
    }
    let period_s = period_ms / 1000.0;
    Ok(samples
        .iter()
        .map(|sample| Sample {
            timestamp: sample.timestamp,
            counts: sample.counts.iter().map(|c| c / period_s).collect(),
        })
        .collect())
}

/// Per-channel mean over `samples`.
///
/// `None` for an empty batch. Samples with fewer channels than the first one
/// only contribute to the channels they carry.
pub fn channel_means(samples: &[Sample]) -> Option<Vec<f64>> {
    let channels = samples.first()?.channels();
    let mut sums = vec![0.0; channels];
    let mut seen = vec![0usize; channels];
    for sample in samples {
        for (i, count) in sample.counts.iter().take(channels).enumerate() {
            sums[i] += count;
            seen[i] += 1;
        }
    }
    Some(
        sums.into_iter()
            .zip(seen)
            .map(|(sum, n)| if n == 0 { 0.0 } else { sum / n as f64 })
            .collect(),
    )
}
