//! Per-axis repeatability statistics.

use serde::Serialize;

/// Share within one standard deviation expected of a normal distribution.
pub const EXPECTED_WITHIN_1_SIGMA: f64 = 0.68;

/// Spread (2σ, in mm) above which a non-normal axis is worth checking.
pub const SUSPECT_SPREAD_MM: f64 = 0.1;

/// Summary of one axis across a tool's trials.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisStats {
    pub mean: f64,
    pub median: f64,
    pub max: f64,
    pub min: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub range: f64,
    /// Fraction of values within `mean ± σ`.
    pub within_1_sigma: f64,
    /// Fraction of values within `mean ± 2σ`.
    pub within_2_sigma: f64,
    pub suspect: bool,
}

impl AxisStats {
    /// `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let std_dev = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        // Shares use σ at the reported 0.001 mm resolution.
        let sigma = round_to(std_dev, 3);
        let within_1_sigma = share_within(values, mean, sigma);
        let within_2_sigma = share_within(values, mean, 2.0 * sigma);

        Some(Self {
            mean,
            median: median(values),
            max,
            min,
            std_dev,
            range: max - min,
            within_1_sigma,
            within_2_sigma,
            suspect: is_suspect(within_1_sigma, sigma),
        })
    }
}

/// An axis is suspect when fewer than 68% of its values fall within one σ
/// of the mean and 2σ exceeds 0.1 mm.
pub fn is_suspect(within_1_sigma: f64, std_dev: f64) -> bool {
    within_1_sigma < EXPECTED_WITHIN_1_SIGMA && 2.0 * std_dev > SUSPECT_SPREAD_MM
}

fn share_within(values: &[f64], mean: f64, band: f64) -> f64 {
    let inside = values
        .iter()
        .filter(|&&v| v >= mean - band && v <= mean + band)
        .count();
    inside as f64 / values.len() as f64
}

pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => f64::NAN,
        n if n % 2 == 0 => (sorted[mid - 1] + sorted[mid]) / 2.0,
        _ => sorted[mid],
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_basic_statistics() {
        let stats = AxisStats::from_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_relative_eq!(stats.mean, 2.5);
        assert_relative_eq!(stats.median, 2.5);
        assert_relative_eq!(stats.max, 4.0);
        assert_relative_eq!(stats.min, 1.0);
        assert_relative_eq!(stats.range, 3.0);
        assert_relative_eq!(stats.std_dev, 1.25f64.sqrt());
        assert!(AxisStats::from_values(&[]).is_none());
    }

    #[test]
    fn test_tight_cluster_is_not_suspect() {
        let stats = AxisStats::from_values(&[0.10, 0.11, 0.10, 0.11]).unwrap();
        assert!(!stats.suspect);
    }

    #[test]
    fn test_wide_bimodal_spread_is_suspect() {
        // σ ≈ 0.141: only the two middle values are within one σ.
        let stats = AxisStats::from_values(&[0.0, 0.2, 0.2, 0.4]).unwrap();
        assert_relative_eq!(stats.within_1_sigma, 0.5);
        assert!(stats.suspect);
    }

    #[test]
    fn test_outlier_against_the_rule() {
        // Three of four values stay within one σ of the mean, so the 68%
        // condition holds even though the range is large.
        let stats = AxisStats::from_values(&[0.10, 0.12, 0.11, 0.50]).unwrap();
        assert_relative_eq!(stats.within_1_sigma, 0.75);
        assert!(!stats.suspect);
        assert!(stats.range > SUSPECT_SPREAD_MM);
    }

    #[test]
    fn test_suspect_needs_both_conditions() {
        assert!(is_suspect(0.5, 0.06));
        assert!(!is_suspect(0.5, 0.04));
        assert!(!is_suspect(0.75, 0.2));
    }
}
