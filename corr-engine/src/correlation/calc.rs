//! Batch Pearson correlation, lead/lag and strength classification.
//!
//! All calculations operate on bar-to-bar simple returns.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Variances below this fraction of the raw second moment are treated as zero.
pub(crate) const RELATIVE_VARIANCE_EPSILON: f64 = 1e-9;

/// Default maximum lag (in buckets) searched by [`lead_lag`].
pub const DEFAULT_MAX_LAG: usize = 6;

/// Minimum number of overlapping samples required at a given lag.
pub const MIN_LAG_OVERLAP: usize = 5;

/// Pearson correlation coefficient of two equally sized return slices.
///
/// Returns `None` when fewer than two samples exist, the lengths differ, or either series has
/// (numerically) zero variance. Otherwise the result lies in `[-1, 1]`.
pub fn pearson(returns_a: &[f64], returns_b: &[f64]) -> Option<f64> {
    if returns_a.len() != returns_b.len() || returns_a.len() < 2 {
        return None;
    }

    let n = returns_a.len() as f64;
    let mean_a = returns_a.iter().sum::<f64>() / n;
    let mean_b = returns_b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut raw_a = 0.0;
    let mut raw_b = 0.0;

    for (a, b) in returns_a.iter().zip(returns_b) {
        let diff_a = a - mean_a;
        let diff_b = b - mean_b;
        cov += diff_a * diff_b;
        var_a += diff_a * diff_a;
        var_b += diff_b * diff_b;
        raw_a += a * a;
        raw_b += b * b;
    }

    if is_degenerate(var_a, raw_a) || is_degenerate(var_b, raw_b) {
        return None;
    }

    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

/// Returns true if a (scaled) variance is zero relative to its raw second moment.
pub(crate) fn is_degenerate(variance: f64, raw_second_moment: f64) -> bool {
    !variance.is_finite() || variance <= RELATIVE_VARIANCE_EPSILON * raw_second_moment
}

/// Best cross-correlation across lags, see [`lead_lag`].
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct LeadLag {
    /// Lag in buckets. Positive means symbol A leads symbol B.
    pub lag: i32,
    pub coefficient: f64,
}

/// Find which symbol leads by testing correlation at lags within `±max_lag` buckets.
///
/// At a positive lag `k`, A's return at bucket `t` is compared with B's return at `t + k`.
/// Lags with fewer than [`MIN_LAG_OVERLAP`] overlapping samples are skipped. The lag with the
/// greatest absolute coefficient wins, ties resolved towards the smaller lag.
pub fn lead_lag(returns_a: &[f64], returns_b: &[f64], max_lag: usize) -> Option<LeadLag> {
    let len = returns_a.len().min(returns_b.len());
    let max_lag = max_lag.min(len.saturating_sub(MIN_LAG_OVERLAP));
    let mut best: Option<LeadLag> = None;

    for lag in 0..=max_lag {
        let remaining = len - lag;
        let mut candidates = vec![(
            lag as i32,
            pearson(&returns_a[..remaining], &returns_b[lag..lag + remaining]),
        )];
        if lag > 0 {
            // B leads: shift A forward
            candidates.push((
                -(lag as i32),
                pearson(&returns_a[lag..lag + remaining], &returns_b[..remaining]),
            ));
        }

        for (lag, coefficient) in candidates {
            let Some(coefficient) = coefficient else {
                continue;
            };
            if best.is_none_or(|best| coefficient.abs() > best.coefficient.abs()) {
                best = Some(LeadLag { lag, coefficient });
            }
        }
    }

    best
}

/// Qualitative bucket of an absolute correlation coefficient.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize, Serialize, Display)]
pub enum CorrelationStrength {
    Strong,
    Moderate,
    Weak,
    Negligible,
}

impl CorrelationStrength {
    pub fn from_coefficient(coefficient: f64) -> Self {
        match coefficient.abs() {
            r if r > 0.7 => Self::Strong,
            r if r > 0.4 => Self::Moderate,
            r if r > 0.2 => Self::Weak,
            _ => Self::Negligible,
        }
    }
}
