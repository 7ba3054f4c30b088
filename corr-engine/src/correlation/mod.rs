//! Rolling cross-asset correlation per timeframe.

use crate::{sync::PairedSample, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Batch Pearson, lead/lag and strength classification.
pub mod calc;

mod window;

pub use calc::{CorrelationStrength, LeadLag};
pub use window::CorrelationWindow;

/// Copy-out view of one timeframe's rolling correlation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CorrelationSnapshot {
    pub timeframe: Timeframe,
    /// Null (not zero) when fewer than two samples exist or either variance is zero.
    pub coefficient: Option<f64>,
    pub sample_count: usize,
    /// End of the most recent bucket contributing to the window.
    pub as_of: Option<DateTime<Utc>>,
    pub strength: Option<CorrelationStrength>,
    pub lead_lag: Option<LeadLag>,
}

impl CorrelationSnapshot {
    fn empty(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            coefficient: None,
            sample_count: 0,
            as_of: None,
            strength: None,
            lead_lag: None,
        }
    }
}

#[derive(Debug, Clone)]
struct TimeframeCorrelation {
    window: CorrelationWindow,
    snapshot: CorrelationSnapshot,
    /// Window changed since lead/lag was last computed.
    lead_lag_dirty: bool,
}

/// Owns one [`CorrelationWindow`] per timeframe for the lifetime of the process, and the
/// latest [`CorrelationSnapshot`] of each, overwritten in place.
#[derive(Debug, Clone)]
pub struct CorrelationEngine {
    timeframes: BTreeMap<Timeframe, TimeframeCorrelation>,
    max_lag: usize,
}

impl CorrelationEngine {
    /// Construct a [`CorrelationEngine`] from `(timeframe, window size)` pairs.
    pub fn new<Iter>(windows: Iter) -> Self
    where
        Iter: IntoIterator<Item = (Timeframe, usize)>,
    {
        Self {
            timeframes: windows
                .into_iter()
                .map(|(timeframe, size)| {
                    (
                        timeframe,
                        TimeframeCorrelation {
                            window: CorrelationWindow::new(size),
                            snapshot: CorrelationSnapshot::empty(timeframe),
                            lead_lag_dirty: false,
                        },
                    )
                })
                .collect(),
            max_lag: calc::DEFAULT_MAX_LAG,
        }
    }

    pub fn with_max_lag(mut self, max_lag: usize) -> Self {
        self.max_lag = max_lag;
        self
    }

    /// Append a [`PairedSample`] to its timeframe's window and refresh the snapshot.
    ///
    /// O(1): `lead_lag` keeps its previous value until the next [`Self::refresh_lead_lag`].
    /// Returns the refreshed snapshot, or `None` if the timeframe is not tracked.
    pub fn on_paired_sample(&mut self, sample: &PairedSample) -> Option<CorrelationSnapshot> {
        let Some(state) = self.timeframes.get_mut(&sample.timeframe) else {
            warn!(timeframe = %sample.timeframe, "paired sample for untracked timeframe");
            return None;
        };

        state.window.push(sample.return_a, sample.return_b);

        let coefficient = state.window.coefficient();

        state.snapshot = CorrelationSnapshot {
            timeframe: sample.timeframe,
            coefficient,
            sample_count: state.window.len(),
            as_of: Some(sample.bucket_start + sample.timeframe.width()),
            strength: coefficient.map(CorrelationStrength::from_coefficient),
            lead_lag: state.snapshot.lead_lag,
        };
        state.lead_lag_dirty = true;

        debug!(
            timeframe = %sample.timeframe,
            bucket_start = %sample.bucket_start,
            coefficient = ?state.snapshot.coefficient,
            sample_count = state.snapshot.sample_count,
            "correlation updated"
        );

        Some(state.snapshot.clone())
    }

    /// Recompute `lead_lag` over the window of every timeframe that received samples since
    /// the last refresh. O(window * lags) each. Returns the number of timeframes refreshed.
    pub fn refresh_lead_lag(&mut self) -> usize {
        let mut refreshed = 0;
        for state in self.timeframes.values_mut().filter(|state| state.lead_lag_dirty) {
            let (returns_a, returns_b) = state.window.returns();
            state.snapshot.lead_lag = calc::lead_lag(&returns_a, &returns_b, self.max_lag);
            state.lead_lag_dirty = false;
            refreshed += 1;
        }
        refreshed
    }

    pub fn snapshot(&self, timeframe: Timeframe) -> Option<CorrelationSnapshot> {
        self.timeframes
            .get(&timeframe)
            .map(|state| state.snapshot.clone())
    }

    /// Every tracked timeframe's snapshot, ascending by timeframe.
    pub fn snapshots(&self) -> Vec<CorrelationSnapshot> {
        self.timeframes
            .values()
            .map(|state| state.snapshot.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(timeframe: Timeframe, index: i64, return_a: f64, return_b: f64) -> PairedSample {
        PairedSample {
            timeframe,
            bucket_start: DateTime::from_timestamp_millis(
                1_699_999_200_000 + index * timeframe.width_ms(),
            )
            .unwrap(),
            return_a,
            return_b,
        }
    }

    #[test]
    fn test_engine_snapshot_lifecycle() {
        let mut engine = CorrelationEngine::new([(Timeframe::M1, 4), (Timeframe::M5, 4)]);

        let empty = engine.snapshot(Timeframe::M1).unwrap();
        assert_eq!(empty.coefficient, None);
        assert_eq!(empty.sample_count, 0);
        assert_eq!(empty.as_of, None);

        engine.on_paired_sample(&sample(Timeframe::M1, 0, 0.01, 0.005));
        let one = engine.snapshot(Timeframe::M1).unwrap();
        assert_eq!(one.coefficient, None);
        assert_eq!(one.strength, None);
        assert_eq!(one.sample_count, 1);

        let returns = [(-0.01, -0.004), (0.02, 0.011), (-0.005, -0.002), (0.015, 0.007)];
        for (index, (a, b)) in returns.iter().enumerate() {
            engine.on_paired_sample(&sample(Timeframe::M1, index as i64 + 1, *a, *b));
        }

        let full = engine.snapshot(Timeframe::M1).unwrap();
        assert_eq!(full.sample_count, 4);
        assert!(full.coefficient.unwrap() > 0.95);
        assert_eq!(full.strength, Some(CorrelationStrength::Strong));
        assert_eq!(
            full.as_of,
            DateTime::from_timestamp_millis(1_699_999_200_000 + 5 * 60_000)
        );

        // Other timeframes are untouched
        assert_eq!(engine.snapshot(Timeframe::M5).unwrap().sample_count, 0);
        assert_eq!(engine.snapshots().len(), 2);
    }

    #[test]
    fn test_engine_ignores_untracked_timeframe() {
        let mut engine = CorrelationEngine::new([(Timeframe::M1, 4)]);
        assert!(engine.on_paired_sample(&sample(Timeframe::H1, 0, 0.01, 0.01)).is_none());
        assert!(engine.snapshot(Timeframe::H1).is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut engine = CorrelationEngine::new([(Timeframe::M1, 4)]);
        let before = engine.snapshot(Timeframe::M1).unwrap();
        engine.on_paired_sample(&sample(Timeframe::M1, 0, 0.01, 0.01));
        assert_eq!(before.sample_count, 0);
    }

    #[test]
    fn test_lead_lag_refreshes_off_the_sample_path() {
        let mut engine = CorrelationEngine::new([(Timeframe::M1, 32), (Timeframe::M5, 8)]);

        // B repeats A one bucket later, so A leads by one
        let signal = [0.01, -0.02, 0.015, -0.005, 0.03, -0.01, 0.02, -0.025, 0.005, 0.012];
        for index in 0..signal.len() {
            let return_b = if index == 0 { 0.0 } else { signal[index - 1] };
            let snapshot = engine
                .on_paired_sample(&sample(Timeframe::M1, index as i64, signal[index], return_b))
                .unwrap();
            assert_eq!(snapshot.lead_lag, None);
        }

        assert_eq!(engine.refresh_lead_lag(), 1);
        let lead_lag = engine.snapshot(Timeframe::M1).unwrap().lead_lag.unwrap();
        assert_eq!(lead_lag.lag, 1);

        // Nothing changed since, nothing to refresh
        assert_eq!(engine.refresh_lead_lag(), 0);

        // A new sample keeps the last computed value until the next refresh
        let next = engine
            .on_paired_sample(&sample(Timeframe::M1, 10, 0.004, 0.012))
            .unwrap();
        assert_eq!(next.lead_lag, Some(lead_lag));
        assert_eq!(next.sample_count, 11);
    }
}
