//! OHLCV bar aggregation.
//!
//! Ticks are bucketed into base timeframe bars by the [`BarBuilder`], and coarser bars are
//! folded from sealed base bars by the [`TimeframeRoller`]. Bar boundaries are derived from
//! tick event times, never from the wall clock.

use crate::{
    tick::{Symbol, Tick},
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod builder;
mod roller;
mod stream;

pub use builder::BarBuilder;
pub use roller::TimeframeRoller;
pub use stream::SymbolStream;

/// OHLCV summary of one symbol over one bucket of a [`Timeframe`].
///
/// Mutated only by its owning builder/roller while `closed == false`; handed downstream by
/// value once sealed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub tick_count: u64,
    pub closed: bool,
    /// Built from an incomplete sequence: gapped base bars, or sealed early by a flush.
    pub partial: bool,
}

impl Bar {
    pub(crate) fn from_tick(tick: &Tick, timeframe: Timeframe) -> Self {
        let bucket_start = timeframe.bucket_start(tick.event_time);
        Self {
            symbol: tick.symbol.clone(),
            timeframe,
            bucket_start,
            bucket_end: bucket_start + timeframe.width(),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.size.unwrap_or(0.0),
            tick_count: 1,
            closed: false,
            partial: false,
        }
    }

    pub(crate) fn apply_tick(&mut self, tick: &Tick) {
        debug_assert!(!self.closed, "sealed bars are immutable");
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.size.unwrap_or(0.0);
        self.tick_count += 1;
    }

    pub(crate) fn from_base(base: &Bar, timeframe: Timeframe) -> Self {
        let bucket_start = timeframe.bucket_start(base.bucket_start);
        Self {
            symbol: base.symbol.clone(),
            timeframe,
            bucket_start,
            bucket_end: bucket_start + timeframe.width(),
            open: base.open,
            high: base.high,
            low: base.low,
            close: base.close,
            volume: base.volume,
            tick_count: base.tick_count,
            closed: false,
            partial: base.partial || base.bucket_start != bucket_start,
        }
    }

    pub(crate) fn merge_base(&mut self, base: &Bar) {
        debug_assert!(!self.closed, "sealed bars are immutable");
        self.high = self.high.max(base.high);
        self.low = self.low.min(base.low);
        self.close = base.close;
        self.volume += base.volume;
        self.tick_count += base.tick_count;
        self.partial |= base.partial;
    }

    /// Mark the bar closed. Returns `false` if it was already sealed.
    pub(crate) fn seal(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        true
    }

    /// Returns true if `time` falls inside `[bucket_start, bucket_end)`.
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.bucket_start <= time && time < self.bucket_end
    }
}

/// Emitted exactly once per sealed [`Bar`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BarClosed {
    pub bar: Bar,
    /// Close of the previously sealed bar in the same symbol stream, if any.
    pub prev_close: Option<f64>,
}

impl BarClosed {
    /// Simple return `(close - prev_close) / prev_close`; undefined without a non-zero previous close.
    pub fn bar_return(&self) -> Option<f64> {
        match self.prev_close {
            Some(prev_close) if prev_close != 0.0 && prev_close.is_finite() => {
                Some((self.bar.close - prev_close) / prev_close)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, ms: i64) -> Tick {
        Tick::new(
            "crypto",
            "BTC",
            price,
            Some(1.0),
            DateTime::from_timestamp_millis(ms).unwrap(),
        )
    }

    #[test]
    fn test_bar_seal_is_idempotent() {
        let mut bar = Bar::from_tick(&tick(100.0, 1_700_000_040_000), Timeframe::M1);
        assert!(bar.seal());
        let sealed = bar.clone();
        assert!(!bar.seal());
        assert_eq!(bar, sealed);
    }

    #[test]
    fn test_bar_return() {
        struct TestCase {
            prev_close: Option<f64>,
            close: f64,
            expected: Option<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: defined return
                prev_close: Some(100.0),
                close: 101.0,
                expected: Some(0.01),
            },
            TestCase {
                // TC1: no previous close
                prev_close: None,
                close: 101.0,
                expected: None,
            },
            TestCase {
                // TC2: zero previous close
                prev_close: Some(0.0),
                close: 101.0,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut bar = Bar::from_tick(&tick(test.close, 1_700_000_040_000), Timeframe::M1);
            bar.seal();
            let closed = BarClosed {
                bar,
                prev_close: test.prev_close,
            };
            match (closed.bar_return(), test.expected) {
                (Some(actual), Some(expected)) => {
                    assert!((actual - expected).abs() < 1e-12, "TC{} failed", index)
                }
                (actual, expected) => assert_eq!(actual, expected, "TC{} failed", index),
            }
        }
    }
}
