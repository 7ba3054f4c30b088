use super::{Bar, BarClosed, SymbolStream};
use crate::{
    supervisor::ConnectionState,
    tick::{Symbol, Tick, normalizer::TickAnomaly},
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Buckets one symbol's ticks into base timeframe OHLCV bars.
///
/// A bar is sealed only when the first tick of a later bucket arrives (or on an explicit
/// flush), so there is no wall-clock timer involved. Empty buckets are skipped.
#[derive(Debug, Clone)]
pub struct BarBuilder {
    stream: SymbolStream,
}

impl BarBuilder {
    pub fn new(symbol: Symbol, timeframe: Timeframe, history: usize) -> Self {
        Self {
            stream: SymbolStream::new(symbol, timeframe, history),
        }
    }

    pub fn stream(&self) -> &SymbolStream {
        &self.stream
    }

    pub(crate) fn set_health(&mut self, health: ConnectionState) {
        self.stream.set_health(health);
    }

    /// Reject a [`Tick`] that is earlier than the open bar, or earlier than the end of the
    /// last sealed bucket. Nothing is mutated.
    pub fn check_order(&self, tick: &Tick) -> Result<(), TickAnomaly> {
        if let Some(sealed_until) = self.stream.sealed_until() {
            if tick.event_time < sealed_until {
                debug!(
                    symbol = %tick.symbol,
                    event_time = %tick.event_time,
                    %sealed_until,
                    "rejecting tick for an already sealed bucket"
                );
                return Err(TickAnomaly::OutOfOrder);
            }
        }

        if let Some(open_bucket) = self.stream.open_bar().map(|bar| bar.bucket_start) {
            if self.stream.timeframe().bucket_start(tick.event_time) < open_bucket {
                debug!(
                    symbol = %tick.symbol,
                    event_time = %tick.event_time,
                    %open_bucket,
                    "rejecting out-of-order tick"
                );
                return Err(TickAnomaly::OutOfOrder);
            }
        }

        Ok(())
    }

    /// Apply a validated [`Tick`]. Returns the [`BarClosed`] event when the tick crosses into a
    /// later bucket than the open bar.
    ///
    /// Out-of-order ticks are rejected, see [`Self::check_order`].
    pub fn ingest(&mut self, tick: &Tick) -> Result<Option<BarClosed>, TickAnomaly> {
        self.check_order(tick)?;

        let timeframe = self.stream.timeframe();
        let tick_bucket = timeframe.bucket_start(tick.event_time);

        match self.stream.open_bar().map(|bar| bar.bucket_start) {
            None => {
                self.stream.set_open(Bar::from_tick(tick, timeframe));
                Ok(None)
            }
            Some(open_bucket) if tick_bucket == open_bucket => {
                if let Some(bar) = self.stream.open_mut() {
                    bar.apply_tick(tick);
                }
                Ok(None)
            }
            Some(_) => {
                let closed = self.stream.seal_open(false);
                self.stream.set_open(Bar::from_tick(tick, timeframe));
                Ok(closed)
            }
        }
    }

    /// Seal the open bar before its bucket has been observed to completion.
    pub fn flush(&mut self) -> Option<BarClosed> {
        self.stream.seal_open(true)
    }

    /// Seal the open bar at wall-clock `now`. It is `partial` only if its bucket had not yet
    /// ended, since a bar only seals when the next bucket's first tick arrives.
    pub fn flush_at(&mut self, now: DateTime<Utc>) -> Option<BarClosed> {
        let ended = self.stream.open_bar()?.bucket_end <= now;
        self.stream.seal_open(!ended)
    }

    /// Get the open bar's latest price (for display even without complete bars).
    pub fn current_price(&self) -> Option<f64> {
        self.stream.open_bar().map(|bar| bar.close)
    }
}
