use super::{Bar, BarClosed};
use crate::{supervisor::ConnectionState, tick::Symbol, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Per (symbol, timeframe) bar state: at most one open bar, a bounded ring of the most recent
/// closed bars, and the health inherited from the source feeding the symbol.
#[derive(Debug, Clone)]
pub struct SymbolStream {
    symbol: Symbol,
    timeframe: Timeframe,
    open: Option<Bar>,
    closed: VecDeque<Bar>,
    capacity: usize,
    health: ConnectionState,
    sealed_until: Option<DateTime<Utc>>,
}

impl SymbolStream {
    pub fn new(symbol: Symbol, timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            symbol,
            timeframe,
            open: None,
            closed: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            health: ConnectionState::Reconnecting,
            sealed_until: None,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn open_bar(&self) -> Option<&Bar> {
        self.open.as_ref()
    }

    /// The open bar if one exists, otherwise the most recently closed bar.
    pub fn latest_bar(&self) -> Option<&Bar> {
        self.open.as_ref().or_else(|| self.closed.back())
    }

    pub fn last_closed(&self) -> Option<&Bar> {
        self.closed.back()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.closed.back().map(|bar| bar.close)
    }

    /// Closed bars, oldest first.
    pub fn closed_bars(&self) -> impl DoubleEndedIterator<Item = &Bar> + ExactSizeIterator {
        self.closed.iter()
    }

    /// Get the last N closed bars, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<&Bar> {
        let start = self.closed.len().saturating_sub(n);
        self.closed.range(start..).collect()
    }

    pub fn len(&self) -> usize {
        self.closed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closed.is_empty()
    }

    pub fn health(&self) -> ConnectionState {
        self.health
    }

    pub(crate) fn set_health(&mut self, health: ConnectionState) {
        self.health = health;
    }

    /// End of the most recently sealed bucket. Nothing earlier may open a new bar.
    pub(crate) fn sealed_until(&self) -> Option<DateTime<Utc>> {
        self.sealed_until
    }

    pub(crate) fn open_mut(&mut self) -> Option<&mut Bar> {
        self.open.as_mut()
    }

    pub(crate) fn set_open(&mut self, bar: Bar) {
        debug_assert!(self.open.is_none(), "a stream holds at most one open bar");
        self.open = Some(bar);
    }

    /// Seal the open bar (if any), archive it and return the [`BarClosed`] event.
    pub(crate) fn seal_open(&mut self, partial: bool) -> Option<BarClosed> {
        let mut bar = self.open.take()?;
        bar.partial |= partial;
        if !bar.seal() {
            return None;
        }

        let prev_close = self.last_close();
        self.sealed_until = Some(bar.bucket_end);

        if self.closed.len() >= self.capacity {
            self.closed.pop_front();
        }
        self.closed.push_back(bar.clone());

        Some(BarClosed { bar, prev_close })
    }
}
