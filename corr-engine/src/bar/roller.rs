use super::{Bar, BarClosed, SymbolStream};
use crate::{supervisor::ConnectionState, tick::Symbol, timeframe::Timeframe};
use chrono::{DateTime, Utc};
use tracing::warn;

#[derive(Debug, Clone)]
struct CoarseLane {
    stream: SymbolStream,
    /// `bucket_end` of the last base bar folded into this lane.
    expected_next: Option<DateTime<Utc>>,
}

/// Derives coarser bars (eg/ 5m, 15m, 1h) for one symbol by folding sealed base bars.
///
/// Coarse bars are sealed when a base bar belonging to the next coarse bucket arrives. A base
/// sequence with a `bucket_start` discontinuity still seals at the correct boundary, but the
/// coarse bar is flagged `partial`.
#[derive(Debug, Clone)]
pub struct TimeframeRoller {
    lanes: Vec<CoarseLane>,
}

impl TimeframeRoller {
    pub fn new(symbol: Symbol, timeframes: &[Timeframe], history: usize) -> Self {
        Self {
            lanes: timeframes
                .iter()
                .map(|timeframe| CoarseLane {
                    stream: SymbolStream::new(symbol.clone(), *timeframe, history),
                    expected_next: None,
                })
                .collect(),
        }
    }

    pub fn streams(&self) -> impl Iterator<Item = &SymbolStream> {
        self.lanes.iter().map(|lane| &lane.stream)
    }

    pub fn stream(&self, timeframe: Timeframe) -> Option<&SymbolStream> {
        self.streams().find(|stream| stream.timeframe() == timeframe)
    }

    pub(crate) fn set_health(&mut self, health: ConnectionState) {
        for lane in &mut self.lanes {
            lane.stream.set_health(health);
        }
    }

    /// Fold a sealed base [`Bar`] into every coarse timeframe, returning the coarse bars it seals.
    pub fn on_bar_closed(&mut self, base: &Bar) -> Vec<BarClosed> {
        let mut sealed = Vec::new();

        for lane in &mut self.lanes {
            let timeframe = lane.stream.timeframe();
            let coarse_start = timeframe.bucket_start(base.bucket_start);
            let active = lane.stream.open_bar().map(|bar| (bar.bucket_start, bar.bucket_end));

            match active {
                Some((active_start, _)) if coarse_start == active_start => {
                    let gapped = lane.expected_next != Some(base.bucket_start);
                    if let Some(bar) = lane.stream.open_mut() {
                        bar.merge_base(base);
                        bar.partial |= gapped;
                    }
                }
                Some((active_start, active_end)) if coarse_start > active_start => {
                    let incomplete = lane.expected_next != Some(active_end);
                    sealed.extend(lane.stream.seal_open(incomplete));
                    lane.stream.set_open(Bar::from_base(base, timeframe));
                }
                Some((active_start, _)) => {
                    warn!(
                        symbol = %base.symbol,
                        %timeframe,
                        base_bucket = %base.bucket_start,
                        %active_start,
                        "ignoring base bar older than the active coarse bucket"
                    );
                    continue;
                }
                None => {
                    if lane
                        .stream
                        .sealed_until()
                        .is_some_and(|sealed_until| base.bucket_start < sealed_until)
                    {
                        warn!(
                            symbol = %base.symbol,
                            %timeframe,
                            base_bucket = %base.bucket_start,
                            "ignoring base bar for an already sealed coarse bucket"
                        );
                        continue;
                    }
                    lane.stream.set_open(Bar::from_base(base, timeframe));
                }
            }

            lane.expected_next = Some(base.bucket_end);
        }

        sealed
    }

    /// Seal every active coarse bar (eg/ on shutdown), flagging incomplete ones as `partial`.
    pub fn flush(&mut self) -> Vec<BarClosed> {
        self.lanes
            .iter_mut()
            .filter_map(|lane| {
                let active_end = lane.stream.open_bar()?.bucket_end;
                let incomplete = lane.expected_next != Some(active_end);
                lane.stream.seal_open(incomplete)
            })
            .collect()
    }
}
