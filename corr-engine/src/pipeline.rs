//! Single-writer aggregation pipeline.
//!
//! ```text
//! TickNormalizer -> BarBuilder -> TimeframeRoller -> Synchronizer -> CorrelationEngine
//! ```
//!
//! Every piece of bar, pairing and correlation state is owned by one [`Pipeline`], fed by a
//! multi-producer queue of [`PipelineEvent`]s. External readers only ever see copies.

use crate::{
    bar::{BarBuilder, BarClosed, SymbolStream, TimeframeRoller},
    broadcast::{BroadcastHub, SnapshotSet},
    config::EngineConfig,
    correlation::{CorrelationEngine, CorrelationSnapshot},
    error::ConfigError,
    supervisor::{ConnectionState, SourceHealth},
    sync::{PairedSample, Side, SyncStats, Synchronizer},
    tick::{
        SourceId, Symbol, Tick,
        normalizer::{RejectionCounts, TickAnomaly, TickNormalizer},
    },
    timeframe::Timeframe,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Inbound message of the aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Tick(Tick),
    Health(SourceHealth),
    Shutdown,
}

/// Running counters of the [`Pipeline`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineStats {
    pub ticks_accepted: u64,
    pub rejections: RejectionCounts,
    pub bars_closed: u64,
    pub samples: u64,
}

#[derive(Debug, Clone)]
struct SymbolLane {
    side: Side,
    source_id: SourceId,
    health: ConnectionState,
    builder: BarBuilder,
    roller: TimeframeRoller,
}

impl SymbolLane {
    fn new(side: Side, symbol: Symbol, source_id: SourceId, config: &EngineConfig) -> Self {
        let history = config.history_capacity();
        Self {
            side,
            source_id,
            health: ConnectionState::Reconnecting,
            builder: BarBuilder::new(symbol.clone(), config.base_timeframe, history),
            roller: TimeframeRoller::new(symbol, &config.coarse_timeframes(), history),
        }
    }

    fn symbol(&self) -> &Symbol {
        self.builder.stream().symbol()
    }

    fn set_health(&mut self, health: ConnectionState) {
        self.health = health;
        self.builder.set_health(health);
        self.roller.set_health(health);
    }

    fn streams(&self) -> impl Iterator<Item = &SymbolStream> {
        std::iter::once(self.builder.stream()).chain(self.roller.streams())
    }
}

/// Owns the per-symbol bar state, the per-timeframe synchronizers and the correlation engine.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: EngineConfig,
    normalizer: TickNormalizer,
    lanes: [SymbolLane; 2],
    synchronizers: BTreeMap<Timeframe, Synchronizer>,
    correlation: CorrelationEngine,
    health: BTreeMap<SourceId, SourceHealth>,
    stats: PipelineStats,
}

impl Pipeline {
    /// Construct a [`Pipeline`] after validating the [`EngineConfig`].
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let pair = &config.pair;
        let lanes = [
            SymbolLane::new(Side::A, pair.symbol_a.clone(), pair.source_a.clone(), &config),
            SymbolLane::new(Side::B, pair.symbol_b.clone(), pair.source_b.clone(), &config),
        ];

        let synchronizers = config
            .timeframes
            .iter()
            .map(|timeframe| {
                (
                    *timeframe,
                    Synchronizer::new(
                        *timeframe,
                        config.grace(*timeframe),
                        config.sync.include_partial_bars,
                        config.sync.resolved_retention,
                    ),
                )
            })
            .collect();

        let correlation = CorrelationEngine::new(
            config
                .timeframes
                .iter()
                .map(|timeframe| (*timeframe, config.window_size(*timeframe))),
        );

        let health = [&pair.source_a, &pair.source_b]
            .into_iter()
            .map(|source_id| (source_id.clone(), SourceHealth::new(source_id.clone())))
            .collect();

        Ok(Self {
            normalizer: TickNormalizer::new(config.anomaly.clone()),
            lanes,
            synchronizers,
            correlation,
            health,
            stats: PipelineStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn sync_stats(&self, timeframe: Timeframe) -> Option<&SyncStats> {
        self.synchronizers.get(&timeframe).map(Synchronizer::stats)
    }

    pub fn correlation(&self, timeframe: Timeframe) -> Option<CorrelationSnapshot> {
        self.correlation.snapshot(timeframe)
    }

    /// Bar state of one (symbol, timeframe).
    pub fn stream(&self, symbol: &Symbol, timeframe: Timeframe) -> Option<&SymbolStream> {
        self.lanes
            .iter()
            .find(|lane| lane.symbol() == symbol)?
            .streams()
            .find(|stream| stream.timeframe() == timeframe)
    }

    pub fn health(&self) -> impl Iterator<Item = &SourceHealth> {
        self.health.values()
    }

    /// Process one [`Tick`]. Rejected ticks are counted and returned as the error, never
    /// applied. Returns the [`PairedSample`]s produced by any bars it sealed.
    pub fn on_tick(
        &mut self,
        tick: &Tick,
        now: DateTime<Utc>,
    ) -> Result<Vec<PairedSample>, TickAnomaly> {
        match self.apply_tick(tick, now) {
            Ok(samples) => {
                self.stats.ticks_accepted += 1;
                Ok(samples)
            }
            Err(anomaly) => {
                self.stats.rejections.record(&anomaly);
                debug!(
                    source = %tick.source_id,
                    symbol = %tick.symbol,
                    price = tick.price,
                    %anomaly,
                    "rejected tick"
                );
                Err(anomaly)
            }
        }
    }

    fn apply_tick(
        &mut self,
        tick: &Tick,
        now: DateTime<Utc>,
    ) -> Result<Vec<PairedSample>, TickAnomaly> {
        let index = self
            .lane_index(&tick.symbol)
            .ok_or_else(|| TickAnomaly::UnknownSymbol(tick.symbol.clone()))?;

        // Ordering first, so a rejected tick never moves the jump guard
        self.lanes[index].builder.check_order(tick)?;
        self.normalizer.check(tick)?;

        match self.lanes[index].builder.ingest(tick)? {
            Some(closed) => Ok(self.on_base_closed(index, closed, now)),
            None => Ok(Vec::new()),
        }
    }

    /// Apply a [`SourceHealth`] change. Leaving `Connected` flushes the base timeframe open
    /// bar of every symbol fed by that source. A flushed bar whose bucket had not ended by
    /// `now` is partial and stale, and is never paired. One whose bucket had already ended was
    /// built entirely while connected, so it is sealed as complete.
    pub fn on_health(&mut self, health: SourceHealth, now: DateTime<Utc>) -> Vec<PairedSample> {
        let previous = self
            .health
            .insert(health.source_id.clone(), health.clone())
            .map(|previous| previous.state);

        if previous != Some(health.state) {
            info!(
                source = %health.source_id,
                state = %health.state,
                previous = ?previous,
                failures = health.consecutive_failures,
                "source health changed"
            );
        }

        let mut samples = Vec::new();
        for index in 0..self.lanes.len() {
            if self.lanes[index].source_id != health.source_id {
                continue;
            }

            let was_connected = self.lanes[index].health == ConnectionState::Connected;
            let flushed = if was_connected && health.state != ConnectionState::Connected {
                self.lanes[index].builder.flush_at(now)
            } else {
                None
            };

            match flushed {
                Some(closed) if !closed.bar.partial => {
                    debug!(
                        symbol = %closed.bar.symbol,
                        bucket_start = %closed.bar.bucket_start,
                        "sealed completed bar on disconnect"
                    );
                    samples.extend(self.on_base_closed(index, closed, now));
                    self.lanes[index].set_health(health.state);
                }
                Some(closed) => {
                    debug!(
                        symbol = %closed.bar.symbol,
                        bucket_start = %closed.bar.bucket_start,
                        "flushed open bar on disconnect"
                    );
                    self.lanes[index].set_health(health.state);
                    samples.extend(self.on_base_closed(index, closed, now));
                }
                None => self.lanes[index].set_health(health.state),
            }
        }
        samples
    }

    /// Resolve every pending bucket past its grace deadline as unpaired, and refresh lead/lag
    /// of every window that changed since the previous sweep.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        self.correlation.refresh_lead_lag();
        self.synchronizers
            .values_mut()
            .map(|synchronizer| synchronizer.expire(now))
            .sum()
    }

    /// Seal every open bar (base and coarse). Used on shutdown.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<PairedSample> {
        let mut samples = Vec::new();
        for index in 0..self.lanes.len() {
            if let Some(closed) = self.lanes[index].builder.flush() {
                samples.extend(self.on_base_closed(index, closed, now));
            }
            let coarse = self.lanes[index].roller.flush();
            samples.extend(self.on_coarse_closed(index, coarse, now));
        }
        self.correlation.refresh_lead_lag();
        samples
    }

    /// Copy out everything a viewer needs.
    pub fn snapshot_set(&self, as_of: DateTime<Utc>) -> SnapshotSet {
        let health = self.health.values().cloned().collect::<Vec<_>>();
        SnapshotSet {
            as_of,
            bars: self
                .lanes
                .iter()
                .flat_map(SymbolLane::streams)
                .filter_map(SymbolStream::latest_bar)
                .cloned()
                .collect(),
            correlations: self.correlation.snapshots(),
            stale: health.iter().any(|health| !health.is_connected()),
            health,
        }
    }

    fn lane_index(&self, symbol: &Symbol) -> Option<usize> {
        self.lanes.iter().position(|lane| lane.symbol() == symbol)
    }

    fn on_base_closed(
        &mut self,
        index: usize,
        closed: BarClosed,
        now: DateTime<Utc>,
    ) -> Vec<PairedSample> {
        let coarse = self.lanes[index].roller.on_bar_closed(&closed.bar);
        let mut samples = self.on_closed(index, &closed, now).into_iter().collect::<Vec<_>>();
        samples.extend(self.on_coarse_closed(index, coarse, now));
        samples
    }

    fn on_coarse_closed(
        &mut self,
        index: usize,
        coarse: Vec<BarClosed>,
        now: DateTime<Utc>,
    ) -> Vec<PairedSample> {
        coarse
            .iter()
            .filter_map(|closed| self.on_closed(index, closed, now))
            .collect()
    }

    fn on_closed(
        &mut self,
        index: usize,
        closed: &BarClosed,
        now: DateTime<Utc>,
    ) -> Option<PairedSample> {
        self.stats.bars_closed += 1;

        let lane = &self.lanes[index];
        let stale = lane.health != ConnectionState::Connected;
        let side = lane.side;

        let Some(synchronizer) = self.synchronizers.get_mut(&closed.bar.timeframe) else {
            warn!(timeframe = %closed.bar.timeframe, "closed bar for untracked timeframe");
            return None;
        };

        let sample = synchronizer.on_bar_closed(side, closed, stale, now)?;
        self.stats.samples += 1;
        self.correlation.on_paired_sample(&sample);
        Some(sample)
    }
}

/// Run the [`Pipeline`] until a [`PipelineEvent::Shutdown`] arrives or every producer is gone.
///
/// Publishes the latest [`SnapshotSet`] to the [`BroadcastHub`] after every event and every
/// grace sweep. On exit the open bars are flushed, a final state is published and the hub is
/// closed. Returns the pipeline for inspection.
pub async fn run_pipeline(
    mut pipeline: Pipeline,
    mut events: mpsc::Receiver<PipelineEvent>,
    hub: BroadcastHub,
) -> Pipeline {
    let mut expiry = tokio::time::interval(pipeline.config.expiry_interval);
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        symbol_a = %pipeline.config.pair.symbol_a,
        symbol_b = %pipeline.config.pair.symbol_b,
        timeframes = ?pipeline.config.timeframes,
        "aggregation pipeline started"
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PipelineEvent::Tick(tick)) => {
                    // Rejections are counted and logged inside the pipeline
                    let _ = pipeline.on_tick(&tick, Utc::now());
                }
                Some(PipelineEvent::Health(health)) => {
                    pipeline.on_health(health, Utc::now());
                }
                Some(PipelineEvent::Shutdown) | None => break,
            },
            _ = expiry.tick() => {
                pipeline.expire(Utc::now());
            }
        }

        hub.publish(pipeline.snapshot_set(Utc::now()));
    }

    let flushed = pipeline.flush(Utc::now());
    hub.publish(pipeline.snapshot_set(Utc::now()));
    hub.close();

    info!(
        flushed_samples = flushed.len(),
        stats = ?pipeline.stats,
        "aggregation pipeline stopped"
    );
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;

    const T0_MS: i64 = 1_699_999_200_000; // hour aligned

    fn time(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn es(price: f64, ms: i64) -> Tick {
        Tick::new("futures", "ES", price, Some(1.0), time(ms))
    }

    fn btc(price: f64, ms: i64) -> Tick {
        Tick::new("crypto", "BTC", price, Some(0.01), time(ms))
    }

    fn connected(source: &str) -> SourceHealth {
        SourceHealth {
            source_id: SourceId::new(source),
            state: ConnectionState::Connected,
            consecutive_failures: 0,
            last_success_time: Some(time(T0_MS)),
        }
    }

    fn reconnecting(source: &str) -> SourceHealth {
        SourceHealth {
            state: ConnectionState::Reconnecting,
            ..connected(source)
        }
    }

    fn pipeline() -> Pipeline {
        let mut pipeline = Pipeline::new(EngineConfig::default()).unwrap();
        pipeline.on_health(connected("futures"), time(T0_MS));
        pipeline.on_health(connected("crypto"), time(T0_MS));
        pipeline
    }

    #[test]
    fn test_pipeline_rejects_invalid_config() {
        let config = EngineConfig::default().with_window(Timeframe::M5, 1);
        assert_eq!(
            Pipeline::new(config).err(),
            Some(ConfigError::WindowTooSmall(Timeframe::M5))
        );
    }

    #[test]
    fn test_pipeline_counts_rejections() {
        let mut pipeline = pipeline();
        let now = time(T0_MS);

        assert!(pipeline.on_tick(&es(5000.0, T0_MS + 60_000), now).is_ok());
        assert_eq!(
            pipeline.on_tick(&es(0.0, T0_MS + 61_000), now),
            Err(TickAnomaly::NonPositivePrice(0.0))
        );
        assert_eq!(
            pipeline.on_tick(&es(5000.0, T0_MS), now),
            Err(TickAnomaly::OutOfOrder)
        );
        assert_eq!(
            pipeline.on_tick(&Tick::new("crypto", "ETH", 3000.0, None, time(T0_MS)), now),
            Err(TickAnomaly::UnknownSymbol(Symbol::new("ETH")))
        );

        let stats = pipeline.stats();
        assert_eq!(stats.ticks_accepted, 1);
        assert_eq!(stats.rejections.invalid_price, 1);
        assert_eq!(stats.rejections.out_of_order, 1);
        assert_eq!(stats.rejections.unknown_symbol, 1);
    }

    #[test]
    fn test_pipeline_pairs_base_and_coarse_timeframes() {
        let mut pipeline = pipeline();
        let now = time(T0_MS);
        let mut samples = Vec::new();

        // Twelve minutes of one tick per minute on both sides
        for minute in 0..=11 {
            let ms = T0_MS + minute * 60_000 + 1_000;
            let factor = 1.0 + 0.001 * ((minute % 3) as f64 - 1.0);
            samples.extend(pipeline.on_tick(&es(5000.0 * factor, ms), now).unwrap());
            samples.extend(pipeline.on_tick(&btc(90_000.0 * factor, ms), now).unwrap());
        }

        let m1 = samples.iter().filter(|s| s.timeframe == Timeframe::M1).count();
        let m5 = samples.iter().filter(|s| s.timeframe == Timeframe::M5).count();

        // Minutes 1..=10 have a previous close, minute 11 is still open
        assert_eq!(m1, 10);
        // The 5m bucket [5, 10) is the only sealed coarse bucket with a previous coarse close
        assert_eq!(m5, 1);

        let snapshot = pipeline.correlation(Timeframe::M1).unwrap();
        assert_eq!(snapshot.sample_count, 10);
        assert!((snapshot.coefficient.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.lead_lag, None);

        // Lead/lag is refreshed on the expiry sweep
        pipeline.expire(now);
        assert_eq!(pipeline.correlation(Timeframe::M1).unwrap().lead_lag.unwrap().lag, 0);

        let es_m1 = pipeline.stream(&Symbol::new("ES"), Timeframe::M1).unwrap();
        assert_eq!(es_m1.len(), 11);
        assert!(es_m1.open_bar().is_some());
    }

    #[test]
    fn test_disconnect_flushes_stale_base_bar() {
        let mut pipeline = pipeline();
        let now = time(T0_MS);

        pipeline.on_tick(&es(5000.0, T0_MS + 1_000), now).unwrap();
        pipeline.on_tick(&btc(90_000.0, T0_MS + 1_000), now).unwrap();

        let samples = pipeline.on_health(reconnecting("crypto"), now);
        assert!(samples.is_empty());

        let btc_m1 = pipeline.stream(&Symbol::new("BTC"), Timeframe::M1).unwrap();
        assert!(btc_m1.open_bar().is_none());
        assert!(btc_m1.last_closed().unwrap().partial);
        assert_eq!(btc_m1.health(), ConnectionState::Reconnecting);

        // ES lane is unaffected
        let es_m1 = pipeline.stream(&Symbol::new("ES"), Timeframe::M1).unwrap();
        assert!(es_m1.open_bar().is_some());

        let snapshot = pipeline.snapshot_set(now);
        assert!(snapshot.stale);
    }

    #[test]
    fn test_disconnect_after_bucket_end_keeps_completed_bar() {
        let mut pipeline = pipeline();

        // Both sides tick through the seed minute and T, each with its own wall clock
        for minute in 0..2 {
            let ms = T0_MS + minute * 60_000 + 1_000;
            pipeline.on_tick(&es(5000.0 + minute as f64, ms), time(ms)).unwrap();
            pipeline.on_tick(&btc(90_000.0 + minute as f64, ms), time(ms)).unwrap();
        }

        // BTC drops early in T+1 before any T+1 tick
        let samples = pipeline.on_health(reconnecting("crypto"), time(T0_MS + 120_500));
        assert!(samples.is_empty());

        let btc_m1 = pipeline.stream(&Symbol::new("BTC"), Timeframe::M1).unwrap();
        let flushed = btc_m1.last_closed().unwrap();
        assert_eq!(flushed.bucket_start, time(T0_MS + 60_000));
        assert!(!flushed.partial);

        // ES seals T, which pairs with the completed BTC bar
        let ms = T0_MS + 121_000;
        let samples = pipeline.on_tick(&es(5002.0, ms), time(ms)).unwrap();
        let paired = samples
            .iter()
            .filter(|sample| sample.timeframe == Timeframe::M1)
            .map(|sample| sample.bucket_start)
            .collect::<Vec<_>>();
        assert_eq!(paired, vec![time(T0_MS + 60_000)]);

        let stats = pipeline.sync_stats(Timeframe::M1).unwrap();
        assert_eq!(stats.paired, 1);
        assert_eq!(stats.unpaired_stale, 0);
    }

    #[test]
    fn test_out_of_order_ticks_leave_jump_guard_untouched() {
        let mut pipeline = pipeline();
        let now = time(T0_MS);

        // Warm up the guard with 0.01% alternating moves inside minute 1
        let mut price = 5000.0;
        for i in 0..30 {
            price *= if i % 2 == 0 { 1.0001 } else { 0.9999 };
            pipeline.on_tick(&es(price, T0_MS + 60_000 + i * 100), now).unwrap();
        }

        // Backfilled ticks for minute 0 are rejected before the guard sees them
        for _ in 0..2 {
            assert_eq!(
                pipeline.on_tick(&es(price * 1.049, T0_MS + 1_000), now),
                Err(TickAnomaly::OutOfOrder)
            );
        }

        // A genuine 9% spike is still measured against the warm-up level
        let spike = pipeline.on_tick(&es(price * 1.09, T0_MS + 70_000), now);
        assert!(matches!(spike, Err(TickAnomaly::ExtremeJump { .. })));

        let stats = pipeline.stats();
        assert_eq!(stats.rejections.out_of_order, 2);
        assert_eq!(stats.rejections.extreme_jump, 1);
    }

    #[test]
    fn test_flush_seals_base_and_coarse_bars() {
        let mut pipeline = pipeline();
        let now = time(T0_MS);
        for minute in 0..3 {
            pipeline
                .on_tick(&es(5000.0 + minute as f64, T0_MS + minute * 60_000), now)
                .unwrap();
        }

        pipeline.flush(now);

        for timeframe in [Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1] {
            let stream = pipeline.stream(&Symbol::new("ES"), timeframe).unwrap();
            assert!(stream.open_bar().is_none(), "{timeframe}");
            assert!(stream.last_closed().is_some_and(|bar| bar.closed), "{timeframe}");
        }
    }

    #[test]
    fn test_snapshot_set_prefers_open_bars() {
        let mut pipeline = pipeline();
        let now = time(T0_MS);
        pipeline.on_tick(&es(5000.0, T0_MS + 1_000), now).unwrap();

        let snapshot = pipeline.snapshot_set(now);
        // Coarse bars only appear once a base bar seals
        assert_eq!(snapshot.bars.len(), 1);
        assert!(!snapshot.bars[0].closed);
        assert_eq!(snapshot.correlations.len(), 4);
        assert_eq!(snapshot.health.len(), 2);
        assert!(!snapshot.stale);
    }

    #[tokio::test]
    async fn test_run_pipeline_publishes_and_closes_hub() {
        let hub = BroadcastHub::new(ThrottleConfig {
            price: std::time::Duration::ZERO,
            correlation: std::time::Duration::ZERO,
            health: std::time::Duration::ZERO,
        });
        let mut subscription = hub.subscribe();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_pipeline(
            Pipeline::new(EngineConfig::default()).unwrap(),
            rx,
            hub.clone(),
        ));

        tx.send(PipelineEvent::Health(connected("futures"))).await.unwrap();
        tx.send(PipelineEvent::Tick(es(5000.0, T0_MS + 1_000))).await.unwrap();
        tx.send(PipelineEvent::Shutdown).await.unwrap();

        let pipeline = handle.await.unwrap();
        assert_eq!(pipeline.stats().ticks_accepted, 1);

        let mut saw_price = false;
        while let Some(update) = subscription.recv().await {
            if let crate::broadcast::ViewerUpdate::Price { bars, .. } = update {
                saw_price = !bars.is_empty();
            }
        }
        assert!(saw_price);
        assert!(hub.latest().is_some());
    }
}
