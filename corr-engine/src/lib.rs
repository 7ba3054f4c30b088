//! # Corr-Engine
//! Real-time multi-source bar aggregation, synchronisation and rolling cross-asset correlation.
//!
//! Two independent tick sources (eg/ a futures venue and a crypto exchange) feed one
//! single-writer [`Pipeline`](pipeline::Pipeline):
//! * [`TickNormalizer`](tick::normalizer::TickNormalizer) rejects data anomalies.
//! * [`BarBuilder`](bar::BarBuilder) buckets ticks into base timeframe OHLCV bars.
//! * [`TimeframeRoller`](bar::TimeframeRoller) folds base bars into coarser timeframes.
//! * [`Synchronizer`](sync::Synchronizer) pairs both symbols' closed bars into return samples.
//! * [`CorrelationEngine`](correlation::CorrelationEngine) maintains O(1) rolling Pearson
//!   correlation per timeframe.
//!
//! Each source is driven by [`run_source`](supervisor::run_source) under a
//! [`ConnectionSupervisor`](supervisor::ConnectionSupervisor), and the latest state is fanned
//! out to viewers by the coalescing [`BroadcastHub`](broadcast::BroadcastHub).

/// OHLCV bars, the base timeframe builder and the coarse timeframe roller.
pub mod bar;

/// Coalescing, throttled fan-out of [`SnapshotSet`](broadcast::SnapshotSet)s to viewers.
pub mod broadcast;

/// [`EngineConfig`](config::EngineConfig) and its sections.
pub mod config;

/// Rolling correlation windows and snapshots.
pub mod correlation;

/// All [`Error`](std::error::Error)s generated in Corr-Engine.
pub mod error;

/// Single-writer aggregation pipeline and its event loop.
pub mod pipeline;

/// Upstream tick source interface.
pub mod source;

/// Connection supervision of upstream tick sources.
pub mod supervisor;

/// Pairing of closed bars into return samples.
pub mod sync;

/// Uniform [`Tick`](tick::Tick) record, provider payloads and the anomaly guard.
pub mod tick;

/// Fixed-width bucket [`Timeframe`](timeframe::Timeframe).
pub mod timeframe;

pub use broadcast::{BroadcastHub, SnapshotSet, Subscription, ViewerUpdate};
pub use config::EngineConfig;
pub use pipeline::{Pipeline, PipelineEvent, run_pipeline};
pub use source::{TickSource, TickStream};
pub use supervisor::{ConnectionState, ConnectionSupervisor, SourceHealth, run_source};
pub use tick::{SourceId, Symbol, Tick};
pub use timeframe::Timeframe;

