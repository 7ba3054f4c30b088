use crate::{
    error::ConfigError,
    tick::{SourceId, Symbol},
    timeframe::Timeframe,
};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

/// Top level configuration of the aggregation, synchronisation and correlation engine.
///
/// Every field has a default, so a partial JSON document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The two symbols being correlated and the sources that feed them.
    pub pair: PairConfig,

    /// Finest timeframe, built directly from ticks.
    pub base_timeframe: Timeframe,

    /// Every timeframe correlated, including the base.
    pub timeframes: Vec<Timeframe>,

    /// Correlation window size (in paired samples) per timeframe.
    pub windows: BTreeMap<Timeframe, usize>,

    /// Window size used for any timeframe missing from `windows`.
    pub default_window: usize,

    /// Closed bar ring-buffer capacity per (symbol, timeframe). Defaults to the largest window + 1.
    pub history: Option<usize>,

    pub sync: SyncConfig,
    pub supervisor: SupervisorConfig,
    pub throttle: ThrottleConfig,
    pub anomaly: AnomalyConfig,

    /// Capacity of the aggregation pipeline inbound queue.
    pub queue_capacity: usize,

    /// How often pending buckets are checked against their grace deadline.
    #[serde(with = "duration_ms")]
    pub expiry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pair: PairConfig::default(),
            base_timeframe: Timeframe::M1,
            timeframes: vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H1],
            windows: BTreeMap::from([
                (Timeframe::M1, 120),
                (Timeframe::M5, 96),
                (Timeframe::M15, 64),
                (Timeframe::H1, 48),
            ]),
            default_window: 120,
            history: None,
            sync: SyncConfig::default(),
            supervisor: SupervisorConfig::default(),
            throttle: ThrottleConfig::default(),
            anomaly: AnomalyConfig::default(),
            queue_capacity: 4096,
            expiry_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration document. Does not validate.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|error| ConfigError::Parse(error.to_string()))
    }

    pub fn with_pair(mut self, pair: PairConfig) -> Self {
        self.pair = pair;
        self
    }

    pub fn with_timeframes(mut self, timeframes: Vec<Timeframe>) -> Self {
        self.timeframes = timeframes;
        self
    }

    pub fn with_window(mut self, timeframe: Timeframe, size: usize) -> Self {
        self.windows.insert(timeframe, size);
        self
    }

    pub fn with_history(mut self, capacity: usize) -> Self {
        self.history = Some(capacity);
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_anomaly(mut self, anomaly: AnomalyConfig) -> Self {
        self.anomaly = anomaly;
        self
    }

    /// Correlation window size for the provided [`Timeframe`].
    pub fn window_size(&self, timeframe: Timeframe) -> usize {
        self.windows
            .get(&timeframe)
            .copied()
            .unwrap_or(self.default_window)
    }

    /// Closed bar ring-buffer capacity shared by every symbol stream.
    pub fn history_capacity(&self) -> usize {
        self.history.unwrap_or_else(|| self.largest_window() + 1)
    }

    /// Wall-clock grace allowed for a counterpart bar before a bucket is marked unpaired.
    pub fn grace(&self, timeframe: Timeframe) -> TimeDelta {
        self.sync
            .grace
            .and_then(|grace| TimeDelta::from_std(grace).ok())
            .unwrap_or_else(|| timeframe.width())
    }

    /// Configured timeframes coarser than the base, ascending.
    pub fn coarse_timeframes(&self) -> Vec<Timeframe> {
        let mut coarse = self
            .timeframes
            .iter()
            .copied()
            .filter(|timeframe| *timeframe != self.base_timeframe)
            .collect::<Vec<_>>();
        coarse.sort();
        coarse
    }

    fn largest_window(&self) -> usize {
        self.timeframes
            .iter()
            .map(|timeframe| self.window_size(*timeframe))
            .max()
            .unwrap_or(self.default_window)
    }

    /// Check every configuration-time invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pair.symbol_a == self.pair.symbol_b {
            return Err(ConfigError::IdenticalSymbols(self.pair.symbol_a.clone()));
        }

        let mut seen = HashSet::with_capacity(self.timeframes.len());
        for timeframe in &self.timeframes {
            if !seen.insert(*timeframe) {
                return Err(ConfigError::DuplicateTimeframe(*timeframe));
            }
            if *timeframe > Timeframe::MAX {
                return Err(ConfigError::WidthTooLarge {
                    timeframe: *timeframe,
                    max: Timeframe::MAX,
                });
            }
            if !timeframe.is_multiple_of(self.base_timeframe) {
                return Err(ConfigError::NotMultipleOfBase {
                    timeframe: *timeframe,
                    base: self.base_timeframe,
                });
            }
            if self.window_size(*timeframe) < 2 {
                return Err(ConfigError::WindowTooSmall(*timeframe));
            }
        }
        if !seen.contains(&self.base_timeframe) {
            return Err(ConfigError::MissingBaseTimeframe(self.base_timeframe));
        }

        let largest = self.largest_window();
        if self.history_capacity() < largest {
            return Err(ConfigError::HistoryTooSmall {
                history: self.history_capacity(),
                window: largest,
            });
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity".to_string()));
        }
        if self.expiry_interval.is_zero() {
            return Err(ConfigError::Zero("expiry_interval".to_string()));
        }
        if self.sync.resolved_retention == 0 {
            return Err(ConfigError::Zero("sync.resolved_retention".to_string()));
        }

        self.supervisor.validate()?;
        self.anomaly.validate()
    }
}

/// The two correlated symbols, each bound to the source that feeds it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PairConfig {
    pub symbol_a: Symbol,
    pub source_a: SourceId,
    pub symbol_b: Symbol,
    pub source_b: SourceId,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            symbol_a: Symbol::new("ES"),
            source_a: SourceId::new("futures"),
            symbol_b: Symbol::new("BTC"),
            source_b: SourceId::new("crypto"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Grace period for pairing. `None` means one bucket width of the timeframe.
    #[serde(with = "option_duration_ms")]
    pub grace: Option<Duration>,

    /// Whether gap-affected (partial) bars still produce samples.
    pub include_partial_bars: bool,

    /// Number of resolved buckets remembered per timeframe to discard late counterparts.
    pub resolved_retention: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            grace: None,
            include_partial_bars: true,
            resolved_retention: 256,
        }
    }
}

/// Reconnect, backoff and circuit breaker parameters shared by every source.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Consecutive failed attempts before the circuit opens (K).
    pub circuit_threshold: u32,

    #[serde(with = "duration_ms")]
    pub backoff_initial: Duration,

    #[serde(with = "duration_ms")]
    pub backoff_max: Duration,

    pub backoff_multiplier: f64,

    /// Fractional jitter applied to each backoff delay, in `[0, 1]`.
    pub jitter: f64,

    #[serde(with = "duration_ms")]
    pub cool_down: Duration,

    /// Idle period after which a connection is considered dead.
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            circuit_threshold: 5,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            cool_down: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_threshold == 0 {
            return Err(ConfigError::ZeroCircuitThreshold);
        }
        if self.backoff_initial.is_zero() {
            return Err(ConfigError::InvalidBackoff(
                "initial delay must be non-zero".to_string(),
            ));
        }
        if self.backoff_max < self.backoff_initial {
            return Err(ConfigError::InvalidBackoff(format!(
                "max delay {:?} is below initial delay {:?}",
                self.backoff_max, self.backoff_initial
            )));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidBackoff(format!(
                "multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidBackoff(format!(
                "jitter must be within [0, 1], got {}",
                self.jitter
            )));
        }
        if self.cool_down.is_zero() {
            return Err(ConfigError::Zero("supervisor.cool_down".to_string()));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Zero("supervisor.heartbeat_timeout".to_string()));
        }
        Ok(())
    }
}

/// Minimum interval between two deliveries of the same data class to one subscriber.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Tick-derived latest bars, the noisiest class.
    #[serde(with = "duration_ms")]
    pub price: Duration,

    #[serde(with = "duration_ms")]
    pub correlation: Duration,

    #[serde(with = "duration_ms")]
    pub health: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            price: Duration::from_millis(250),
            correlation: Duration::from_millis(50),
            health: Duration::ZERO,
        }
    }
}

/// Extreme single-tick jump guard parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Reject ticks moving more than this many standard deviations of recent tick returns.
    /// `None` disables the jump guard.
    pub max_jump_sigma: Option<f64>,

    /// Moves below this fraction of price are never treated as jumps.
    pub min_jump_fraction: f64,

    pub volatility_window: usize,
    pub min_volatility_samples: usize,

    /// After this many consecutive jump rejections the guard re-anchors on the new level.
    pub max_consecutive_jumps: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            max_jump_sigma: Some(10.0),
            min_jump_fraction: 0.05,
            volatility_window: 50,
            min_volatility_samples: 20,
            max_consecutive_jumps: 3,
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(sigma) = self.max_jump_sigma {
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(ConfigError::InvalidAnomalyGuard(format!(
                    "max_jump_sigma must be positive, got {sigma}"
                )));
            }
        }
        if !(self.min_jump_fraction.is_finite() && self.min_jump_fraction >= 0.0) {
            return Err(ConfigError::InvalidAnomalyGuard(format!(
                "min_jump_fraction must be non-negative, got {}",
                self.min_jump_fraction
            )));
        }
        if self.min_volatility_samples < 2 || self.volatility_window < self.min_volatility_samples
        {
            return Err(ConfigError::InvalidAnomalyGuard(format!(
                "volatility window {} must hold at least min_volatility_samples {} (>= 2)",
                self.volatility_window, self.min_volatility_samples
            )));
        }
        Ok(())
    }
}

/// Serialise [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialise `Option<Duration>` as optional integer milliseconds.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => super::duration_ms::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
