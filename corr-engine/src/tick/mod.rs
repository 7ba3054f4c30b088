use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Binance spot trade payloads.
pub mod binance;

/// Futures bridge payloads.
pub mod bridge;

/// Deserialisation helpers shared by provider payloads.
pub mod de;

/// Data anomaly guard applied before a [`Tick`] reaches the bar builder.
pub mod normalizer;

/// Instrument symbol as tracked by the engine (eg/ "ES", "BTC").
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct Symbol(pub SmolStr);

impl Symbol {
    pub fn new<S: AsRef<str>>(symbol: S) -> Self {
        Self(SmolStr::new(symbol))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of an upstream tick source (eg/ "futures", "crypto").
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display, From,
)]
pub struct SourceId(pub SmolStr);

impl SourceId {
    pub fn new<S: AsRef<str>>(source: S) -> Self {
        Self(SmolStr::new(source))
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Uniform price tick produced by every upstream source.
///
/// Immutable and ephemeral: consumed by the bar builder, never retained.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    pub source_id: SourceId,
    pub symbol: Symbol,
    pub price: f64,
    pub size: Option<f64>,
    pub event_time: DateTime<Utc>,
}

impl Tick {
    pub fn new(
        source_id: impl Into<SourceId>,
        symbol: impl Into<Symbol>,
        price: f64,
        size: Option<f64>,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            symbol: symbol.into(),
            price,
            size,
            event_time,
        }
    }
}
