use crate::error::ConfigError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;

/// Fixed bucket width used to group ticks and bars.
///
/// Serialised as a compact literal such as `"30s"`, `"5m"` or `"1h"`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timeframe {
    width_ms: i64,
}

impl Timeframe {
    pub const M1: Self = Self { width_ms: MS_PER_MINUTE };
    pub const M5: Self = Self { width_ms: 5 * MS_PER_MINUTE };
    pub const M15: Self = Self { width_ms: 15 * MS_PER_MINUTE };
    pub const H1: Self = Self { width_ms: MS_PER_HOUR };

    /// Widest bucket accepted by configuration validation.
    pub const MAX: Self = Self { width_ms: 24 * MS_PER_HOUR };

    /// Construct a [`Timeframe`], rejecting zero or negative widths.
    pub fn from_millis(width_ms: i64) -> Result<Self, ConfigError> {
        if width_ms <= 0 {
            return Err(ConfigError::NonPositiveWidth(width_ms));
        }
        Ok(Self { width_ms })
    }

    pub fn width_ms(&self) -> i64 {
        self.width_ms
    }

    pub fn width(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.width_ms)
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.width_ms as u64)
    }

    /// Start of the bucket containing `time`, ie/ `floor(time, width)`.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let offset = time.timestamp_millis().rem_euclid(self.width_ms);
        time - TimeDelta::milliseconds(offset)
            - TimeDelta::nanoseconds(i64::from(time.timestamp_subsec_nanos() % 1_000_000))
    }

    pub fn bucket_end(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        self.bucket_start(time) + self.width()
    }

    /// Returns true if `self` is a whole multiple of `base`.
    pub fn is_multiple_of(&self, base: Timeframe) -> bool {
        self.width_ms % base.width_ms == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.width_ms;
        if ms % MS_PER_HOUR == 0 {
            write!(f, "{}h", ms / MS_PER_HOUR)
        } else if ms % MS_PER_MINUTE == 0 {
            write!(f, "{}m", ms / MS_PER_MINUTE)
        } else if ms % MS_PER_SECOND == 0 {
            write!(f, "{}s", ms / MS_PER_SECOND)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

impl FromStr for Timeframe {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let split = input
            .find(|c: char| !(c.is_ascii_digit() || c == '-'))
            .ok_or_else(|| ConfigError::InvalidTimeframe(input.to_string()))?;
        let (amount, unit) = input.split_at(split);

        let amount = amount
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidTimeframe(input.to_string()))?;

        let unit_ms = match unit {
            "ms" => 1,
            "s" => MS_PER_SECOND,
            "m" => MS_PER_MINUTE,
            "h" => MS_PER_HOUR,
            _ => return Err(ConfigError::InvalidTimeframe(input.to_string())),
        };

        Self::from_millis(amount.saturating_mul(unit_ms))
    }
}

impl Serialize for Timeframe {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let literal = String::deserialize(deserializer)?;
        literal.parse().map_err(serde::de::Error::custom)
    }
}
