use super::{Symbol, Tick};
use crate::config::AnomalyConfig;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// Reasons a [`Tick`] is rejected at ingestion. Counted, never propagated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum TickAnomaly {
    #[error("non-finite price {0}")]
    NonFinitePrice(f64),

    #[error("non-positive price {0}")]
    NonPositivePrice(f64),

    #[error("invalid size {0}")]
    InvalidSize(f64),

    #[error("price jump of {move_fraction:.6} exceeds threshold {threshold:.6}")]
    ExtremeJump { move_fraction: f64, threshold: f64 },

    #[error("tick for untracked symbol {0}")]
    UnknownSymbol(Symbol),

    #[error("tick is earlier than the current bucket")]
    OutOfOrder,
}

/// Running totals of rejected ticks per anomaly kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RejectionCounts {
    pub invalid_price: u64,
    pub invalid_size: u64,
    pub extreme_jump: u64,
    pub unknown_symbol: u64,
    pub out_of_order: u64,
}

impl RejectionCounts {
    pub fn record(&mut self, anomaly: &TickAnomaly) {
        match anomaly {
            TickAnomaly::NonFinitePrice(_) | TickAnomaly::NonPositivePrice(_) => {
                self.invalid_price += 1
            }
            TickAnomaly::InvalidSize(_) => self.invalid_size += 1,
            TickAnomaly::ExtremeJump { .. } => self.extreme_jump += 1,
            TickAnomaly::UnknownSymbol(_) => self.unknown_symbol += 1,
            TickAnomaly::OutOfOrder => self.out_of_order += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.invalid_price
            + self.invalid_size
            + self.extreme_jump
            + self.unknown_symbol
            + self.out_of_order
    }
}

/// Rolling window of tick-to-tick returns used to estimate recent volatility.
#[derive(Debug, Clone)]
struct ReturnWindow {
    max_size: usize,
    returns: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl ReturnWindow {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            returns: VecDeque::with_capacity(max_size),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    fn add(&mut self, value: f64) {
        if self.returns.len() >= self.max_size {
            if let Some(old) = self.returns.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.returns.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn len(&self) -> usize {
        self.returns.len()
    }

    /// Sample standard deviation of the window.
    fn std_dev(&self) -> Option<f64> {
        let n = self.returns.len();
        if n < 2 {
            return None;
        }
        let n = n as f64;
        let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        Some(variance.max(0.0).sqrt())
    }

    fn clear(&mut self) {
        self.returns.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

#[derive(Debug, Clone)]
struct JumpGuard {
    last_price: Option<f64>,
    window: ReturnWindow,
    consecutive_jumps: u32,
}

/// Validates [`Tick`]s before they reach the bar builder.
///
/// Out-of-order detection needs bar state, so the bar builder owns it; everything that can be
/// decided from the tick itself (plus recent volatility of its symbol) is decided here.
#[derive(Debug, Clone)]
pub struct TickNormalizer {
    config: AnomalyConfig,
    guards: FnvHashMap<Symbol, JumpGuard>,
}

impl TickNormalizer {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            guards: FnvHashMap::default(),
        }
    }

    /// Accept or reject a [`Tick`], updating the per-symbol volatility estimate on acceptance.
    pub fn check(&mut self, tick: &Tick) -> Result<(), TickAnomaly> {
        if !tick.price.is_finite() {
            return Err(TickAnomaly::NonFinitePrice(tick.price));
        }
        if tick.price <= 0.0 {
            return Err(TickAnomaly::NonPositivePrice(tick.price));
        }
        if let Some(size) = tick.size {
            if !size.is_finite() || size < 0.0 {
                return Err(TickAnomaly::InvalidSize(size));
            }
        }

        let config = &self.config;
        let guard = self
            .guards
            .entry(tick.symbol.clone())
            .or_insert_with(|| JumpGuard {
                last_price: None,
                window: ReturnWindow::new(config.volatility_window),
                consecutive_jumps: 0,
            });

        let Some(last_price) = guard.last_price else {
            guard.last_price = Some(tick.price);
            return Ok(());
        };

        let move_fraction = (tick.price - last_price) / last_price;

        if let (Some(max_sigma), true) = (
            config.max_jump_sigma,
            guard.window.len() >= config.min_volatility_samples,
        ) {
            let sigma = guard.window.std_dev().unwrap_or(0.0);
            let threshold = (max_sigma * sigma).max(config.min_jump_fraction);

            if move_fraction.abs() > threshold {
                guard.consecutive_jumps += 1;
                if guard.consecutive_jumps <= config.max_consecutive_jumps {
                    return Err(TickAnomaly::ExtremeJump {
                        move_fraction,
                        threshold,
                    });
                }

                debug!(
                    symbol = %tick.symbol,
                    price = tick.price,
                    last_price,
                    "persistent price jump, re-anchoring volatility guard"
                );
                guard.window.clear();
                guard.last_price = Some(tick.price);
                guard.consecutive_jumps = 0;
                return Ok(());
            }
        }

        guard.consecutive_jumps = 0;
        guard.window.add(move_fraction);
        guard.last_price = Some(tick.price);
        Ok(())
    }
}
