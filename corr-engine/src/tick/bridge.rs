use super::{SourceId, Symbol, Tick};
use chrono::DateTime;
use serde::Deserialize;
use tracing::debug;

/// Messages from the futures market-data bridge.
///
/// ### Raw Payload Examples
///```json
/// {"type": "tick", "symbol": "ES", "ts": 1700000000000, "px": 4550.25, "sz": 2}
/// {"type": "tick_backfill", "symbol": "ES", "ticks": [{"ts": 1700000000000, "px": 4550.25}]}
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "tick")]
    Tick {
        symbol: String,
        ts: i64,
        px: f64,
        #[serde(default)]
        sz: Option<f64>,
    },
    #[serde(rename = "tick_backfill")]
    TickBackfill {
        symbol: String,
        ticks: Vec<BridgeTick>,
    },
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        connected: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeTick {
    pub ts: i64,
    pub px: f64,
    #[serde(default)]
    pub sz: Option<f64>,
}

impl BridgeMessage {
    /// Normalise into [`Tick`]s, keeping only those for the tracked `symbol`.
    ///
    /// Control messages and ticks with unrepresentable timestamps yield nothing.
    pub fn into_ticks(self, source_id: &SourceId, symbol: &Symbol) -> Vec<Tick> {
        let make_tick = |ts: i64, px: f64, sz: Option<f64>| {
            let Some(event_time) = DateTime::from_timestamp_millis(ts) else {
                debug!(%source_id, ts, "dropping bridge tick with out of range timestamp");
                return None;
            };
            Some(Tick {
                source_id: source_id.clone(),
                symbol: symbol.clone(),
                price: px,
                size: sz,
                event_time,
            })
        };

        match self {
            BridgeMessage::Tick {
                symbol: market,
                ts,
                px,
                sz,
            } if market == symbol.as_str() => make_tick(ts, px, sz).into_iter().collect(),
            BridgeMessage::TickBackfill {
                symbol: market,
                ticks,
            } if market == symbol.as_str() => {
                debug!(%source_id, count = ticks.len(), "received tick backfill");
                ticks
                    .into_iter()
                    .filter_map(|tick| make_tick(tick.ts, tick.px, tick.sz))
                    .collect()
            }
            BridgeMessage::Welcome { .. } => {
                debug!(%source_id, "received welcome from bridge");
                vec![]
            }
            BridgeMessage::Status { connected } => {
                debug!(%source_id, ?connected, "received status from bridge");
                vec![]
            }
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AnomalyConfig,
        tick::normalizer::{TickAnomaly, TickNormalizer},
    };

    #[test]
    fn test_bridge_message_into_ticks() {
        struct TestCase {
            input: &'static str,
            expected_prices: Vec<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: live tick for the tracked symbol
                input: r#"{"type": "tick", "symbol": "ES", "ts": 1700000000000, "px": 4550.25, "sz": 2}"#,
                expected_prices: vec![4550.25],
            },
            TestCase {
                // TC1: live tick for another symbol is ignored
                input: r#"{"type": "tick", "symbol": "NQ", "ts": 1700000000000, "px": 16000.0}"#,
                expected_prices: vec![],
            },
            TestCase {
                // TC2: backfill expands into one tick per entry, in order
                input: r#"{"type": "tick_backfill", "symbol": "ES", "ticks": [
                    {"ts": 1700000000000, "px": 4550.25},
                    {"ts": 1700000001000, "px": 4550.50, "sz": 1}
                ]}"#,
                expected_prices: vec![4550.25, 4550.50],
            },
            TestCase {
                // TC3: control messages carry no ticks
                input: r#"{"type": "welcome", "message": "hello"}"#,
                expected_prices: vec![],
            },
        ];

        let source = SourceId::new("futures");
        let symbol = Symbol::new("ES");

        for (index, test) in tests.into_iter().enumerate() {
            let message = serde_json::from_str::<BridgeMessage>(test.input).unwrap();
            let actual = message
                .into_ticks(&source, &symbol)
                .into_iter()
                .map(|tick| tick.price)
                .collect::<Vec<_>>();
            assert_eq!(actual, test.expected_prices, "TC{} failed", index);
        }
    }

    #[test]
    fn test_bridge_size_reaches_the_normalizer_unchanged() {
        struct TestCase {
            input: &'static str,
            expected_size: Option<f64>,
            expected_check: Result<(), TickAnomaly>,
        }

        let tests = vec![
            TestCase {
                // TC0: zero size is a valid print
                input: r#"{"type": "tick", "symbol": "ES", "ts": 1700000000000, "px": 4550.25, "sz": 0}"#,
                expected_size: Some(0.0),
                expected_check: Ok(()),
            },
            TestCase {
                // TC1: negative size is kept and rejected downstream
                input: r#"{"type": "tick", "symbol": "ES", "ts": 1700000000000, "px": 4550.25, "sz": -3}"#,
                expected_size: Some(-3.0),
                expected_check: Err(TickAnomaly::InvalidSize(-3.0)),
            },
            TestCase {
                // TC2: missing size
                input: r#"{"type": "tick", "symbol": "ES", "ts": 1700000000000, "px": 4550.25}"#,
                expected_size: None,
                expected_check: Ok(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let message = serde_json::from_str::<BridgeMessage>(test.input).unwrap();
            let ticks = message.into_ticks(&SourceId::new("futures"), &Symbol::new("ES"));
            assert_eq!(ticks.len(), 1, "TC{} failed", index);
            assert_eq!(ticks[0].size, test.expected_size, "TC{} failed", index);

            let mut normalizer = TickNormalizer::new(AnomalyConfig::default());
            assert_eq!(normalizer.check(&ticks[0]), test.expected_check, "TC{} failed", index);
        }
    }
}
