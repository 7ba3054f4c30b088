use super::{SourceId, Symbol, Tick};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Binance spot real-time trade message.
///
/// ### Raw Payload Examples
/// See docs: <https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#trade-streams>
///```json
/// {
///     "e": "trade",
///     "E": 1672515782136,
///     "s": "BTCUSDT",
///     "t": 12345,
///     "p": "16578.50",
///     "q": "0.001",
///     "T": 1672515782136,
///     "m": true,
///     "M": true
/// }
/// ```
#[derive(Clone, PartialEq, PartialOrd, Debug, Deserialize, Serialize)]
pub struct BinanceTrade {
    #[serde(rename = "s")]
    pub market: String,

    #[serde(rename = "t")]
    pub id: u64,

    #[serde(rename = "p", deserialize_with = "super::de::de_str")]
    pub price: f64,

    #[serde(rename = "q", deserialize_with = "super::de::de_str")]
    pub amount: f64,

    #[serde(
        rename = "T",
        deserialize_with = "super::de::de_u64_epoch_ms_as_datetime_utc"
    )]
    pub time: DateTime<Utc>,
}

impl BinanceTrade {
    /// Normalise into a [`Tick`] for the engine-side `symbol` (eg/ "BTC" for "BTCUSDT").
    pub fn into_tick(self, source_id: SourceId, symbol: Symbol) -> Tick {
        Tick {
            source_id,
            symbol,
            price: self.price,
            size: Some(self.amount),
            event_time: self.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_trade() {
        struct TestCase {
            input: &'static str,
            expected: Option<BinanceTrade>,
        }

        let tests = vec![
            TestCase {
                // TC0: valid trade is deserialised
                input: r#"
                    {
                        "e": "trade", "E": 1672515782136, "s": "BTCUSDT", "t": 12345,
                        "p": "16578.50", "q": "0.001", "T": 1672515782136, "m": true, "M": true
                    }
                "#,
                expected: Some(BinanceTrade {
                    market: "BTCUSDT".to_string(),
                    id: 12345,
                    price: 16578.50,
                    amount: 0.001,
                    time: DateTime::from_timestamp_millis(1672515782136).unwrap(),
                }),
            },
            TestCase {
                // TC1: numeric price instead of string is rejected
                input: r#"
                    {
                        "e": "trade", "E": 1672515782136, "s": "BTCUSDT", "t": 12345,
                        "p": 16578.50, "q": "0.001", "T": 1672515782136, "m": true, "M": true
                    }
                "#,
                expected: None,
            },
            TestCase {
                // TC2: subscription response is not a trade
                input: r#"{"result": null, "id": 1}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<BinanceTrade>(test.input).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_binance_trade_into_tick() {
        let trade = BinanceTrade {
            market: "BTCUSDT".to_string(),
            id: 1,
            price: 42_000.0,
            amount: 0.5,
            time: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        };

        let tick = trade.into_tick(SourceId::new("crypto"), Symbol::new("BTC"));
        assert_eq!(tick.symbol, Symbol::new("BTC"));
        assert_eq!(tick.source_id, SourceId::new("crypto"));
        assert_eq!(tick.price, 42_000.0);
        assert_eq!(tick.size, Some(0.5));
    }
}
