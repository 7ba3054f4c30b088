use super::TickDecoder;
use corr_engine::{
    SourceId, Symbol, Tick,
    error::SourceError,
    tick::binance::BinanceTrade,
};

/// Decodes Binance spot `<symbol>@trade` frames into [`Tick`]s for one engine-side symbol.
#[derive(Debug, Clone)]
pub struct BinanceDecoder {
    source_id: SourceId,
    symbol: Symbol,
}

impl BinanceDecoder {
    pub fn new(source_id: SourceId, symbol: Symbol) -> Self {
        Self { source_id, symbol }
    }
}

impl TickDecoder for BinanceDecoder {
    fn decode(&self, text: &str) -> Vec<Result<Tick, SourceError>> {
        let tick = serde_json::from_str::<BinanceTrade>(text)
            .map(|trade| trade.into_tick(self.source_id.clone(), self.symbol.clone()))
            .map_err(|error| SourceError::Decode(error.to_string()));
        vec![tick]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_binance_decoder() {
        let decoder = BinanceDecoder::new(SourceId::new("crypto"), Symbol::new("BTC"));

        let trade = r#"{"e":"trade","E":1672515782136,"s":"BTCUSDT","t":12345,"p":"16578.50","q":"0.001","T":1672515782136,"m":true,"M":true}"#;
        let ticks = decoder.decode(trade);
        assert_eq!(
            ticks,
            vec![Ok(Tick::new(
                "crypto",
                "BTC",
                16578.50,
                Some(0.001),
                DateTime::from_timestamp_millis(1672515782136).unwrap(),
            ))]
        );

        // Subscription acknowledgement is not a trade
        let ack = decoder.decode(r#"{"result":null,"id":1}"#);
        assert!(matches!(ack.as_slice(), [Err(SourceError::Decode(_))]));
    }
}
