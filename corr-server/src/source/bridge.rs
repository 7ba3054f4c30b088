use super::TickDecoder;
use corr_engine::{
    SourceId, Symbol, Tick,
    error::SourceError,
    tick::bridge::BridgeMessage,
};
use tracing::{debug, warn};

/// Decodes futures bridge frames, keeping ticks of one tracked symbol.
#[derive(Debug, Clone)]
pub struct BridgeDecoder {
    source_id: SourceId,
    symbol: Symbol,
}

impl BridgeDecoder {
    pub fn new(source_id: SourceId, symbol: Symbol) -> Self {
        Self { source_id, symbol }
    }
}

impl TickDecoder for BridgeDecoder {
    fn decode(&self, text: &str) -> Vec<Result<Tick, SourceError>> {
        let message = match serde_json::from_str::<BridgeMessage>(text) {
            Ok(message) => message,
            Err(error) => return vec![Err(SourceError::Decode(error.to_string()))],
        };

        match &message {
            BridgeMessage::Welcome { message } => {
                debug!(source = %self.source_id, ?message, "bridge welcome");
            }
            BridgeMessage::Status {
                connected: Some(false),
            } => {
                warn!(source = %self.source_id, "bridge reports its upstream is disconnected");
            }
            _ => {}
        }

        message
            .into_ticks(&self.source_id, &self.symbol)
            .into_iter()
            .map(Ok)
            .collect()
    }
}
