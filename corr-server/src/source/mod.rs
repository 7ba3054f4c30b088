use async_trait::async_trait;
use corr_engine::{SourceId, Tick, TickSource, TickStream, error::SourceError};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};
use url::Url;

/// Futures market-data bridge feed.
pub mod bridge;

/// Binance spot trade feed.
pub mod binance;

pub use binance::BinanceDecoder;
pub use bridge::BridgeDecoder;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Converts one upstream text frame into zero or more [`Tick`]s.
///
/// A payload that cannot be decoded is reported as a non-terminal [`SourceError::Decode`].
pub trait TickDecoder: Clone + Send + Sync + 'static {
    fn decode(&self, text: &str) -> Vec<Result<Tick, SourceError>>;
}

/// [`TickSource`] over a single upstream WebSocket connection.
#[derive(Debug)]
pub struct WebSocketSource<Decoder> {
    source_id: SourceId,
    url: Url,
    decoder: Decoder,
    sink: Option<SplitSink<WebSocket, Message>>,
}

impl<Decoder> WebSocketSource<Decoder> {
    pub fn new(source_id: SourceId, url: Url, decoder: Decoder) -> Self {
        Self {
            source_id,
            url,
            decoder,
            sink: None,
        }
    }
}

#[async_trait]
impl<Decoder> TickSource for WebSocketSource<Decoder>
where
    Decoder: TickDecoder,
{
    fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    async fn connect(&mut self) -> Result<TickStream, SourceError> {
        debug!(source = %self.source_id, url = %self.url, "connecting");

        let (websocket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|error| SourceError::Connect(error.to_string()))?;

        info!(source = %self.source_id, url = %self.url, "connected");

        let (sink, stream) = websocket.split();
        self.sink = Some(sink);

        let source_id = self.source_id.clone();
        let decoder = self.decoder.clone();
        Ok(stream
            .flat_map(move |message| {
                futures::stream::iter(decode_message(&source_id, &decoder, message))
            })
            .boxed())
    }

    async fn disconnect(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(error) = sink.close().await {
                debug!(source = %self.source_id, %error, "failed to close connection cleanly");
            }
        }
    }
}

fn decode_message<Decoder>(
    source_id: &SourceId,
    decoder: &Decoder,
    message: Result<Message, tungstenite::Error>,
) -> Vec<Result<Tick, SourceError>>
where
    Decoder: TickDecoder,
{
    match message {
        Ok(Message::Text(text)) => decoder.decode(text.as_str()),
        Ok(Message::Close(frame)) => {
            warn!(source = %source_id, ?frame, "upstream sent close frame");
            vec![Err(SourceError::Closed)]
        }
        Ok(Message::Binary(payload)) => {
            debug!(source = %source_id, len = payload.len(), "ignoring binary frame");
            Vec::new()
        }
        // Ping and Pong are answered by tungstenite
        Ok(_) => Vec::new(),
        Err(error) => vec![Err(SourceError::Socket(format!("{error:?}")))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[derive(Debug, Clone)]
    struct EchoDecoder;

    impl TickDecoder for EchoDecoder {
        fn decode(&self, text: &str) -> Vec<Result<Tick, SourceError>> {
            match text.parse::<f64>() {
                Ok(price) => vec![Ok(Tick::new(
                    "crypto",
                    "BTC",
                    price,
                    None,
                    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
                ))],
                Err(error) => vec![Err(SourceError::Decode(error.to_string()))],
            }
        }
    }

    #[test]
    fn test_decode_message() {
        struct TestCase {
            input: Result<Message, tungstenite::Error>,
            expected: Vec<Result<f64, bool>>,
        }

        let source_id = SourceId::new("crypto");

        let tests = vec![
            TestCase {
                // TC0: text frame is handed to the decoder
                input: Ok(Message::text("100.5")),
                expected: vec![Ok(100.5)],
            },
            TestCase {
                // TC1: undecodable text frame is a non-terminal error
                input: Ok(Message::text("not a price")),
                expected: vec![Err(false)],
            },
            TestCase {
                // TC2: ping is ignored
                input: Ok(Message::Ping(Vec::new().into())),
                expected: vec![],
            },
            TestCase {
                // TC3: close frame ends the connection
                input: Ok(Message::Close(None)),
                expected: vec![Err(true)],
            },
            TestCase {
                // TC4: socket error after the connection dropped is terminal
                input: Err(tungstenite::Error::ConnectionClosed),
                expected: vec![Err(true)],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = decode_message(&source_id, &EchoDecoder, test.input)
                .into_iter()
                .map(|result| match result {
                    Ok(tick) => Ok(tick.price),
                    Err(error) => Err(error.is_terminal()),
                })
                .collect::<Vec<_>>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
