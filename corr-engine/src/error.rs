use crate::{tick::Symbol, timeframe::Timeframe};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration-time invariant violations. The only errors allowed to halt startup.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum ConfigError {
    #[error("bucket width must be positive, got {0}ms")]
    NonPositiveWidth(i64),

    #[error("invalid timeframe literal: {0}")]
    InvalidTimeframe(String),

    #[error("timeframe {timeframe} exceeds the maximum width {max}")]
    WidthTooLarge { timeframe: Timeframe, max: Timeframe },

    #[error("timeframe {timeframe} is not a whole multiple of base timeframe {base}")]
    NotMultipleOfBase { timeframe: Timeframe, base: Timeframe },

    #[error("timeframe {0} configured more than once")]
    DuplicateTimeframe(Timeframe),

    #[error("timeframe set must contain the base timeframe {0}")]
    MissingBaseTimeframe(Timeframe),

    #[error("correlation window for {0} must hold at least 2 samples")]
    WindowTooSmall(Timeframe),

    #[error("bar history capacity {history} is smaller than the largest window {window}")]
    HistoryTooSmall { history: usize, window: usize },

    #[error("pair must reference two distinct symbols, got {0} twice")]
    IdenticalSymbols(Symbol),

    #[error("circuit breaker threshold must be at least 1")]
    ZeroCircuitThreshold,

    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),

    #[error("invalid anomaly guard: {0}")]
    InvalidAnomalyGuard(String),

    #[error("{0} must be non-zero")]
    Zero(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Errors produced by an upstream [`TickSource`](crate::source::TickSource).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum SourceError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("failed to decode provider payload: {0}")]
    Decode(String),

    #[error("heartbeat timeout: no data received for {0}ms")]
    HeartbeatTimeout(u64),

    #[error("upstream closed the connection")]
    Closed,
}

impl SourceError {
    /// Determine if an error requires the current connection to be dropped and re-established.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            SourceError::Connect(_) | SourceError::HeartbeatTimeout(_) | SourceError::Closed => {
                true
            }
            SourceError::Socket(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("terminated")
                    || error_lower.contains("connectionclosed")
                    || error_lower.contains("alreadyclosed")
                    || error_lower.contains("sendafterclosing")
                    || error_lower.contains("io(")
                    || error_lower.contains("timeout")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_is_terminal() {
        struct TestCase {
            input: SourceError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: connect failures always require a fresh attempt
                input: SourceError::Connect("refused".to_string()),
                expected: true,
            },
            TestCase {
                // TC1: a single undecodable payload is not terminal
                input: SourceError::Decode("missing field `p`".to_string()),
                expected: false,
            },
            TestCase {
                // TC2: socket error without termination keywords
                input: SourceError::Socket("unexpected frame".to_string()),
                expected: false,
            },
            TestCase {
                // TC3: socket error containing "ConnectionClosed"
                input: SourceError::Socket("WebSocket error: ConnectionClosed".to_string()),
                expected: true,
            },
            TestCase {
                // TC4: socket error containing "Io("
                input: SourceError::Socket("WebSocket error: Io(Kind(UnexpectedEof))".to_string()),
                expected: true,
            },
            TestCase {
                // TC5: heartbeat timeout
                input: SourceError::HeartbeatTimeout(30_000),
                expected: true,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_terminal();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }
}
