use corr_engine::{EngineConfig, error::ConfigError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;

/// Environment variable naming an optional JSON [`ServerConfig`] file.
pub const CONFIG_PATH_VAR: &str = "CORR_CONFIG";

const DEFAULT_BRIDGE_URL: &str = "ws://127.0.0.1:8765/ws";
const DEFAULT_BINANCE_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@trade";

/// Top level configuration of the correlation server.
///
/// ### Example
///```json
/// {
///     "addr": "0.0.0.0:9001",
///     "bridge_url": "ws://127.0.0.1:8765/ws",
///     "binance_url": "wss://stream.binance.com:9443/ws/btcusdt@trade",
///     "engine": { "timeframes": ["1m", "5m"], "windows": { "1m": 60, "5m": 48 } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Viewer WebSocket listen address.
    pub addr: SocketAddr,
    /// Futures bridge feed, source A.
    pub bridge_url: String,
    /// Binance spot trade feed, source B.
    pub binance_url: String,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            bridge_url: DEFAULT_BRIDGE_URL.to_string(),
            binance_url: DEFAULT_BINANCE_URL.to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from the process environment: the optional `CORR_CONFIG` file, then the
    /// `WS_ADDR`, `BRIDGE_WS_URL` and `BINANCE_WS_URL` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Some(std::fs::read_to_string(&path).map_err(|error| {
                ConfigError::Parse(format!("failed to read {path}: {error}"))
            })?),
            Err(_) => None,
        };

        Self::load(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from optional JSON file contents and an environment lookup, then validate.
    pub fn load<Env>(file: Option<&str>, env: Env) -> Result<Self, ConfigError>
    where
        Env: Fn(&str) -> Option<String>,
    {
        let mut config = match file {
            Some(json) => serde_json::from_str::<Self>(json)
                .map_err(|error| ConfigError::Parse(error.to_string()))?,
            None => Self::default(),
        };

        if let Some(addr) = env("WS_ADDR") {
            config.addr = addr
                .parse()
                .map_err(|_| ConfigError::Parse(format!("invalid WS_ADDR: {addr}")))?;
        }
        if let Some(url) = env("BRIDGE_WS_URL") {
            config.bridge_url = url;
        }
        if let Some(url) = env("BINANCE_WS_URL") {
            config.binance_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge()?;
        self.binance()?;
        self.engine.validate()
    }

    pub fn bridge(&self) -> Result<Url, ConfigError> {
        parse_ws_url(&self.bridge_url)
    }

    pub fn binance(&self) -> Result<Url, ConfigError> {
        parse_ws_url(&self.binance_url)
    }
}

fn parse_ws_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|error| ConfigError::Parse(format!("{url}: {error}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        scheme => Err(ConfigError::Parse(format!(
            "{url}: expected ws or wss scheme, got {scheme}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corr_engine::Timeframe;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::load(None, env(&[])).unwrap();
        assert_eq!(config.addr, "0.0.0.0:9001".parse::<SocketAddr>().unwrap());
        assert_eq!(config.bridge().unwrap().as_str(), DEFAULT_BRIDGE_URL);
        assert_eq!(config.binance().unwrap().as_str(), DEFAULT_BINANCE_URL);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_server_config_file_and_env_overrides() {
        let file = r#"{
            "addr": "127.0.0.1:7000",
            "bridge_url": "ws://10.0.0.5:8765/ws",
            "engine": { "timeframes": ["1m", "5m"] }
        }"#;

        let config = ServerConfig::load(
            Some(file),
            env(&[
                ("WS_ADDR", "127.0.0.1:9100"),
                ("BINANCE_WS_URL", "wss://stream.binance.com:9443/ws/ethusdt@trade"),
            ]),
        )
        .unwrap();

        assert_eq!(config.addr, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.bridge_url, "ws://10.0.0.5:8765/ws");
        assert!(config.binance_url.ends_with("ethusdt@trade"));
        assert_eq!(config.engine.timeframes, vec![Timeframe::M1, Timeframe::M5]);
    }

    #[test]
    fn test_server_config_rejects_invalid_input() {
        struct TestCase {
            file: Option<&'static str>,
            env: Vec<(&'static str, &'static str)>,
        }

        let tests = vec![
            TestCase {
                // TC0: unparseable listen address
                file: None,
                env: vec![("WS_ADDR", "localhost")],
            },
            TestCase {
                // TC1: non websocket upstream
                file: None,
                env: vec![("BRIDGE_WS_URL", "http://127.0.0.1:8765/ws")],
            },
            TestCase {
                // TC2: malformed file
                file: Some("{ not json"),
                env: vec![],
            },
            TestCase {
                // TC3: engine invariant violated, base timeframe not correlated
                file: Some(r#"{ "engine": { "timeframes": ["5m", "15m"] } }"#),
                env: vec![],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = ServerConfig::load(test.file, env(&test.env));
            assert!(actual.is_err(), "TC{} failed", index);
        }
    }
}
