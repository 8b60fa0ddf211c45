use std::env;
use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const DEFAULT_REST_ENDPOINT: &str = "https://api.dydx.exchange";
const DEFAULT_WEB_SOCKET_ENDPOINT: &str = "wss://api.dydx.exchange/v3/ws";
const DEFAULT_COINT_ENDPOINT: &str = "http://localhost:8000";
const DEFAULT_DB_PATH: &str = "statbot.db";
const DEFAULT_MARKET_A: &str = "AAVE-USD";
const DEFAULT_MARKET_B: &str = "UNI-USD";
const DEFAULT_TRADABLE_CAPITAL: f64 = 100.0;
const DEFAULT_STOP_LOSS: f64 = 0.15;
const DEFAULT_TRIGGER_THRESH: f64 = 1.1;
const DEFAULT_LIMIT_ORDER: bool = true;
const DEFAULT_CANDLES_LIMIT: usize = 100;
/// The exchange caps candle queries at 100.
const MAX_CANDLES_LIMIT: usize = 100;
const DEFAULT_ZSCORE_WINDOW: usize = 21;
const DEFAULT_TIME_FRAME: &str = "1HOUR";
const DEFAULT_TICK_SECS: u64 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StatBotYaml {
    rest_endpoint: Option<String>,
    web_socket_endpoint: Option<String>,
    coint_endpoint: Option<String>,
    db_path: Option<String>,
    market_a: Option<String>,
    market_b: Option<String>,
    positive_market: Option<String>,
    tradable_capital: Option<f64>,
    stop_loss: Option<f64>,
    trigger_thresh: Option<f64>,
    limit_order: Option<bool>,
    candles_limit: Option<usize>,
    zscore_window: Option<usize>,
    time_frame: Option<String>,
    tick_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StatBotConfig {
    pub rest_endpoint: String,
    pub web_socket_endpoint: String,
    /// Base URL of the cointegration statistics service.
    pub coint_endpoint: String,
    pub db_path: String,
    pub market_a: String,
    pub market_b: String,
    /// The leg bought when the z-score is positive.
    pub positive_market: String,
    pub tradable_capital: f64,
    pub stop_loss: f64,
    pub trigger_thresh: f64,
    pub limit_order: bool,
    pub candles_limit: usize,
    pub zscore_window: usize,
    pub time_frame: String,
    pub tick_secs: u64,
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

impl StatBotConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("STATBOT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open StatBot config {}", path_ref.display()))?;
        let yaml: StatBotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse StatBot config {}", path_ref.display()))?;

        let market_a = yaml
            .market_a
            .unwrap_or_else(|| DEFAULT_MARKET_A.to_string());
        let market_b = yaml
            .market_b
            .unwrap_or_else(|| DEFAULT_MARKET_B.to_string());
        let positive_market = yaml.positive_market.unwrap_or_else(|| market_a.clone());

        let mut cfg = StatBotConfig {
            rest_endpoint: yaml
                .rest_endpoint
                .unwrap_or_else(|| DEFAULT_REST_ENDPOINT.to_string()),
            web_socket_endpoint: yaml
                .web_socket_endpoint
                .unwrap_or_else(|| DEFAULT_WEB_SOCKET_ENDPOINT.to_string()),
            coint_endpoint: yaml
                .coint_endpoint
                .unwrap_or_else(|| DEFAULT_COINT_ENDPOINT.to_string()),
            db_path: yaml.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            market_a,
            market_b,
            positive_market,
            tradable_capital: yaml.tradable_capital.unwrap_or(DEFAULT_TRADABLE_CAPITAL),
            stop_loss: yaml.stop_loss.unwrap_or(DEFAULT_STOP_LOSS),
            trigger_thresh: yaml.trigger_thresh.unwrap_or(DEFAULT_TRIGGER_THRESH),
            limit_order: yaml.limit_order.unwrap_or(DEFAULT_LIMIT_ORDER),
            candles_limit: yaml.candles_limit.unwrap_or(DEFAULT_CANDLES_LIMIT),
            zscore_window: yaml.zscore_window.unwrap_or(DEFAULT_ZSCORE_WINDOW),
            time_frame: yaml
                .time_frame
                .unwrap_or_else(|| DEFAULT_TIME_FRAME.to_string()),
            tick_secs: yaml.tick_secs.unwrap_or(DEFAULT_TICK_SECS),
            api_key: String::new(),
            api_secret: String::new(),
            api_passphrase: String::new(),
        };
        cfg.read_credentials()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let market_a = env::var("MARKET_A").unwrap_or_else(|_| DEFAULT_MARKET_A.to_string());
        let market_b = env::var("MARKET_B").unwrap_or_else(|_| DEFAULT_MARKET_B.to_string());
        let positive_market =
            env::var("POSITIVE_MARKET").unwrap_or_else(|_| market_a.clone());

        let mut cfg = StatBotConfig {
            rest_endpoint: env::var("REST_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_REST_ENDPOINT.to_string()),
            web_socket_endpoint: env::var("WEB_SOCKET_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_WEB_SOCKET_ENDPOINT.to_string()),
            coint_endpoint: env::var("COINT_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_COINT_ENDPOINT.to_string()),
            db_path: env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string()),
            market_a,
            market_b,
            positive_market,
            tradable_capital: env::var("TRADABLE_CAPITAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TRADABLE_CAPITAL),
            stop_loss: env::var("STOP_LOSS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STOP_LOSS),
            trigger_thresh: env::var("TRIGGER_THRESH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TRIGGER_THRESH),
            limit_order: env::var("LIMIT_ORDER")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(DEFAULT_LIMIT_ORDER),
            candles_limit: env::var("CANDLES_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CANDLES_LIMIT),
            zscore_window: env::var("ZSCORE_WINDOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_ZSCORE_WINDOW),
            time_frame: env::var("TIME_FRAME").unwrap_or_else(|_| DEFAULT_TIME_FRAME.to_string()),
            tick_secs: env::var("TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TICK_SECS),
            api_key: String::new(),
            api_secret: String::new(),
            api_passphrase: String::new(),
        };
        cfg.read_credentials()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// API credentials always come from the environment, never from YAML.
    fn read_credentials(&mut self) -> Result<()> {
        self.api_key = env::var("STATBOT_API_KEY").context("STATBOT_API_KEY must be set")?;
        self.api_secret =
            env::var("STATBOT_API_SECRET").context("STATBOT_API_SECRET must be set")?;
        self.api_passphrase =
            env::var("STATBOT_API_PASSPHRASE").context("STATBOT_API_PASSPHRASE must be set")?;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.market_a == self.market_b {
            bail!("market_a and market_b must differ");
        }
        if self.positive_market != self.market_a && self.positive_market != self.market_b {
            bail!(
                "positive_market {} is neither {} nor {}",
                self.positive_market,
                self.market_a,
                self.market_b
            );
        }
        if self.tradable_capital <= 0.0 {
            bail!("tradable_capital must be positive");
        }
        if !(0.0..1.0).contains(&self.stop_loss) {
            bail!("stop_loss must be a fraction in [0, 1)");
        }
        if self.candles_limit > MAX_CANDLES_LIMIT {
            log::warn!(
                "candles_limit {} exceeds the exchange maximum; using {}",
                self.candles_limit,
                MAX_CANDLES_LIMIT
            );
            self.candles_limit = MAX_CANDLES_LIMIT;
        }
        if self.zscore_window == 0 || self.zscore_window > self.candles_limit {
            bail!(
                "zscore_window must be between 1 and candles_limit ({})",
                self.candles_limit
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> StatBotConfig {
        StatBotConfig {
            rest_endpoint: DEFAULT_REST_ENDPOINT.to_string(),
            web_socket_endpoint: DEFAULT_WEB_SOCKET_ENDPOINT.to_string(),
            coint_endpoint: DEFAULT_COINT_ENDPOINT.to_string(),
            db_path: DEFAULT_DB_PATH.to_string(),
            market_a: "BTC-USD".to_string(),
            market_b: "ETH-USD".to_string(),
            positive_market: "BTC-USD".to_string(),
            tradable_capital: DEFAULT_TRADABLE_CAPITAL,
            stop_loss: DEFAULT_STOP_LOSS,
            trigger_thresh: DEFAULT_TRIGGER_THRESH,
            limit_order: DEFAULT_LIMIT_ORDER,
            candles_limit: DEFAULT_CANDLES_LIMIT,
            zscore_window: DEFAULT_ZSCORE_WINDOW,
            time_frame: DEFAULT_TIME_FRAME.to_string(),
            tick_secs: DEFAULT_TICK_SECS,
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            api_passphrase: "pass".to_string(),
        }
    }

    #[test]
    fn yaml_fields_parse_with_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "market_a: BTC-USD\nmarket_b: ETH-USD\ntradable_capital: 250.0\nlimit_order: false"
        )
        .unwrap();
        let yaml: StatBotYaml =
            serde_yaml::from_reader(File::open(file.path()).unwrap()).unwrap();
        assert_eq!(yaml.market_a.as_deref(), Some("BTC-USD"));
        assert_eq!(yaml.tradable_capital, Some(250.0));
        assert_eq!(yaml.limit_order, Some(false));
        assert!(yaml.trigger_thresh.is_none());
    }

    #[test]
    fn identical_markets_are_rejected() {
        let mut cfg = base_config();
        cfg.market_b = cfg.market_a.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn positive_market_must_be_one_of_the_pair() {
        let mut cfg = base_config();
        cfg.positive_market = "SOL-USD".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_candles_limit_is_coerced() {
        let mut cfg = base_config();
        cfg.candles_limit = 500;
        cfg.validate().unwrap();
        assert_eq!(cfg.candles_limit, MAX_CANDLES_LIMIT);
    }

    #[test]
    fn zscore_window_cannot_exceed_history() {
        let mut cfg = base_config();
        cfg.zscore_window = 200;
        assert!(cfg.validate().is_err());
    }
}
