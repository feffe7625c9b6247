use crate::error::EngineError;
use crate::exchange::retry::RetryPolicy;
use crate::market::{Timeframe, TimeframeOrder};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Accounting parameters shared by both ledgers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub initial_balance: f64,
    pub leverage: f64,
    /// Taker fee charged on every closing leg (0.075%)
    pub commission_rate: f64,
    /// Quantities are quote notional rather than contracts
    pub qty_in_quote: bool,
    pub enable_trade_log: bool,
    pub order_log_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            initial_balance: 1000.0,
            leverage: 1.0,
            commission_rate: 0.00075,
            qty_in_quote: false,
            enable_trade_log: true,
            order_log_path: None,
        }
    }
}

/// How a threshold exit is filled during simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitFillModel {
    /// Close with a market order at the next evaluated price, exactly as live trading does
    MarketPrice,
    /// Close at the computed trigger price as soon as a bar crosses it (optimistic)
    #[default]
    TriggerPrice,
}

/// Suffix scheme for transmitted client order ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderIdMode {
    #[default]
    Random,
    /// Zero-padded counter, for reproducible replays
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub symbol: String,
    pub base_timeframe: Timeframe,
    pub timeframes: Vec<Timeframe>,
    pub ohlcv_len: usize,
    pub timeframe_order: TimeframeOrder,
    pub call_strat_on_start: bool,
    pub ledger: LedgerConfig,
    pub exit_fill: ExitFillModel,
    pub order_ids: OrderIdMode,
    /// Fraction of balance held back when sizing with `get_lot`
    pub margin_retain_rate: f64,
    pub asset_decimals: u32,
    pub quote_decimals: u32,
    pub order_update_log: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            base_timeframe: Timeframe::default(),
            timeframes: vec![Timeframe::known("1h", 60)],
            ohlcv_len: 100,
            timeframe_order: TimeframeOrder::Descending,
            call_strat_on_start: false,
            ledger: LedgerConfig::default(),
            exit_fill: ExitFillModel::default(),
            order_ids: OrderIdMode::default(),
            margin_retain_rate: 0.005,
            asset_decimals: 3,
            quote_decimals: 2,
            order_update_log: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(EngineError::Config("symbol is empty".to_string()));
        }
        if self.ohlcv_len == 0 {
            return Err(EngineError::Config("ohlcv_len must be at least 1".to_string()));
        }
        if self.timeframes.is_empty() {
            return Err(EngineError::Config("no timeframes configured".to_string()));
        }
        if let Some(tf) = self
            .timeframes
            .iter()
            .find(|tf| !tf.is_multiple_of(&self.base_timeframe))
        {
            return Err(EngineError::Config(format!(
                "timeframe {} is not a multiple of base {}",
                tf, self.base_timeframe
            )));
        }
        if self.ledger.leverage <= 0.0 {
            return Err(EngineError::Config("leverage must be positive".to_string()));
        }
        if self.ledger.commission_rate < 0.0 {
            return Err(EngineError::Config(
                "commission_rate cannot be negative".to_string(),
            ));
        }
        if self.ledger.initial_balance < 0.0 {
            return Err(EngineError::Config(
                "initial_balance cannot be negative".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.margin_retain_rate) {
            return Err(EngineError::Config(
                "margin_retain_rate must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    /// History needed before the slowest timeframe has a full window
    pub fn warmup_duration(&self) -> Duration {
        let longest = self
            .timeframes
            .iter()
            .map(|tf| tf.minutes())
            .max()
            .unwrap_or(self.base_timeframe.minutes());
        Duration::minutes(longest as i64 * self.ohlcv_len as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub exchange: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub cache_dir: PathBuf,
    pub check_candles: bool,
    /// Refresh the cache from the kline endpoint before running
    pub update_data: bool,
    pub kline_url: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            exchange: "bybit".to_string(),
            from: None,
            to: None,
            cache_dir: PathBuf::from("ohlc"),
            check_candles: true,
            update_data: false,
            kline_url: "https://api.bybit.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub public_timeout_secs: u64,
    pub private_timeout_secs: u64,
    pub watchdog_interval_secs: u64,
    /// Granularity of iceberg leg scheduling
    pub timer_interval_ms: u64,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            public_timeout_secs: 120,
            private_timeout_secs: 60,
            watchdog_interval_secs: 5,
            timer_interval_ms: 500,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Whole-application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub backtest: BacktestConfig,
    pub live: LiveConfig,
    /// Strategy inputs, read by name
    pub params: HashMap<String, f64>,
}

impl AppConfig {
    /// Layer a config file (optional) and `PERPBOT__*` environment variables over the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PERPBOT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: AppConfig = builder.build()?.try_deserialize()?;
        cfg.engine.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ledger.commission_rate, 0.00075);
        assert_eq!(cfg.warmup_duration(), Duration::minutes(60 * 100));
    }

    #[test]
    fn test_validation_errors() {
        let mut cfg = EngineConfig::default();
        cfg.ohlcv_len = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.base_timeframe = "2m".parse().unwrap();
        cfg.timeframes = vec!["5m".parse().unwrap()];
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.ledger.leverage = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("perpbot-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bot.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            r#"{{
                "engine": {{
                    "symbol": "ETHUSDT",
                    "timeframes": ["5m", "15m"],
                    "ohlcv_len": 20,
                    "timeframe_order": "ascending",
                    "ledger": {{ "leverage": 3.0 }}
                }},
                "params": {{ "fast_len": 9 }}
            }}"#
        )
        .unwrap();

        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.engine.symbol, "ETHUSDT");
        assert_eq!(cfg.engine.timeframes.len(), 2);
        assert_eq!(cfg.engine.timeframe_order, TimeframeOrder::Ascending);
        assert_eq!(cfg.engine.ledger.leverage, 3.0);
        assert_eq!(cfg.engine.ledger.commission_rate, 0.00075);
        assert_eq!(cfg.params.get("fast_len"), Some(&9.0));

        std::fs::remove_dir_all(&dir).ok();
    }
}
