// Strategy interface, parameter lookup and the bundled demo strategy
pub mod sma_cross;

pub use sma_cross::SmaCross;

use crate::engine::TradingEngine;
use crate::market::{Ohlcv, Timeframe};
use crate::Result;
use std::collections::HashMap;

/// User trading logic. Called once per closed candle per configured timeframe,
/// with a window of exactly `ohlcv_len` closed candles, oldest first.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Runs once before the first candle; a place to set exit or SL/TP policies
    fn on_start(&mut self, _engine: &mut TradingEngine) -> Result<()> {
        Ok(())
    }

    /// Errors of kind Strategy are logged and the run goes on; fatal ones stop it
    fn on_candle(&mut self, engine: &mut TradingEngine, timeframe: &Timeframe, ohlcv: &Ohlcv) -> Result<()>;
}

/// Named numeric inputs resolved from `AppConfig.params`
#[derive(Debug, Clone, Default)]
pub struct StrategyParams {
    values: HashMap<String, f64>,
}

impl StrategyParams {
    pub fn new(values: HashMap<String, f64>) -> Self {
        Self { values }
    }

    /// Configured value, or `default` when the name is absent
    pub fn get(&self, name: &str, default: f64) -> f64 {
        match self.values.get(name) {
            Some(value) => {
                tracing::debug!("input {} = {}", name, value);
                *value
            }
            None => default,
        }
    }

    pub fn get_usize(&self, name: &str, default: usize) -> usize {
        let value = self.get(name, default as f64);
        if value.is_finite() && value >= 0.0 {
            value as usize
        } else {
            default
        }
    }
}
