use super::{Strategy, StrategyParams};
use crate::engine::TradingEngine;
use crate::error::EngineError;
use crate::exit::SltpPolicy;
use crate::indicators::{calculate_sma, crossover, crossunder, sma_at};
use crate::market::{Ohlcv, Timeframe};
use crate::orders::OrderRequest;
use crate::Result;

/// Moving average crossover: long when the fast SMA crosses above the slow one,
/// short when it crosses below. Always in the market once the first cross happens.
#[derive(Debug, Clone)]
pub struct SmaCross {
    fast: usize,
    slow: usize,
    /// Fixed order size; zero sizes every entry with `get_lot`
    qty: f64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    /// Only act on this timeframe; None acts on every one
    timeframe: Option<String>,
}

impl SmaCross {
    pub fn new(fast: usize, slow: usize) -> Self {
        Self {
            fast,
            slow,
            qty: 0.0,
            take_profit_pct: 0.0,
            stop_loss_pct: 0.0,
            timeframe: None,
        }
    }

    /// Read `fast`, `slow`, `qty`, `take_profit_pct` and `stop_loss_pct`
    pub fn from_params(params: &StrategyParams) -> Self {
        Self {
            fast: params.get_usize("fast", 10),
            slow: params.get_usize("slow", 30),
            qty: params.get("qty", 0.0),
            take_profit_pct: params.get("take_profit_pct", 0.0),
            stop_loss_pct: params.get("stop_loss_pct", 0.0),
            timeframe: None,
        }
    }

    pub fn with_qty(mut self, qty: f64) -> Self {
        self.qty = qty;
        self
    }

    pub fn on_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.timeframe = Some(timeframe.into());
        self
    }

    /// Candles the window must hold for a crossover check
    pub fn min_candles_required(&self) -> usize {
        self.fast.max(self.slow) + 1
    }

    fn lot(&self, engine: &TradingEngine) -> f64 {
        if self.qty > 0.0 {
            self.qty
        } else {
            engine.get_lot(None)
        }
    }
}

impl Default for SmaCross {
    fn default() -> Self {
        Self::new(10, 30)
    }
}

impl Strategy for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn on_start(&mut self, engine: &mut TradingEngine) -> Result<()> {
        if self.fast == 0 || self.fast >= self.slow {
            return Err(EngineError::Config(format!(
                "sma_cross needs 0 < fast < slow, got {} / {}",
                self.fast, self.slow
            )));
        }
        if self.take_profit_pct > 0.0 || self.stop_loss_pct > 0.0 {
            engine.sltp(SltpPolicy::percent(
                self.take_profit_pct,
                self.take_profit_pct,
                self.stop_loss_pct,
                self.stop_loss_pct,
            ));
        }
        Ok(())
    }

    fn on_candle(&mut self, engine: &mut TradingEngine, timeframe: &Timeframe, ohlcv: &Ohlcv) -> Result<()> {
        if self.timeframe.as_deref().is_some_and(|tf| tf != timeframe.label()) {
            return Ok(());
        }

        let closes = &ohlcv.close;
        let (Some(fast), Some(slow), Some(fast_prev), Some(slow_prev)) = (
            calculate_sma(closes, self.fast),
            calculate_sma(closes, self.slow),
            sma_at(closes, self.fast, 1),
            sma_at(closes, self.slow, 1),
        ) else {
            return Err(EngineError::Strategy(format!(
                "window of {} candles is too short, need {}",
                closes.len(),
                self.min_candles_required()
            )));
        };

        engine.plot("sma_fast", fast);
        engine.plot("sma_slow", slow);

        if crossover(fast_prev, slow_prev, fast, slow) {
            let qty = self.lot(engine);
            tracing::info!("{} crossover {:.2} > {:.2}, long {}", timeframe, fast, slow, qty);
            engine.entry(OrderRequest::long("Long", qty))?;
        } else if crossunder(fast_prev, slow_prev, fast, slow) {
            let qty = self.lot(engine);
            tracing::info!("{} crossunder {:.2} < {:.2}, short {}", timeframe, fast, slow, qty);
            engine.entry(OrderRequest::short("Short", qty))?;
        }
        Ok(())
    }
}
