use crate::backtest::metrics::BacktestReport;
use crate::config::{BacktestConfig, EngineConfig};
use crate::engine::{StrategyDriver, TradingEngine};
use crate::error::EngineError;
use crate::market::check_candles;
use crate::models::Candle;
use crate::strategy::Strategy;
use crate::Result;

/// Replays closed base candles through the same driver and engine the live
/// runner uses, with the simulated ledger and backend underneath
pub struct BacktestRunner {
    engine_config: EngineConfig,
    backtest_config: BacktestConfig,
    record_invocations: bool,
}

impl BacktestRunner {
    pub fn new(engine_config: EngineConfig, backtest_config: BacktestConfig) -> Self {
        Self {
            engine_config,
            backtest_config,
            record_invocations: false,
        }
    }

    /// Include every strategy call in the report
    pub fn record_invocations(mut self) -> Self {
        self.record_invocations = true;
        self
    }

    /// Run a strategy over `candles` (base timeframe, oldest first).
    ///
    /// Candles up to `from` only warm up the aggregator; when `from` is unset the
    /// warm-up covers the first `warmup_duration` of data. Trading stops after `to`.
    /// Whatever is open at the end is cancelled and the position flattened.
    pub fn run(&self, strategy: Box<dyn Strategy>, candles: &[Candle]) -> Result<BacktestReport> {
        let Some(first) = candles.first() else {
            return Err(EngineError::DataIntegrity("no candles to backtest".to_string()));
        };

        let mut gaps = 0;
        if self.backtest_config.check_candles {
            let integrity = check_candles(candles);
            if integrity.duplicates > 0 || integrity.out_of_order > 0 || integrity.invalid > 0 {
                return Err(EngineError::DataIntegrity(format!(
                    "{} duplicates, {} out of order, {} invalid candles",
                    integrity.duplicates, integrity.out_of_order, integrity.invalid
                )));
            }
            gaps = integrity.gaps;
        }

        let from = self
            .backtest_config
            .from
            .unwrap_or(first.timestamp + self.engine_config.warmup_duration());
        let to = self.backtest_config.to;
        let traded = candles
            .iter()
            .filter(|c| c.timestamp > from && to.map_or(true, |to| c.timestamp <= to))
            .count();
        if traded == 0 {
            return Err(EngineError::DataIntegrity(format!(
                "no candles after warm-up ending {}",
                from
            )));
        }

        let engine = TradingEngine::simulated(self.engine_config.clone())?;
        let mut driver = StrategyDriver::new(engine, strategy)?;
        if self.record_invocations {
            driver = driver.record_invocations();
        }

        tracing::info!(
            "Backtest {} on {}: {} candles, trading {} after {}",
            driver.strategy_name(),
            self.engine_config.symbol,
            candles.len(),
            traded,
            from
        );

        let mut last_traded = None;
        for candle in candles {
            if candle.timestamp <= from {
                driver.warm_up(candle)?;
                continue;
            }
            if to.is_some_and(|to| candle.timestamp > to) {
                break;
            }
            driver.on_base_candle(candle)?;
            last_traded = Some(candle.timestamp);
        }

        let engine = driver.engine_mut();
        engine.cancel_all()?;
        if engine.get_position_size() != 0.0 {
            tracing::info!("Closing {} at end of data", engine.get_position_size());
            engine.close_all()?;
        }

        let engine = driver.engine();
        let mut report = BacktestReport::from_trades(
            driver.strategy_name(),
            &self.engine_config.symbol,
            engine.closed_trades(),
            engine.stats(),
            self.engine_config.ledger.initial_balance,
        );
        report.from = Some(from);
        report.to = last_traded;
        report.candles = traded;
        report.missing_candles = gaps + driver.aggregator().missing_candles();
        report.plots = engine.plots().clone();
        report.chaser_stats = engine.chaser_stats().to_vec();
        report.invocations = driver.invocations().to_vec();

        tracing::info!(
            "Backtest done: {} trades, balance {:.2}",
            report.total_trades,
            report.final_balance
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::synthetic::{MarketScenario, SyntheticDataGenerator};
    use crate::strategy::SmaCross;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            base_timeframe: "5m".parse().unwrap(),
            timeframes: vec!["5m".parse().unwrap()],
            ohlcv_len: 31,
            ..Default::default()
        }
    }

    fn candles(scenario: MarketScenario, n: usize) -> Vec<Candle> {
        SyntheticDataGenerator::new(42).generate(scenario, n, &"5m".parse().unwrap())
    }

    #[test]
    fn test_backtest_volatile() {
        let runner = BacktestRunner::new(engine_config(), BacktestConfig::default());
        let report = runner
            .run(
                Box::new(SmaCross::new(5, 20).with_qty(1.0)),
                &candles(MarketScenario::Volatile, 600),
            )
            .unwrap();

        assert!(report.total_trades > 0);
        // 155 minutes of warm-up: the first 32 candles
        assert_eq!(report.candles, 600 - 32);
        assert_eq!(report.plots["sma_fast"].len(), report.candles);
        assert_eq!(report.trades.len(), report.total_trades);
    }

    #[test]
    fn test_backtest_insufficient_data() {
        let runner = BacktestRunner::new(engine_config(), BacktestConfig::default());
        let err = runner
            .run(Box::new(SmaCross::new(5, 20)), &candles(MarketScenario::Uptrend, 20))
            .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn test_duplicate_candles_rejected() {
        let mut data = candles(MarketScenario::Sideways, 100);
        let duplicate = data[49].clone();
        data.insert(50, duplicate);
        let runner = BacktestRunner::new(engine_config(), BacktestConfig::default());
        let err = runner.run(Box::new(SmaCross::new(5, 20)), &data).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn test_gaps_are_counted() {
        let runner = BacktestRunner::new(engine_config(), BacktestConfig::default());
        let report = runner
            .run(
                Box::new(SmaCross::new(5, 20).with_qty(1.0)),
                &candles(MarketScenario::WithGaps, 300),
            )
            .unwrap();
        assert!(report.missing_candles >= 6);
    }
}
