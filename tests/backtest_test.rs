use chrono::{DateTime, Utc};
use perpbot::backtest::{BacktestRunner, MarketScenario, SyntheticDataGenerator};
use perpbot::config::{BacktestConfig, EngineConfig, OrderIdMode};
use perpbot::engine::{StrategyDriver, TradingEngine};
use perpbot::market::{Ohlcv, Timeframe};
use perpbot::orders::OrderRequest;
use perpbot::strategy::{SmaCross, Strategy};
use perpbot::Result;
use std::collections::HashMap;

fn tf(label: &str) -> Timeframe {
    label.parse().unwrap()
}

fn multi_timeframe_config() -> EngineConfig {
    EngineConfig {
        base_timeframe: tf("1m"),
        timeframes: vec![tf("1m"), tf("5m"), tf("15m")],
        ohlcv_len: 21,
        order_ids: OrderIdMode::Sequential,
        ..Default::default()
    }
}

fn one_minute_candles(scenario: MarketScenario, n: usize) -> Vec<perpbot::Candle> {
    SyntheticDataGenerator::new(7).generate(scenario, n, &tf("1m"))
}

#[test]
fn test_backtest_is_deterministic() {
    tracing_subscriber::fmt()
        .with_env_filter("perpbot=info")
        .try_init()
        .ok();

    let candles = one_minute_candles(MarketScenario::Volatile, 1500);
    let run = || {
        BacktestRunner::new(multi_timeframe_config(), BacktestConfig::default())
            .record_invocations()
            .run(Box::new(SmaCross::new(5, 20).with_qty(1.0)), &candles)
            .unwrap()
    };

    let first = run();
    let second = run();

    assert!(first.total_trades > 0);
    assert_eq!(first.invocations, second.invocations);
    assert_eq!(first.trades, second.trades);
    assert_eq!(first.final_balance, second.final_balance);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_strategy_never_sees_forming_candles() {
    let candles = one_minute_candles(MarketScenario::Sideways, 1200);
    let report = BacktestRunner::new(multi_timeframe_config(), BacktestConfig::default())
        .record_invocations()
        .run(Box::new(SmaCross::new(5, 20).with_qty(1.0)), &candles)
        .unwrap();

    assert_eq!(
        report.invocations.iter().filter(|c| c.timeframe == "1m").count(),
        report.candles
    );

    let mut last_seen: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for call in &report.invocations {
        let last = call.last_candle.unwrap();
        assert!(last <= call.at, "{} window ends at {} after {}", call.timeframe, last, call.at);
        assert!(tf(&call.timeframe).is_boundary(last));
        // At most one call per closed candle per timeframe
        if let Some(previous) = last_seen.insert(call.timeframe.as_str(), last) {
            assert!(last > previous);
        }
    }

    let slow = report.invocations.iter().filter(|c| c.timeframe == "15m").count();
    assert!(slow > 0);
    assert!(slow <= report.candles / 15 + 1);
}

/// Adds one unit on every candle
struct Stacker;

impl Strategy for Stacker {
    fn name(&self) -> &str {
        "stacker"
    }

    fn on_candle(&mut self, engine: &mut TradingEngine, _timeframe: &Timeframe, _ohlcv: &Ohlcv) -> Result<()> {
        engine.entry_pyramiding(OrderRequest::long("Long", 1.0), 3, false)
    }
}

#[test]
fn test_pyramiding_stops_at_cap() {
    let config = EngineConfig {
        base_timeframe: tf("1m"),
        timeframes: vec![tf("1m")],
        ohlcv_len: 5,
        ..Default::default()
    };
    let candles = one_minute_candles(MarketScenario::Sideways, 30);

    let engine = TradingEngine::simulated(config).unwrap();
    let mut driver = StrategyDriver::new(engine, Box::new(Stacker)).unwrap();
    for candle in &candles[..5] {
        driver.warm_up(candle).unwrap();
    }
    for (i, candle) in candles[5..].iter().enumerate() {
        driver.on_base_candle(candle).unwrap();
        let expected = (i + 1).min(3) as f64;
        assert_eq!(driver.engine().get_position_size(), expected);
    }
    assert_eq!(driver.engine().stats().order_count, 3);
}
