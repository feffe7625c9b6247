use crate::engine::trading::TradingEngine;
use crate::error::EngineError;
use crate::exchange::ExchangeEvent;
use crate::market::{CandleAggregator, ClosedCandleUpdate};
use crate::models::Candle;
use crate::strategy::Strategy;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One strategy call, kept when invocation recording is on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    /// Engine time (base candle) of the call
    pub at: DateTime<Utc>,
    pub timeframe: String,
    /// Newest candle in the window handed to the strategy
    pub last_candle: Option<DateTime<Utc>>,
}

/// Feeds base candles through the aggregator and calls the strategy between the
/// engine's pre- and post-hooks. Shared by the backtest and live runners.
pub struct StrategyDriver {
    aggregator: CandleAggregator,
    engine: TradingEngine,
    strategy: Box<dyn Strategy>,
    invocations: Option<Vec<Invocation>>,
    last_warm: Option<Candle>,
    started: bool,
}

impl StrategyDriver {
    pub fn new(engine: TradingEngine, strategy: Box<dyn Strategy>) -> Result<Self> {
        let config = engine.config();
        let aggregator = CandleAggregator::new(
            config.base_timeframe.clone(),
            &config.timeframes,
            config.ohlcv_len,
            config.timeframe_order,
        )?;
        Ok(Self {
            aggregator,
            engine,
            strategy,
            invocations: None,
            last_warm: None,
            started: false,
        })
    }

    /// Keep a record of every strategy call
    pub fn record_invocations(mut self) -> Self {
        self.invocations = Some(Vec::new());
        self
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut TradingEngine {
        &mut self.engine
    }

    pub fn aggregator(&self) -> &CandleAggregator {
        &self.aggregator
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn invocations(&self) -> &[Invocation] {
        self.invocations.as_deref().unwrap_or_default()
    }

    /// History before the first traded candle; the strategy is not called
    pub fn warm_up(&mut self, candle: &Candle) -> Result<()> {
        self.aggregator.warm_up(candle)?;
        self.last_warm = Some(candle.clone());
        Ok(())
    }

    /// Call the strategy's start hook and, when configured, run it once on the
    /// warm-up data
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        tracing::info!("Starting strategy {}", self.strategy.name());
        self.strategy.on_start(&mut self.engine)?;

        if !self.engine.config().call_strat_on_start {
            return Ok(());
        }
        let Some(last) = self.last_warm.clone() else {
            tracing::warn!("call_strat_on_start set but no warm-up data was loaded");
            return Ok(());
        };
        self.engine.begin_bar(&last)?;
        for update in self.aggregator.due_on_start() {
            self.invoke(&update)?;
        }
        self.engine.end_bar()
    }

    /// One closed base candle: pre-hooks, every timeframe that closed, post-hooks
    pub fn on_base_candle(&mut self, candle: &Candle) -> Result<()> {
        if !self.started {
            self.start()?;
        }
        // A rejected candle must not reach the engine's hooks
        let updates = self.aggregator.ingest(candle)?;
        self.engine.begin_bar(candle)?;
        for update in &updates {
            self.invoke(update)?;
        }
        self.engine.end_bar()
    }

    fn invoke(&mut self, update: &ClosedCandleUpdate) -> Result<()> {
        if let Some(log) = self.invocations.as_mut() {
            log.push(Invocation {
                at: self.engine.now(),
                timeframe: update.timeframe.label().to_string(),
                last_candle: update.window.last_timestamp(),
            });
        }

        match self
            .strategy
            .on_candle(&mut self.engine, &update.timeframe, &update.window)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::error!(
                    "Strategy {} failed on {} candle {}: {}",
                    self.strategy.name(),
                    update.timeframe,
                    update.candle.timestamp,
                    e
                );
                Ok(())
            }
        }
    }

    /// Route a live event to the engine
    pub fn on_event(&mut self, event: ExchangeEvent) -> Result<()> {
        match event {
            ExchangeEvent::Kline(candle) => self.on_base_candle(&candle),
            ExchangeEvent::Ticker(price) => {
                self.engine.on_ticker(price);
                Ok(())
            }
            ExchangeEvent::BookTicker(ticker) => self.engine.on_book_ticker(ticker),
            ExchangeEvent::Order(update) => self.engine.on_order_update(update),
            ExchangeEvent::Execution(fill) => {
                tracing::debug!(
                    "Execution: {} {} {} @ {}",
                    fill.order_id,
                    fill.side,
                    fill.qty,
                    fill.price
                );
                Ok(())
            }
            ExchangeEvent::Position(snapshot) => self.engine.on_position_snapshot(snapshot),
            ExchangeEvent::Wallet(balance) => {
                self.engine.on_wallet_update(balance);
                Ok(())
            }
            ExchangeEvent::Heartbeat => Ok(()),
            ExchangeEvent::Fatal(message) => Err(EngineError::Fatal(message)),
        }
    }

    pub fn on_timer(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.engine.on_timer(now)
    }

    pub fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Stopping strategy {}", self.strategy.name());
        self.engine.shutdown()
    }
}
