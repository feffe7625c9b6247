use crate::backend::{BackendCommand, LiveBackend};
use crate::config::{EngineConfig, LiveConfig};
use crate::engine::driver::StrategyDriver;
use crate::engine::supervisor::StreamSupervisor;
use crate::engine::trading::TradingEngine;
use crate::error::EngineError;
use crate::exchange::{with_retry, CommandDispatcher, ExchangeClient, ExchangeEvent, StreamKind};
use crate::ledger::{LedgerStats, LiveLedger};
use crate::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Runs a strategy against a venue: one event loop over both streams, the order
/// dispatcher's feedback, a stream watchdog and the iceberg timer.
pub struct LiveRunner {
    client: Arc<dyn ExchangeClient>,
    config: LiveConfig,
}

impl LiveRunner {
    pub fn new(client: Arc<dyn ExchangeClient>, config: LiveConfig) -> Self {
        Self { client, config }
    }

    /// Seed a live engine from the venue's current position and balance.
    /// The receiver goes to `run` together with a driver built on the engine.
    pub async fn bootstrap(
        &self,
        engine_config: EngineConfig,
    ) -> Result<(TradingEngine, mpsc::Receiver<BackendCommand>)> {
        let client = self.client.as_ref();
        let position = with_retry(&self.config.retry, move || client.get_position()).await?;
        let balance = with_retry(&self.config.retry, move || client.get_balance()).await?;
        tracing::info!(
            "Venue state: position {} @ {}, balance {:.2}",
            position.size,
            position.avg_price,
            balance
        );

        let ledger = LiveLedger::with_state(engine_config.ledger.clone(), position, balance);
        let (backend, commands) = LiveBackend::channel(self.config.queue_capacity);
        let engine = TradingEngine::new(engine_config, Box::new(ledger), Box::new(backend))?;
        Ok((engine, commands))
    }

    /// Run until `shutdown` resolves or a fatal error occurs. Open orders are
    /// cancelled on the way out either way.
    pub async fn run<F>(
        self,
        mut driver: StrategyDriver,
        commands: mpsc::Receiver<BackendCommand>,
        shutdown: F,
    ) -> Result<LedgerStats>
    where
        F: Future<Output = ()>,
    {
        let (event_tx, mut dispatch_events) = mpsc::channel(self.config.queue_capacity.max(1));
        let dispatcher =
            CommandDispatcher::new(self.client.clone(), self.config.retry.clone(), event_tx);
        let dispatcher_task = tokio::spawn(dispatcher.run(commands));

        let result = self
            .event_loop(&mut driver, &mut dispatch_events, shutdown)
            .await;
        if let Err(e) = &result {
            tracing::error!("Live trading stopped: {}", e);
        }

        if let Err(e) = driver.shutdown() {
            tracing::error!("Cleanup on shutdown failed: {}", e);
        }
        let stats = driver.engine().stats().clone();
        // Closing the command queue lets the dispatcher finish what is queued
        drop(driver);
        while let Some(event) = dispatch_events.recv().await {
            tracing::debug!("Late dispatcher event: {:?}", event);
        }
        if let Err(e) = dispatcher_task.await {
            tracing::error!("Order dispatcher task failed: {}", e);
        }

        result.map(|_| stats)
    }

    async fn event_loop<F>(
        &self,
        driver: &mut StrategyDriver,
        dispatch_events: &mut mpsc::Receiver<ExchangeEvent>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut public = self.subscribe(StreamKind::Public).await?;
        let mut private = self.subscribe(StreamKind::Private).await?;
        self.warm_up(driver).await?;

        let mut supervisor = StreamSupervisor::new(
            Duration::from_secs(self.config.public_timeout_secs),
            Duration::from_secs(self.config.private_timeout_secs),
            Instant::now(),
        );
        let mut watchdog =
            tokio::time::interval(Duration::from_secs(self.config.watchdog_interval_secs.max(1)));
        let mut timer =
            tokio::time::interval(Duration::from_millis(self.config.timer_interval_ms.max(1)));
        tokio::pin!(shutdown);

        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    return Ok(());
                }
                event = public.recv() => match event {
                    Some(event) => {
                        supervisor.ping(StreamKind::Public, Instant::now());
                        driver.on_event(event)
                    }
                    None => {
                        tracing::warn!("Public stream closed; reconnecting");
                        public = self.resubscribe(StreamKind::Public, &mut supervisor).await?;
                        Ok(())
                    }
                },
                event = private.recv() => match event {
                    Some(event) => {
                        supervisor.ping(StreamKind::Private, Instant::now());
                        driver.on_event(event)
                    }
                    None => {
                        tracing::warn!("Private stream closed; reconnecting");
                        private = self.resubscribe(StreamKind::Private, &mut supervisor).await?;
                        Ok(())
                    }
                },
                event = dispatch_events.recv() => match event {
                    Some(event) => driver.on_event(event),
                    None => Err(EngineError::Fatal("order dispatcher stopped".to_string())),
                },
                _ = watchdog.tick() => {
                    let now = Instant::now();
                    for stream in supervisor.expired(now) {
                        tracing::warn!(
                            "No {} data for {:?}; reconnecting",
                            stream,
                            supervisor.silence(stream, now)
                        );
                        match stream {
                            StreamKind::Public => {
                                public = self.resubscribe(stream, &mut supervisor).await?
                            }
                            StreamKind::Private => {
                                private = self.resubscribe(stream, &mut supervisor).await?
                            }
                        }
                    }
                    Ok(())
                }
                _ = timer.tick() => driver.on_timer(Utc::now()),
            };

            match outcome {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::error!("Event handling failed: {}", e),
                Ok(()) => {}
            }
        }
    }

    async fn subscribe(&self, stream: StreamKind) -> Result<mpsc::Receiver<ExchangeEvent>> {
        let client = self.client.as_ref();
        let receiver = with_retry(&self.config.retry, move || client.subscribe(stream)).await?;
        tracing::info!("Subscribed to {} stream", stream);
        Ok(receiver)
    }

    async fn resubscribe(
        &self,
        stream: StreamKind,
        supervisor: &mut StreamSupervisor,
    ) -> Result<mpsc::Receiver<ExchangeEvent>> {
        tokio::time::sleep(self.config.retry.delay_for(0)).await;
        let receiver = self.subscribe(stream).await?;
        supervisor.ping(stream, Instant::now());
        Ok(receiver)
    }

    /// Load enough closed history for every timeframe, then start the strategy
    async fn warm_up(&self, driver: &mut StrategyDriver) -> Result<()> {
        let config = driver.engine().config().clone();
        let base = config.base_timeframe.clone();
        let now = Utc::now();
        let end = if base.is_boundary(now) {
            now
        } else {
            base.bucket_end(now) - base.duration()
        };
        let start = end - config.warmup_duration();

        let client = self.client.as_ref();
        let base_ref = &base;
        let candles =
            with_retry(&self.config.retry, move || client.get_klines(base_ref, start, end)).await?;
        tracing::info!("Warming up with {} {} candles", candles.len(), base);
        for candle in &candles {
            driver.warm_up(candle)?;
        }
        driver.start()
    }
}
