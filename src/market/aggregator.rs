use crate::error::EngineError;
use crate::market::timeframe::Timeframe;
use crate::models::Candle;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Evaluation order when several timeframes close on the same base tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeOrder {
    Ascending,
    #[default]
    Descending,
}

/// Column arrays handed to the strategy, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub timestamps: Vec<DateTime<Utc>>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl Ohlcv {
    pub fn from_candles<'a>(candles: impl IntoIterator<Item = &'a Candle>) -> Self {
        let mut out = Ohlcv::default();
        for c in candles {
            out.timestamps.push(c.timestamp);
            out.open.push(c.open);
            out.high.push(c.high);
            out.low.push(c.low);
            out.close.push(c.close);
            out.volume.push(c.volume);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.last().copied()
    }
}

/// A timeframe that just closed a candle and has a full history window
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandleUpdate {
    pub timeframe: Timeframe,
    pub candle: Candle,
    pub window: Ohlcv,
}

/// Resampled series for one timeframe
#[derive(Debug, Clone)]
pub struct TimeframeState {
    timeframe: Timeframe,
    window: VecDeque<Candle>,
    partial: Option<Candle>,
    last_action_time: Option<DateTime<Utc>>,
    ohlcv_len: usize,
}

impl TimeframeState {
    fn new(timeframe: Timeframe, ohlcv_len: usize) -> Self {
        Self {
            timeframe,
            window: VecDeque::with_capacity(ohlcv_len + 1),
            partial: None,
            last_action_time: None,
            ohlcv_len,
        }
    }

    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    /// The bucket currently forming; never shown to the strategy
    pub fn partial(&self) -> Option<&Candle> {
        self.partial.as_ref()
    }

    pub fn last_action_time(&self) -> Option<DateTime<Utc>> {
        self.last_action_time
    }

    pub fn closed_count(&self) -> usize {
        self.window.len()
    }

    pub fn is_warm(&self) -> bool {
        self.window.len() >= self.ohlcv_len
    }

    pub fn window(&self) -> Ohlcv {
        Ohlcv::from_candles(self.window.iter())
    }

    /// Fold one base candle in; returns the candles this tick closed, oldest first
    fn ingest(&mut self, base: &Candle) -> Vec<Candle> {
        let mut closed = Vec::new();
        let bucket = self.timeframe.bucket_end(base.timestamp);

        // A gap can leave a stale bucket open; it is complete as far as data goes
        if let Some(partial) = &self.partial {
            if partial.timestamp != bucket {
                if let Some(c) = self.close_partial() {
                    closed.push(c);
                }
            }
        }

        match &mut self.partial {
            Some(partial) => partial.merge(base),
            None => {
                let mut fresh = base.clone();
                fresh.timestamp = bucket;
                self.partial = Some(fresh);
            }
        }

        if base.timestamp == bucket {
            if let Some(c) = self.close_partial() {
                closed.push(c);
            }
        }

        closed
    }

    fn close_partial(&mut self) -> Option<Candle> {
        let candle = self.partial.take()?;
        self.window.push_back(candle.clone());
        while self.window.len() > self.ohlcv_len {
            self.window.pop_front();
        }
        Some(candle)
    }

    /// Hand out the update for `candle` unless the strategy already saw it or history is short
    fn take_due(&mut self, candle: Candle) -> Option<ClosedCandleUpdate> {
        if !self.is_warm() || self.last_action_time == Some(candle.timestamp) {
            return None;
        }
        self.last_action_time = Some(candle.timestamp);
        Some(ClosedCandleUpdate {
            timeframe: self.timeframe.clone(),
            candle,
            window: self.window(),
        })
    }
}

/// Resamples base candles into every configured timeframe
pub struct CandleAggregator {
    base: Timeframe,
    states: Vec<TimeframeState>,
    order: TimeframeOrder,
    last_base: Option<DateTime<Utc>>,
    missing_candles: usize,
}

impl CandleAggregator {
    /// # Arguments
    /// * `base` - Interval of the candles fed to `ingest`
    /// * `timeframes` - Resampled series to maintain; each must be a multiple of `base`
    /// * `ohlcv_len` - Closed candles required (and exposed) per timeframe
    pub fn new(
        base: Timeframe,
        timeframes: &[Timeframe],
        ohlcv_len: usize,
        order: TimeframeOrder,
    ) -> Result<Self> {
        if ohlcv_len == 0 {
            return Err(EngineError::Config("ohlcv_len must be at least 1".to_string()));
        }
        if timeframes.is_empty() {
            return Err(EngineError::Config("no timeframes configured".to_string()));
        }

        let mut states: Vec<TimeframeState> = Vec::with_capacity(timeframes.len());
        for tf in timeframes {
            if !tf.is_multiple_of(&base) {
                return Err(EngineError::Config(format!(
                    "timeframe {} is not a multiple of base {}",
                    tf, base
                )));
            }
            if states.iter().any(|s| s.timeframe == *tf) {
                continue;
            }
            states.push(TimeframeState::new(tf.clone(), ohlcv_len));
        }

        match order {
            TimeframeOrder::Ascending => states.sort_by_key(|s| s.timeframe.minutes()),
            TimeframeOrder::Descending => {
                states.sort_by_key(|s| std::cmp::Reverse(s.timeframe.minutes()))
            }
        }

        Ok(Self {
            base,
            states,
            order,
            last_base: None,
            missing_candles: 0,
        })
    }

    pub fn base(&self) -> &Timeframe {
        &self.base
    }

    pub fn order(&self) -> TimeframeOrder {
        self.order
    }

    /// Timeframes in evaluation order
    pub fn timeframes(&self) -> Vec<&Timeframe> {
        self.states.iter().map(|s| &s.timeframe).collect()
    }

    pub fn state(&self, timeframe: &str) -> Option<&TimeframeState> {
        self.states.iter().find(|s| s.timeframe.label() == timeframe)
    }

    pub fn partial_candle(&self, timeframe: &str) -> Option<&Candle> {
        self.state(timeframe).and_then(|s| s.partial())
    }

    pub fn last_base_timestamp(&self) -> Option<DateTime<Utc>> {
        self.last_base
    }

    /// Base candles skipped over so far
    pub fn missing_candles(&self) -> usize {
        self.missing_candles
    }

    /// Feed one closed base candle. Returns the timeframes that became due, in evaluation order.
    pub fn ingest(&mut self, candle: &Candle) -> Result<Vec<ClosedCandleUpdate>> {
        self.ingest_inner(candle, true)
    }

    /// Feed history without marking anything as seen by the strategy
    pub fn warm_up(&mut self, candle: &Candle) -> Result<()> {
        self.ingest_inner(candle, false).map(|_| ())
    }

    fn ingest_inner(&mut self, candle: &Candle, emit: bool) -> Result<Vec<ClosedCandleUpdate>> {
        if !self.base.is_boundary(candle.timestamp) {
            return Err(EngineError::DataIntegrity(format!(
                "base candle at {} is not aligned to {}",
                candle.timestamp, self.base
            )));
        }

        if let Some(last) = self.last_base {
            if candle.timestamp <= last {
                return Err(EngineError::DataIntegrity(format!(
                    "base candle at {} does not advance past {}",
                    candle.timestamp, last
                )));
            }
            let step = (candle.timestamp - last).num_seconds() / self.base.seconds();
            if step > 1 {
                self.missing_candles += (step - 1) as usize;
                tracing::warn!(
                    "Gap in base candles: {} missing between {} and {}",
                    step - 1,
                    last,
                    candle.timestamp
                );
            }
        }
        self.last_base = Some(candle.timestamp);

        let mut updates = Vec::new();
        for state in self.states.iter_mut() {
            for closed in state.ingest(candle) {
                if !emit {
                    continue;
                }
                if let Some(update) = state.take_due(closed) {
                    updates.push(update);
                }
            }
        }

        Ok(updates)
    }

    /// Latest closed candle of every warm timeframe the strategy has not seen yet
    pub fn due_on_start(&mut self) -> Vec<ClosedCandleUpdate> {
        let mut updates = Vec::new();
        for state in self.states.iter_mut() {
            if let Some(last) = state.window.back().cloned() {
                if let Some(update) = state.take_due(last) {
                    updates.push(update);
                }
            }
        }
        updates
    }
}
