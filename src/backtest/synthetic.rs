use crate::market::Timeframe;
use crate::models::Candle;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Price path shapes for synthetic runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Mean-reverting chop around the start price
    Sideways,
    /// Large swings, up to ±5% per candle
    Volatile,
    /// Sideways with a missing candle every 50
    WithGaps,
}

impl FromStr for MarketScenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uptrend" => Ok(Self::Uptrend),
            "downtrend" => Ok(Self::Downtrend),
            "sideways" => Ok(Self::Sideways),
            "volatile" => Ok(Self::Volatile),
            "withgaps" | "with_gaps" | "gaps" => Ok(Self::WithGaps),
            other => Err(format!("unknown scenario '{}'", other)),
        }
    }
}

/// Seeded candle generator; the same seed and arguments give the same series
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
    start: DateTime<Utc>,
}

impl SyntheticDataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 100.0,
            base_volume: 1_000.0,
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
        }
    }

    pub fn with_base_price(mut self, price: f64) -> Self {
        self.base_price = price;
        self
    }

    /// First candle closes one interval after `start`
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Continuous candles (each opens at the previous close), right-labelled on
    /// `timeframe` boundaries
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_candles: usize,
        timeframe: &Timeframe,
    ) -> Vec<Candle> {
        let step = timeframe.duration();
        let first_close = timeframe.bucket_end(self.start);
        let first_close = if first_close == self.start {
            first_close + step
        } else {
            first_close
        };
        let per_day = (24 * 60) as f64 / timeframe.minutes() as f64;

        let mut candles = Vec::with_capacity(num_candles);
        let mut price = self.base_price;
        let mut slot: i32 = 0;

        for i in 0..num_candles {
            if scenario == MarketScenario::WithGaps && i % 50 == 49 {
                slot += 1;
            }
            let timestamp = first_close + step * slot;
            slot += 1;

            let change = match scenario {
                MarketScenario::Uptrend => {
                    price * (0.02 / per_day + self.rng.gen_range(-0.001..0.001))
                }
                MarketScenario::Downtrend => {
                    price * (-0.02 / per_day + self.rng.gen_range(-0.001..0.001))
                }
                MarketScenario::Sideways | MarketScenario::WithGaps => {
                    (self.base_price - price) * 0.1 + price * self.rng.gen_range(-0.01..0.01)
                }
                MarketScenario::Volatile => price * self.rng.gen_range(-0.05..0.05),
            };
            let open = price;
            // Floor so a long volatile run never reaches zero
            price = (price + change).max(self.base_price * 0.2);

            candles.push(self.create_candle(timestamp, open, price));
        }

        candles
    }

    fn create_candle(&mut self, timestamp: DateTime<Utc>, open: f64, close: f64) -> Candle {
        let wick = 0.002;
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..wick));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..wick));
        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);
        Candle::new(timestamp, open, high, low, close, volume)
    }
}
