// Candle resampling and market state
pub mod aggregator;
pub mod book;
pub mod integrity;
pub mod timeframe;

pub use aggregator::{CandleAggregator, ClosedCandleUpdate, Ohlcv, TimeframeOrder, TimeframeState};
pub use book::{BookChange, OrderBookL1};
pub use integrity::{check_candles, CandleValidator, IntegrityReport};
pub use timeframe::{Timeframe, ALLOWED_TIMEFRAMES};
