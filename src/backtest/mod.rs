// Historical replay: candle cache, synthetic data, runner and report
pub mod cache;
pub mod metrics;
pub mod runner;
pub mod synthetic;

pub use cache::CandleCache;
pub use metrics::BacktestReport;
pub use runner::BacktestRunner;
pub use synthetic::{MarketScenario, SyntheticDataGenerator};
