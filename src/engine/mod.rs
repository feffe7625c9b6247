// Trading engine: strategy API, per-bar hook pipeline, candle driver and live event loop
pub mod driver;
pub mod hooks;
pub mod live;
pub mod supervisor;
pub mod trading;

pub use driver::{Invocation, StrategyDriver};
pub use hooks::{Hook, HookPipeline};
pub use live::LiveRunner;
pub use supervisor::StreamSupervisor;
pub use trading::{PlotSeries, TradingEngine, CLOSE_ID};
