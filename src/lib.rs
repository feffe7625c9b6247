// Core modules
pub mod backend;
pub mod backtest;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod exit;
pub mod indicators;
pub mod ledger;
pub mod market;
pub mod models;
pub mod orders;
pub mod precision;
pub mod strategy;

// Re-export commonly used types
pub use config::{AppConfig, EngineConfig};
pub use engine::{StrategyDriver, TradingEngine};
pub use error::{EngineError, ExchangeError};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, EngineError>;
