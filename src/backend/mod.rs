// Where orders go: OHLC-matched simulation or the live venue
pub mod live;
pub mod simulated;

pub use live::{BackendCommand, LiveBackend};
pub use simulated::SimulatedBackend;

use crate::market::OrderBookL1;
use crate::models::{Candle, OrderUpdate};
use crate::orders::{Amendment, WorkingOrder};
use crate::Result;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Simulated,
    Live,
}

/// Market state at the moment an order is submitted
#[derive(Debug, Clone, Copy)]
pub struct MarketContext {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub position: f64,
    pub book: OrderBookL1,
}

/// Execution capability the engine is built on. Live and simulated trading share
/// everything above this seam.
pub trait ExecutionBackend: Send {
    fn kind(&self) -> BackendKind;

    fn submit(&mut self, order: WorkingOrder, market: &MarketContext) -> Result<()>;

    /// Unknown ids surface as a benign `ExchangeError::UnknownOrder`
    fn cancel(&mut self, client_id: &str) -> Result<()>;

    fn cancel_all(&mut self) -> Result<()>;

    fn amend(&mut self, client_id: &str, amendment: &Amendment) -> Result<()>;

    /// Match resting orders against a closed bar (simulation only)
    fn evaluate_bar(&mut self, _bar: &Candle, _position: f64) -> Vec<OrderUpdate> {
        Vec::new()
    }

    /// Updates produced synchronously by the calls above
    fn drain_updates(&mut self) -> Vec<OrderUpdate> {
        Vec::new()
    }
}
