// Venue capability: the async client trait, its normalized events and the transport helpers
pub mod dispatcher;
pub mod rest;
pub mod retry;

pub use dispatcher::CommandDispatcher;
pub use rest::{KlineSource, RestKlineSource};
pub use retry::{with_retry, RateLimitHeadroom, RetryPolicy};

use crate::error::ExchangeError;
use crate::market::Timeframe;
use crate::models::{BookTicker, Candle, Fill, OrderUpdate, PositionSnapshot};
use crate::orders::{Amendment, WorkingOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// The two independently supervised event streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Klines, tickers and top of book
    Public,
    /// Orders, executions, position and wallet
    Private,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Public => write!(f, "public"),
            StreamKind::Private => write!(f, "private"),
        }
    }
}

/// Normalized event delivered by either stream
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeEvent {
    /// A closed base-timeframe candle
    Kline(Candle),
    /// Last traded price
    Ticker(f64),
    BookTicker(BookTicker),
    Order(OrderUpdate),
    Execution(Fill),
    Position(PositionSnapshot),
    Wallet(f64),
    /// Keep-alive with no payload
    Heartbeat,
    /// Unrecoverable transport or venue failure; the runner stops
    Fatal(String),
}

impl ExchangeEvent {
    pub fn stream(&self) -> StreamKind {
        match self {
            ExchangeEvent::Kline(_)
            | ExchangeEvent::Ticker(_)
            | ExchangeEvent::BookTicker(_)
            | ExchangeEvent::Heartbeat => StreamKind::Public,
            _ => StreamKind::Private,
        }
    }
}

/// What the engine consumes from a derivatives venue
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order; returns the venue's order id
    async fn place_order(&self, order: &WorkingOrder) -> ExchangeResult<String>;

    /// `UnknownOrder` (or code 110001) means it already filled or was cancelled
    async fn cancel_order(&self, client_id: &str) -> ExchangeResult<()>;

    async fn cancel_all(&self) -> ExchangeResult<()>;

    async fn amend_order(&self, client_id: &str, amendment: &Amendment) -> ExchangeResult<()>;

    async fn get_position(&self) -> ExchangeResult<PositionSnapshot>;

    async fn get_balance(&self) -> ExchangeResult<f64>;

    /// Closed candles with right-labelled timestamps in `(start, end]`, oldest first
    async fn get_klines(
        &self,
        timeframe: &Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Open (or reopen) one stream. Dropping the receiver ends the subscription.
    async fn subscribe(&self, stream: StreamKind) -> ExchangeResult<mpsc::Receiver<ExchangeEvent>>;
}
