use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV bar. `timestamp` is the right edge of the bucket: a candle stamped T covers (T - interval, T].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Fold a later candle into this one (open stays, close moves)
    pub fn merge(&mut self, later: &Candle) {
        self.high = self.high.max(later.high);
        self.low = self.low.min(later.low);
        self.close = later.close;
        self.volume += later.volume;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_long(long: bool) -> Self {
        if long {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    pub fn is_long(self) -> bool {
        self == Side::Buy
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted locally, not yet acknowledged
    Created,
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Triggered,
    Untriggered,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }

    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Created) => false,
            (Created, _) => true,
            (New, PartiallyFilled | Filled | Canceled | Rejected | New) => true,
            (PartiallyFilled, PartiallyFilled | Filled | Canceled | New) => true,
            (Untriggered, Triggered | Canceled | Rejected | Untriggered) => true,
            (Triggered, New | PartiallyFilled | Filled | Canceled | Rejected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Triggered => "TRIGGERED",
            OrderStatus::Untriggered => "UNTRIGGERED",
        };
        write!(f, "{}", s)
    }
}

/// Price source a conditional order triggers on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerBy {
    #[default]
    LastPrice,
    MarkPrice,
    IndexPrice,
}

/// Normalized order status event, from the venue or the simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub client_id: String,
    pub side: Side,
    pub status: OrderStatus,
    pub qty: f64,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderUpdate {
    pub fn remaining_qty(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }

    /// Signed quantity, negative for sells
    pub fn signed_qty(&self) -> f64 {
        self.qty * self.side.sign()
    }
}

/// A single execution against the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub time: DateTime<Utc>,
    pub order_id: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub reduce_only: bool,
}

/// Venue-reported position
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Signed size: positive long, negative short
    pub size: f64,
    pub avg_price: f64,
}

/// Top of book
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    pub best_bid: f64,
    pub best_ask: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_merge() {
        let t = Utc::now();
        let mut c = Candle::new(t, 10.0, 12.0, 9.0, 11.0, 5.0);
        c.merge(&Candle::new(t, 11.0, 13.0, 10.0, 12.0, 4.0));
        assert_eq!(c.open, 10.0);
        assert_eq!(c.high, 13.0);
        assert_eq!(c.low, 9.0);
        assert_eq!(c.close, 12.0);
        assert_eq!(c.volume, 9.0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for status in [OrderStatus::Filled, OrderStatus::Canceled, OrderStatus::Rejected] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(OrderStatus::New));
        }
        assert!(OrderStatus::Created.can_transition_to(OrderStatus::New));
        assert!(OrderStatus::New.can_transition_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Filled));
        assert!(OrderStatus::Untriggered.can_transition_to(OrderStatus::Triggered));
        assert!(OrderStatus::Triggered.can_transition_to(OrderStatus::New));
        assert!(!OrderStatus::New.can_transition_to(OrderStatus::Untriggered));
    }

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::from_long(true), Side::Buy);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.sign(), -1.0);
    }
}
