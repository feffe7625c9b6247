use crate::market::OrderBookL1;
use crate::models::{OrderStatus, OrderUpdate, Side, TriggerBy};
use crate::orders::callback::OrderCallback;
use chrono::{DateTime, Duration, Utc};

/// Default bound on chaser re-quotes
pub const DEFAULT_RETRY_MAKER: u32 = 100;

/// A strategy's order intent, before routing to a direct, iceberg or chaser execution
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub id: String,
    pub side: Side,
    pub qty: f64,
    pub limit: Option<f64>,
    pub stop: Option<f64>,
    pub post_only: bool,
    pub reduce_only: bool,
    pub trigger_by: TriggerBy,
    pub split: u32,
    pub interval: Duration,
    pub chaser: bool,
    pub retry_maker: u32,
    pub callback: Option<OrderCallback>,
    pub when: bool,
    pub round_decimals: Option<u32>,
}

impl OrderRequest {
    /// Market order unless a limit or stop is added
    pub fn new(id: impl Into<String>, side: Side, qty: f64) -> Self {
        Self {
            id: id.into(),
            side,
            qty,
            limit: None,
            stop: None,
            post_only: false,
            reduce_only: false,
            trigger_by: TriggerBy::default(),
            split: 1,
            interval: Duration::zero(),
            chaser: false,
            retry_maker: DEFAULT_RETRY_MAKER,
            callback: None,
            when: true,
            round_decimals: None,
        }
    }

    pub fn long(id: impl Into<String>, qty: f64) -> Self {
        Self::new(id, Side::Buy, qty)
    }

    pub fn short(id: impl Into<String>, qty: f64) -> Self {
        Self::new(id, Side::Sell, qty)
    }

    /// Zero or negative prices mean "no limit"
    pub fn with_limit(mut self, price: f64) -> Self {
        self.limit = (price > 0.0).then_some(price);
        self
    }

    pub fn with_stop(mut self, price: f64) -> Self {
        self.stop = (price > 0.0).then_some(price);
        self
    }

    pub fn post_only(mut self, post_only: bool) -> Self {
        self.post_only = post_only;
        self
    }

    pub fn reduce_only(mut self, reduce_only: bool) -> Self {
        self.reduce_only = reduce_only;
        self
    }

    pub fn with_trigger_by(mut self, trigger_by: TriggerBy) -> Self {
        self.trigger_by = trigger_by;
        self
    }

    /// Iceberg: `split` sequential legs, `interval` apart
    pub fn with_split(mut self, split: u32, interval: Duration) -> Self {
        self.split = split.max(1);
        self.interval = interval;
        self
    }

    pub fn with_chaser(mut self, chaser: bool, retry_maker: u32) -> Self {
        self.chaser = chaser;
        self.retry_maker = retry_maker;
        self
    }

    pub fn with_callback(mut self, callback: OrderCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn when(mut self, when: bool) -> Self {
        self.when = when;
        self
    }

    pub fn with_round_decimals(mut self, decimals: u32) -> Self {
        self.round_decimals = Some(decimals);
        self
    }
}

/// Direction the trigger price must be crossed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDirection {
    Rise,
    Fall,
}

impl TriggerDirection {
    pub fn for_stop(stop: f64, market_price: f64) -> Self {
        if stop > market_price {
            TriggerDirection::Rise
        } else {
            TriggerDirection::Fall
        }
    }
}

/// Venue order type, chosen from the request's flags
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
    PostOnlyLimit { price: f64 },
    StopMarket { stop: f64, direction: TriggerDirection },
    StopLimit { stop: f64, price: f64, direction: TriggerDirection },
}

impl OrderKind {
    /// First match wins: post-only limit, stop-limit, limit, stop-market, pegged post-only, market
    pub fn select(
        limit: Option<f64>,
        stop: Option<f64>,
        post_only: bool,
        side: Side,
        market_price: f64,
        book: &OrderBookL1,
    ) -> OrderKind {
        match (limit, stop) {
            (Some(price), _) if post_only => OrderKind::PostOnlyLimit { price },
            (Some(price), Some(stop)) => OrderKind::StopLimit {
                stop,
                price,
                direction: TriggerDirection::for_stop(stop, market_price),
            },
            (Some(price), None) => OrderKind::Limit { price },
            (None, Some(stop)) => OrderKind::StopMarket {
                stop,
                direction: TriggerDirection::for_stop(stop, market_price),
            },
            (None, None) if post_only => {
                let peg = book.passive_price(side.is_long());
                OrderKind::PostOnlyLimit {
                    price: if peg > 0.0 { peg } else { market_price },
                }
            }
            (None, None) => OrderKind::Market,
        }
    }

    pub fn limit_price(&self) -> Option<f64> {
        match self {
            OrderKind::Limit { price }
            | OrderKind::PostOnlyLimit { price }
            | OrderKind::StopLimit { price, .. } => Some(*price),
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<f64> {
        match self {
            OrderKind::StopMarket { stop, .. } | OrderKind::StopLimit { stop, .. } => Some(*stop),
            _ => None,
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.stop_price().is_some()
    }

    pub fn is_post_only(&self) -> bool {
        matches!(self, OrderKind::PostOnlyLimit { .. })
    }

    /// Same order type with new prices; a price the type does not carry is ignored
    pub fn amended(self, limit: Option<f64>, stop: Option<f64>) -> OrderKind {
        match self {
            OrderKind::Limit { price } => OrderKind::Limit {
                price: limit.unwrap_or(price),
            },
            OrderKind::PostOnlyLimit { price } => OrderKind::PostOnlyLimit {
                price: limit.unwrap_or(price),
            },
            OrderKind::StopMarket { stop: s, direction } => OrderKind::StopMarket {
                stop: stop.unwrap_or(s),
                direction,
            },
            OrderKind::StopLimit {
                stop: s,
                price,
                direction,
            } => OrderKind::StopLimit {
                stop: stop.unwrap_or(s),
                price: limit.unwrap_or(price),
                direction,
            },
            OrderKind::Market => OrderKind::Market,
        }
    }
}

/// Changes to a resting order
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Amendment {
    pub qty: Option<f64>,
    pub limit: Option<f64>,
    pub stop: Option<f64>,
}

impl Amendment {
    pub fn is_empty(&self) -> bool {
        self.qty.is_none() && self.limit.is_none() && self.stop.is_none()
    }
}

/// An order as transmitted to a backend
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingOrder {
    pub client_id: String,
    pub side: Side,
    pub qty: f64,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub trigger_by: TriggerBy,
    pub created_at: DateTime<Utc>,
}

impl WorkingOrder {
    pub fn apply_amendment(&mut self, amendment: &Amendment) {
        if let Some(qty) = amendment.qty {
            self.qty = qty;
        }
        self.kind = self.kind.amended(amendment.limit, amendment.stop);
    }

    /// Status update for this order with the given fill state
    pub fn update(
        &self,
        status: OrderStatus,
        filled_qty: f64,
        avg_fill_price: f64,
        at: DateTime<Utc>,
    ) -> OrderUpdate {
        OrderUpdate {
            client_id: self.client_id.clone(),
            side: self.side,
            status,
            qty: self.qty,
            filled_qty,
            avg_fill_price,
            limit_price: self.kind.limit_price(),
            stop_price: self.kind.stop_price(),
            reduce_only: self.reduce_only,
            post_only: self.kind.is_post_only(),
            reject_reason: None,
            created_at: self.created_at,
            updated_at: at,
        }
    }
}
