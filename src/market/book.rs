use crate::models::BookTicker;

/// Which side of the book moved on the last update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookChange {
    pub bid_changed: bool,
    pub ask_changed: bool,
}

impl BookChange {
    pub fn any(&self) -> bool {
        self.bid_changed || self.ask_changed
    }

    /// Whether the side a chaser on `long` is pegged to moved
    pub fn touches(&self, long: bool) -> bool {
        if long {
            self.bid_changed
        } else {
            self.ask_changed
        }
    }
}

/// Best bid/ask as last reported
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OrderBookL1 {
    ticker: BookTicker,
}

impl OrderBookL1 {
    pub fn best_bid(&self) -> f64 {
        self.ticker.best_bid
    }

    pub fn best_ask(&self) -> f64 {
        self.ticker.best_ask
    }

    pub fn is_ready(&self) -> bool {
        self.ticker.best_bid > 0.0 && self.ticker.best_ask > 0.0
    }

    /// Price a passive order on `long` side would join at
    pub fn passive_price(&self, long: bool) -> f64 {
        if long {
            self.ticker.best_bid
        } else {
            self.ticker.best_ask
        }
    }

    /// Apply a new top of book; zero prices keep the previous level
    pub fn update(&mut self, ticker: BookTicker) -> BookChange {
        let mut change = BookChange::default();
        if ticker.best_bid > 0.0 && ticker.best_bid != self.ticker.best_bid {
            self.ticker.best_bid = ticker.best_bid;
            change.bid_changed = true;
        }
        if ticker.best_ask > 0.0 && ticker.best_ask != self.ticker.best_ask {
            self.ticker.best_ask = ticker.best_ask;
            change.ask_changed = true;
        }
        change
    }
}
