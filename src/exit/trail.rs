use std::collections::VecDeque;

/// Candles of entry history kept for take-profit deferral
pub const ENTRY_HISTORY_DEPTH: usize = 3;

/// Trailing-stop ratchet. Only ever moves in the position's favour.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrailState {
    price: f64,
}

impl TrailState {
    pub fn price(&self) -> f64 {
        self.price
    }

    /// Restart from `price` (called whenever the position changes)
    pub fn reset(&mut self, price: f64) {
        self.price = price;
    }

    /// Raise for longs when the bar's low clears the ratchet; lower for shorts on the high
    pub fn ratchet(&mut self, position: f64, low: f64, high: f64) {
        if position > 0.0 && low > self.price {
            self.price = low;
        } else if position < 0.0 && high < self.price {
            self.price = high;
        }
    }

    /// Price at which a retrace of `offset` from the ratchet triggers
    pub fn trigger_price(&self, position: f64, offset: f64) -> Option<f64> {
        if offset <= 0.0 || self.price <= 0.0 || position == 0.0 {
            return None;
        }
        Some(if position > 0.0 {
            self.price - offset
        } else {
            self.price + offset
        })
    }

    pub fn is_triggered(&self, position: f64, offset: f64, market_price: f64) -> bool {
        match self.trigger_price(position, offset) {
            Some(trigger) if position > 0.0 => market_price < trigger,
            Some(trigger) => market_price > trigger,
            None => false,
        }
    }
}

/// Whether each of the last few strategy ticks opened a position
#[derive(Debug, Clone, Default)]
pub struct EntryHistory {
    ticks: VecDeque<bool>,
}

impl EntryHistory {
    pub fn record(&mut self, entered: bool) {
        if self.ticks.len() == ENTRY_HISTORY_DEPTH {
            self.ticks.pop_front();
        }
        self.ticks.push_back(entered);
    }

    /// Entry on the tick before the latest one
    pub fn entered_previous_candle(&self) -> bool {
        self.ticks.len() >= 2 && self.ticks[self.ticks.len() - 2]
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}
