use crate::backend::{BackendKind, ExecutionBackend, MarketContext};
use crate::error::ExchangeError;
use crate::models::{Candle, OrderStatus, OrderUpdate};
use crate::orders::registry::POST_ONLY_CROSS_REASON;
use crate::orders::{Amendment, OrderKind, TriggerDirection, WorkingOrder};
use crate::Result;
use chrono::{DateTime, Utc};

const REDUCE_ONLY_REASON: &str = "reduce-only order would not reduce position";

#[derive(Debug, Clone)]
struct Resting {
    order: WorkingOrder,
    triggered: bool,
}

/// Fills orders against OHLC bars. Orders submitted on a bar are first matched on the next one.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    resting: Vec<Resting>,
    pending: Vec<OrderUpdate>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resting_count(&self) -> usize {
        self.resting.len()
    }

    /// Fill (or cancel) `order` for `qty` at `price`, honouring reduce-only against `position`.
    /// Returns the signed quantity that changed hands.
    fn execute(
        order: &WorkingOrder,
        price: f64,
        position: f64,
        at: DateTime<Utc>,
        out: &mut Vec<OrderUpdate>,
    ) -> f64 {
        let mut qty = order.qty;
        if order.reduce_only {
            let reduces = position != 0.0 && (position > 0.0) != order.side.is_long();
            if !reduces {
                let mut update = order.update(OrderStatus::Canceled, 0.0, 0.0, at);
                update.reject_reason = Some(REDUCE_ONLY_REASON.to_string());
                out.push(update);
                return 0.0;
            }
            qty = qty.min(position.abs());
        }
        out.push(order.update(OrderStatus::Filled, qty, price, at));
        qty * order.side.sign()
    }

    fn crosses(order: &WorkingOrder, price: f64, market: &MarketContext) -> bool {
        let (bid, ask) = if market.book.is_ready() {
            (market.book.best_bid(), market.book.best_ask())
        } else {
            (market.price, market.price)
        };
        if order.side.is_long() {
            price > ask
        } else {
            price < bid
        }
    }

    fn triggered(direction: TriggerDirection, stop: f64, bar: &Candle) -> bool {
        match direction {
            TriggerDirection::Rise => bar.high >= stop,
            TriggerDirection::Fall => bar.low <= stop,
        }
    }

    /// A gapped bar fills the stop at the open
    fn stop_fill_price(direction: TriggerDirection, stop: f64, bar: &Candle) -> f64 {
        match direction {
            TriggerDirection::Rise => stop.max(bar.open),
            TriggerDirection::Fall => stop.min(bar.open),
        }
    }

    fn limit_touched(order: &WorkingOrder, price: f64, bar: &Candle) -> bool {
        if order.side.is_long() {
            bar.low <= price
        } else {
            bar.high >= price
        }
    }
}

impl ExecutionBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn submit(&mut self, order: WorkingOrder, market: &MarketContext) -> Result<()> {
        let at = market.time;
        match order.kind {
            OrderKind::Market => {
                self.pending.push(order.update(OrderStatus::New, 0.0, 0.0, at));
                Self::execute(&order, market.price, market.position, at, &mut self.pending);
            }
            OrderKind::PostOnlyLimit { price } if Self::crosses(&order, price, market) => {
                let mut update = order.update(OrderStatus::Rejected, 0.0, 0.0, at);
                update.reject_reason = Some(POST_ONLY_CROSS_REASON.to_string());
                tracing::debug!("Post-only {} at {} would cross; rejected", order.client_id, price);
                self.pending.push(update);
            }
            OrderKind::Limit { price } if Self::crosses(&order, price, market) => {
                // Marketable limit takes liquidity at the current price
                self.pending.push(order.update(OrderStatus::New, 0.0, 0.0, at));
                Self::execute(&order, market.price, market.position, at, &mut self.pending);
            }
            OrderKind::Limit { .. } | OrderKind::PostOnlyLimit { .. } => {
                self.pending.push(order.update(OrderStatus::New, 0.0, 0.0, at));
                self.resting.push(Resting {
                    order,
                    triggered: false,
                });
            }
            OrderKind::StopMarket { .. } | OrderKind::StopLimit { .. } => {
                self.pending
                    .push(order.update(OrderStatus::Untriggered, 0.0, 0.0, at));
                self.resting.push(Resting {
                    order,
                    triggered: false,
                });
            }
        }
        Ok(())
    }

    fn cancel(&mut self, client_id: &str) -> Result<()> {
        let idx = self
            .resting
            .iter()
            .position(|r| r.order.client_id == client_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(client_id.to_string()))?;
        let resting = self.resting.remove(idx);
        self.pending.push(resting.order.update(
            OrderStatus::Canceled,
            0.0,
            0.0,
            resting.order.created_at,
        ));
        Ok(())
    }

    fn cancel_all(&mut self) -> Result<()> {
        for resting in self.resting.drain(..) {
            self.pending.push(resting.order.update(
                OrderStatus::Canceled,
                0.0,
                0.0,
                resting.order.created_at,
            ));
        }
        Ok(())
    }

    fn amend(&mut self, client_id: &str, amendment: &Amendment) -> Result<()> {
        let resting = self
            .resting
            .iter_mut()
            .find(|r| r.order.client_id == client_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(client_id.to_string()))?;
        resting.order.apply_amendment(amendment);
        Ok(())
    }

    fn evaluate_bar(&mut self, bar: &Candle, position: f64) -> Vec<OrderUpdate> {
        let mut updates = Vec::new();
        let mut position = position;
        let at = bar.timestamp;

        // Conditional orders first
        let mut remaining = Vec::with_capacity(self.resting.len());
        for mut resting in std::mem::take(&mut self.resting) {
            let fired = match resting.order.kind {
                OrderKind::StopMarket { stop, direction } if !resting.triggered => {
                    if Self::triggered(direction, stop, bar) {
                        updates.push(resting.order.update(OrderStatus::Triggered, 0.0, 0.0, at));
                        let price = Self::stop_fill_price(direction, stop, bar);
                        position += Self::execute(&resting.order, price, position, at, &mut updates);
                        true
                    } else {
                        false
                    }
                }
                OrderKind::StopLimit {
                    stop, direction, ..
                } if !resting.triggered => {
                    if Self::triggered(direction, stop, bar) {
                        updates.push(resting.order.update(OrderStatus::Triggered, 0.0, 0.0, at));
                        resting.triggered = true;
                    }
                    false
                }
                _ => false,
            };
            if !fired {
                remaining.push(resting);
            }
        }

        // Then resting limits, including stop-limits triggered on an earlier bar
        let mut still_resting = Vec::with_capacity(remaining.len());
        for resting in remaining {
            let limit = match resting.order.kind {
                OrderKind::Limit { price } | OrderKind::PostOnlyLimit { price } => Some(price),
                OrderKind::StopLimit { price, .. } if resting.triggered => {
                    // Triggered on this very bar: rest until the next one
                    if updates.iter().any(|u| {
                        u.client_id == resting.order.client_id && u.status == OrderStatus::Triggered
                    }) {
                        None
                    } else {
                        Some(price)
                    }
                }
                _ => None,
            };
            match limit {
                Some(price) if Self::limit_touched(&resting.order, price, bar) => {
                    position += Self::execute(&resting.order, price, position, at, &mut updates);
                }
                _ => still_resting.push(resting),
            }
        }
        self.resting = still_resting;

        updates
    }

    fn drain_updates(&mut self) -> Vec<OrderUpdate> {
        std::mem::take(&mut self.pending)
    }
}
