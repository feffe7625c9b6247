use crate::models::{OrderStatus, OrderUpdate, Side, TriggerBy};
use crate::orders::callback::OrderCallback;
use crate::orders::request::OrderRequest;
use crate::precision::round_to;
use chrono::{DateTime, Duration, Utc};

/// What the engine should do after an iceberg event
#[derive(Debug, Clone)]
pub enum IcebergAction {
    Place(OrderRequest),
    /// Last leg filled; carries the aggregate for the parent callback
    Complete(OrderUpdate),
    /// A leg ended without filling; the remaining legs are dropped
    Abort(OrderUpdate),
}

/// Splits one order into `split` sequential legs. Each leg is placed only after
/// the previous one fills, optionally `interval` later.
#[derive(Debug, Clone)]
pub struct IcebergOrder {
    id: String,
    side: Side,
    qty: f64,
    leg_qty: f64,
    split: u32,
    interval: Duration,
    limit: Option<f64>,
    stop: Option<f64>,
    post_only: bool,
    reduce_only: bool,
    trigger_by: TriggerBy,
    decimals: u32,
    placed: u32,
    filled_qty: f64,
    notional: f64,
    next_due: Option<DateTime<Utc>>,
    callback: Option<OrderCallback>,
    created_at: DateTime<Utc>,
    done: bool,
}

impl IcebergOrder {
    pub fn new(request: &OrderRequest, qty: f64, decimals: u32, now: DateTime<Utc>) -> Self {
        let split = request.split.max(1);
        Self {
            id: request.id.clone(),
            side: request.side,
            qty,
            leg_qty: round_to(qty / split as f64, decimals),
            split,
            interval: request.interval,
            limit: request.limit,
            stop: request.stop,
            post_only: request.post_only,
            reduce_only: request.reduce_only,
            trigger_by: request.trigger_by,
            decimals,
            placed: 0,
            filled_qty: 0.0,
            notional: 0.0,
            next_due: None,
            callback: request.callback.clone(),
            created_at: now,
            done: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn callback(&self) -> Option<&OrderCallback> {
        self.callback.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn legs_placed(&self) -> u32 {
        self.placed
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.next_due
    }

    /// Quantity of leg `n` (1-based); the last leg absorbs the rounding remainder
    pub fn leg_qty(&self, n: u32) -> f64 {
        if n >= self.split {
            round_to(
                self.qty - self.leg_qty * (self.split - 1) as f64,
                self.decimals,
            )
        } else {
            self.leg_qty
        }
    }

    /// First leg; only this one carries the stop
    pub fn start(&mut self) -> OrderRequest {
        self.next_leg()
    }

    fn next_leg(&mut self) -> OrderRequest {
        self.placed += 1;
        let n = self.placed;
        let mut leg = OrderRequest::new(format!("{}_sub{}", self.id, n), self.side, self.leg_qty(n))
            .post_only(self.post_only)
            .reduce_only(self.reduce_only)
            .with_trigger_by(self.trigger_by);
        leg.limit = self.limit;
        if n == 1 {
            leg.stop = self.stop;
        }
        leg
    }

    /// Feed a terminal or progress update for one of this iceberg's legs
    pub fn on_leg_update(&mut self, update: &OrderUpdate, now: DateTime<Utc>) -> Vec<IcebergAction> {
        if self.done {
            return Vec::new();
        }

        match update.status {
            OrderStatus::Filled => {
                self.filled_qty += update.filled_qty;
                self.notional += update.filled_qty * update.avg_fill_price;
                tracing::info!(
                    "Split order {} - filled {}/{}",
                    self.id,
                    self.placed,
                    self.split
                );

                if self.placed >= self.split {
                    tracing::info!("Split order {} - all legs filled", self.id);
                    self.done = true;
                    return vec![IcebergAction::Complete(self.aggregate(OrderStatus::Filled, now))];
                }

                if self.interval <= Duration::zero() {
                    vec![IcebergAction::Place(self.next_leg())]
                } else {
                    self.next_due = Some(now + self.interval);
                    Vec::new()
                }
            }
            OrderStatus::Canceled | OrderStatus::Rejected => {
                self.filled_qty += update.filled_qty;
                self.notional += update.filled_qty * update.avg_fill_price;
                tracing::warn!(
                    "Split order {} - leg {} ended {}; dropping remaining legs",
                    self.id,
                    update.client_id,
                    update.status
                );
                self.done = true;
                vec![IcebergAction::Abort(self.aggregate(update.status, now))]
            }
            _ => Vec::new(),
        }
    }

    /// Release a leg held back by the split interval
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> Option<IcebergAction> {
        match self.next_due {
            Some(due) if !self.done && now >= due => {
                self.next_due = None;
                Some(IcebergAction::Place(self.next_leg()))
            }
            _ => None,
        }
    }

    /// Stop before the next leg; the caller cancels whatever leg is live
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Option<OrderUpdate> {
        if self.done {
            return None;
        }
        self.done = true;
        self.next_due = None;
        Some(self.aggregate(OrderStatus::Canceled, now))
    }

    fn aggregate(&self, status: OrderStatus, now: DateTime<Utc>) -> OrderUpdate {
        OrderUpdate {
            client_id: self.id.clone(),
            side: self.side,
            status,
            qty: self.qty,
            filled_qty: round_to(self.filled_qty, self.decimals),
            avg_fill_price: if self.filled_qty > 0.0 {
                self.notional / self.filled_qty
            } else {
                0.0
            },
            limit_price: self.limit,
            stop_price: self.stop,
            reduce_only: self.reduce_only,
            post_only: self.post_only,
            reject_reason: None,
            created_at: self.created_at,
            updated_at: now,
        }
    }
}
