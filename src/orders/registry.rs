use crate::models::{OrderStatus, OrderUpdate};
use crate::orders::callback::OrderCallback;
use crate::orders::request::{Amendment, WorkingOrder};
use std::collections::HashMap;

/// Venue cancel reason for a post-only order that would have crossed
pub const POST_ONLY_CROSS_REASON: &str = "EC_PostOnlyWillTakeLiquidity";

/// A cancel this soon after creation with the cross reason is really a rejection
pub const POST_ONLY_RACE_WINDOW_MS: i64 = 25;

/// Who gets told about updates to an order
#[derive(Debug, Clone)]
pub enum OrderHandler {
    Direct(Option<OrderCallback>),
    IcebergLeg { parent: String },
    ChaserLeg { chaser: String },
}

#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order: WorkingOrder,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    seq: u64,
}

impl TrackedOrder {
    /// Signed remaining quantity, negative for sells
    pub fn signed_qty(&self) -> f64 {
        self.order.qty * self.order.side.sign()
    }
}

/// What an update means once applied
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub update: OrderUpdate,
    pub handler: OrderHandler,
    pub terminal: bool,
    /// Quantity filled by this update alone
    pub fill_qty: f64,
    /// Price of that incremental quantity
    pub fill_price: f64,
}

/// Every order the engine has in flight, keyed by client id.
/// Entries leave exactly once, when their order reaches a terminal state.
#[derive(Default)]
pub struct OrderRegistry {
    entries: HashMap<String, (TrackedOrder, OrderHandler)>,
    next_seq: u64,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, order: WorkingOrder, handler: OrderHandler) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = order.client_id.clone();
        let tracked = TrackedOrder {
            order,
            status: OrderStatus::Created,
            filled_qty: 0.0,
            avg_fill_price: 0.0,
            seq,
        };
        if self.entries.insert(id.clone(), (tracked, handler)).is_some() {
            tracing::warn!("Client order id {} reused; previous entry replaced", id);
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&TrackedOrder> {
        self.entries.get(client_id).map(|(t, _)| t)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.entries.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop an entry without notifying anyone (placement never reached the venue)
    pub fn remove(&mut self, client_id: &str) -> Option<(TrackedOrder, OrderHandler)> {
        self.entries.remove(client_id)
    }

    /// Apply an amendment to an open order
    pub fn amend(&mut self, client_id: &str, amendment: &Amendment) -> Option<&TrackedOrder> {
        let (tracked, _) = self.entries.get_mut(client_id)?;
        if !tracked.status.is_open() {
            return None;
        }
        tracked.order.apply_amendment(amendment);
        Some(tracked)
    }

    /// Open orders, oldest first
    pub fn open_orders(&self) -> Vec<&TrackedOrder> {
        let mut orders: Vec<&TrackedOrder> = self
            .entries
            .values()
            .map(|(t, _)| t)
            .filter(|t| t.status.is_open())
            .collect();
        orders.sort_by_key(|t| t.seq);
        orders
    }

    /// Open orders whose client id starts with `prefix`, oldest first
    pub fn find_by_prefix(&self, prefix: &str) -> Vec<&TrackedOrder> {
        self.open_orders()
            .into_iter()
            .filter(|t| t.order.client_id.starts_with(prefix))
            .collect()
    }

    /// Apply a status update. Returns None for unknown orders and invalid transitions.
    pub fn apply(&mut self, update: &OrderUpdate) -> Option<Dispatch> {
        let (tracked, _) = self.entries.get_mut(&update.client_id)?;

        let mut update = update.clone();
        if is_post_only_race(&update) {
            tracing::info!(
                "Post-only order {} would have crossed the book; treating cancel as rejection",
                update.client_id
            );
            update.status = OrderStatus::Rejected;
        }

        if update.status != tracked.status && !tracked.status.can_transition_to(update.status) {
            tracing::debug!(
                "Ignoring {} -> {} for {}",
                tracked.status,
                update.status,
                update.client_id
            );
            return None;
        }

        let fill_qty = (update.filled_qty - tracked.filled_qty).max(0.0);
        let fill_price = if fill_qty > 0.0 {
            let notional_after = update.avg_fill_price * update.filled_qty;
            let notional_before = tracked.avg_fill_price * tracked.filled_qty;
            (notional_after - notional_before) / fill_qty
        } else {
            0.0
        };

        tracked.status = update.status;
        if update.filled_qty >= tracked.filled_qty {
            tracked.filled_qty = update.filled_qty;
            tracked.avg_fill_price = update.avg_fill_price;
        }

        let terminal = update.status.is_terminal();
        let handler = if terminal {
            let (_, handler) = self.entries.remove(&update.client_id)?;
            handler
        } else {
            let (_, handler) = self.entries.get(&update.client_id)?;
            handler.clone()
        };

        Some(Dispatch {
            update,
            handler,
            terminal,
            fill_qty,
            fill_price,
        })
    }
}

fn is_post_only_race(update: &OrderUpdate) -> bool {
    update.status == OrderStatus::Canceled
        && update.post_only
        && update
            .reject_reason
            .as_deref()
            .is_some_and(|r| r.contains(POST_ONLY_CROSS_REASON))
        && (update.updated_at - update.created_at).num_milliseconds() <= POST_ONLY_RACE_WINDOW_MS
}
